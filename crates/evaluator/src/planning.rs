//! Turns a requested pixel rectangle into which of an image's tiles this
//! caller must render itself, versus which are already claimed by another
//! thread and must be waited on.

use std::collections::HashSet;

use image_store::Image;
use model::PixelRect;

#[derive(Debug, Default)]
pub(crate) struct TilePlan {
    pub(crate) to_render: Vec<usize>,
    pub(crate) to_wait_for: Vec<usize>,
}

pub(crate) fn plan_tiles(image: &Image, requested: PixelRect) -> TilePlan {
    let tiles = image.tiles_covering(requested);
    let claimed: HashSet<usize> = image.tiles().try_claim(&tiles).into_iter().collect();

    let mut plan = TilePlan::default();
    for tile in tiles {
        if claimed.contains(&tile) {
            plan.to_render.push(tile);
        } else if image.tiles().state_of(tile) != image_store::TileState::Rendered {
            plan.to_wait_for.push(tile);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{CanonicalRect, MipmapLevel, PixelAspectRatio};
    use render_protocol::{ComponentSet, ImageKey, PlaneId, Time, ViewId};

    fn image() -> Image {
        Image::new(
            ImageKey {
                node_hash: 1,
                plane: PlaneId::Color(ComponentSet::Rgba),
                time: Time::new(1.0),
                view: ViewId(0),
                mip: MipmapLevel::FULL,
                frame_varying: false,
            },
            CanonicalRect::new(0.0, 0.0, 256.0, 256.0),
            PixelAspectRatio::default(),
        )
    }

    #[test]
    fn fresh_image_plans_all_overlapping_tiles_for_render() {
        let image = image();
        let plan = plan_tiles(&image, PixelRect::new(0, 0, 10, 10));
        assert_eq!(plan.to_render.len(), 1);
        assert!(plan.to_wait_for.is_empty());
    }

    #[test]
    fn already_rendered_tile_is_skipped_entirely() {
        let image = image();
        let first = plan_tiles(&image, PixelRect::new(0, 0, 10, 10));
        image.tiles().mark_rendered(&first.to_render);

        let second = plan_tiles(&image, PixelRect::new(0, 0, 10, 10));
        assert!(second.to_render.is_empty());
        assert!(second.to_wait_for.is_empty());
    }

    #[test]
    fn tile_claimed_by_someone_else_is_waited_for_not_rerendered() {
        let image = image();
        let tiles = image.tiles_covering(PixelRect::new(0, 0, 10, 10));
        image.tiles().try_claim(&tiles);

        let plan = plan_tiles(&image, PixelRect::new(0, 0, 10, 10));
        assert!(plan.to_render.is_empty());
        assert_eq!(plan.to_wait_for, tiles);
    }
}
