//! Content-addressed storage for rendered plane images, plus the tri-map tile
//! coordinator that lets concurrent render threads agree on which tiles of an
//! image are unrendered, already being rendered by someone else, or done.
//!
//! An [`Image`]'s tile grid is sized once, at creation, to the pixel rectangle
//! enclosing its region of definition (its maximal possible extent). The
//! image's `bounds` — how much of that extent is actually materialized in the
//! pixel buffer — starts empty and grows through [`Image::ensure_bounds`] as
//! render passes fill it in, but never exceeds the extent.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use bitvec::prelude::{BitVec, Lsb0};

use model::{canonical_to_pixel_enclosing, CanonicalRect, MipmapLevel, PixelAspectRatio, PixelRect};
use render_protocol::{ComponentSet, ImageKey, PlaneBuffer, PlaneId};

/// Tile edge length in pixels, in both dimensions.
pub const TILE_SIZE: i32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum ImageStoreError {
    #[error("requested rect {requested:?} escapes image extent {extent:?}")]
    OutOfExtent { requested: PixelRect, extent: PixelRect },
    #[error("plane {plane:?} not allocated on this image")]
    PlaneMissing { plane: PlaneId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Unrendered,
    Rendering,
    Rendered,
}

struct TriMapState {
    rendering: BitVec<usize, Lsb0>,
    rendered: BitVec<usize, Lsb0>,
}

/// Per-image three-state tile bitmap (`unrendered` / `rendering` / `rendered`)
/// with blocking wait for tiles someone else has already claimed.
pub struct TriMap {
    tiles_x: u32,
    tiles_y: u32,
    state: Mutex<TriMapState>,
    condvar: Condvar,
}

impl TriMap {
    fn new(tiles_x: u32, tiles_y: u32) -> Self {
        let count = (tiles_x as usize) * (tiles_y as usize);
        Self {
            tiles_x,
            tiles_y,
            state: Mutex::new(TriMapState {
                rendering: BitVec::repeat(false, count),
                rendered: BitVec::repeat(false, count),
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn tile_grid(&self) -> (u32, u32) {
        (self.tiles_x, self.tiles_y)
    }

    pub fn tile_count(&self) -> usize {
        (self.tiles_x as usize) * (self.tiles_y as usize)
    }

    pub fn state_of(&self, tile: usize) -> TileState {
        let state = self.state.lock().expect("tri-map mutex poisoned");
        if state.rendered[tile] {
            TileState::Rendered
        } else if state.rendering[tile] {
            TileState::Rendering
        } else {
            TileState::Unrendered
        }
    }

    /// Attempts to claim each tile in `tiles` that is currently unrendered,
    /// moving it to `Rendering`. Returns the subset actually claimed; tiles
    /// already `Rendering` or `Rendered` are left untouched and the caller
    /// should either skip them (if `Rendered`) or wait on them (if
    /// `Rendering`, via [`TriMap::wait_until_done_elsewhere`]).
    pub fn try_claim(&self, tiles: &[usize]) -> Vec<usize> {
        let mut state = self.state.lock().expect("tri-map mutex poisoned");
        let mut claimed = Vec::with_capacity(tiles.len());
        for &tile in tiles {
            if !state.rendering[tile] && !state.rendered[tile] {
                state.rendering.set(tile, true);
                claimed.push(tile);
            }
        }
        claimed
    }

    /// Moves `tiles` from `Rendering` to `Rendered` and wakes any waiters.
    pub fn mark_rendered(&self, tiles: &[usize]) {
        let mut state = self.state.lock().expect("tri-map mutex poisoned");
        for &tile in tiles {
            state.rendering.set(tile, false);
            state.rendered.set(tile, true);
        }
        drop(state);
        self.condvar.notify_all();
    }

    /// Releases a failed claim back to `Unrendered` so another thread can
    /// retry it, and wakes any waiters.
    pub fn clear(&self, tiles: &[usize]) {
        let mut state = self.state.lock().expect("tri-map mutex poisoned");
        for &tile in tiles {
            state.rendering.set(tile, false);
            state.rendered.set(tile, false);
        }
        drop(state);
        self.condvar.notify_all();
    }

    /// Blocks until none of `tiles` are `Rendering` (each is either
    /// `Rendered`, meaning the other renderer finished, or `Unrendered`,
    /// meaning it failed and released its claim).
    pub fn wait_until_done_elsewhere(&self, tiles: &[usize]) {
        let mut state = self.state.lock().expect("tri-map mutex poisoned");
        while tiles.iter().any(|&tile| state.rendering[tile]) {
            state = self
                .condvar
                .wait(state)
                .expect("tri-map condvar wait on poisoned mutex");
        }
    }
}

/// A rendered (or partially rendered) plane image, content-addressed by
/// [`ImageKey`]. `rod` and `extent` never change after creation; `bounds`
/// grows monotonically as more of `extent` is materialized.
pub struct Image {
    pub key: ImageKey,
    pub rod: CanonicalRect,
    pub par: PixelAspectRatio,
    extent: PixelRect,
    bounds: Mutex<PixelRect>,
    planes: Mutex<HashMap<PlaneId, PlaneBuffer>>,
    tiles: TriMap,
    /// The render age at which a plugin failure was recorded, if any. Scoped
    /// to a render age so an abort-and-restart doesn't carry a stale failure
    /// forward (spec §7).
    render_failed: Mutex<Option<u64>>,
}

impl Image {
    pub fn new(key: ImageKey, rod: CanonicalRect, par: PixelAspectRatio) -> Self {
        let extent = canonical_to_pixel_enclosing(rod, key.mip, par);
        let tiles_x = (extent.width().max(0) as u32).div_ceil(TILE_SIZE as u32).max(1);
        let tiles_y = (extent.height().max(0) as u32).div_ceil(TILE_SIZE as u32).max(1);
        Self {
            key,
            rod,
            par,
            extent,
            bounds: Mutex::new(PixelRect::EMPTY),
            planes: Mutex::new(HashMap::new()),
            tiles: TriMap::new(tiles_x, tiles_y),
            render_failed: Mutex::new(None),
        }
    }

    pub fn extent(&self) -> PixelRect {
        self.extent
    }

    pub fn bounds(&self) -> PixelRect {
        *self.bounds.lock().expect("image bounds mutex poisoned")
    }

    pub fn tiles(&self) -> &TriMap {
        &self.tiles
    }

    /// The tile indices overlapping `rect`, clipped to the image's extent.
    pub fn tiles_covering(&self, rect: PixelRect) -> Vec<usize> {
        let clipped = rect.intersect(&self.extent);
        if clipped.is_empty() {
            return Vec::new();
        }
        let (tiles_x, _) = self.tiles.tile_grid();
        let x0 = (clipped.x1 - self.extent.x1).div_euclid(TILE_SIZE);
        let y0 = (clipped.y1 - self.extent.y1).div_euclid(TILE_SIZE);
        let x1 = (clipped.x2 - 1 - self.extent.x1).div_euclid(TILE_SIZE);
        let y1 = (clipped.y2 - 1 - self.extent.y1).div_euclid(TILE_SIZE);
        let mut out = Vec::new();
        for ty in y0..=y1 {
            for tx in x0..=x1 {
                out.push((ty as usize) * (tiles_x as usize) + tx as usize);
            }
        }
        out
    }

    /// The pixel rectangle covered by tile index `tile`, clipped to `extent`.
    pub fn tile_rect(&self, tile: usize) -> PixelRect {
        let (tiles_x, _) = self.tiles.tile_grid();
        let tx = (tile % tiles_x as usize) as i32;
        let ty = (tile / tiles_x as usize) as i32;
        let rect = PixelRect::new(
            self.extent.x1 + tx * TILE_SIZE,
            self.extent.y1 + ty * TILE_SIZE,
            self.extent.x1 + (tx + 1) * TILE_SIZE,
            self.extent.y1 + (ty + 1) * TILE_SIZE,
        );
        rect.intersect(&self.extent)
    }

    /// Grows `bounds` to cover `requested`, which must lie within `extent`.
    /// Existing plane data is preserved; newly-covered area is zero-filled.
    pub fn ensure_bounds(&self, requested: PixelRect) -> Result<(), ImageStoreError> {
        if !self.extent.contains(&requested) {
            return Err(ImageStoreError::OutOfExtent {
                requested,
                extent: self.extent,
            });
        }
        let mut bounds = self.bounds.lock().expect("image bounds mutex poisoned");
        let grown = bounds.union(&requested);
        if grown == *bounds {
            return Ok(());
        }
        let mut planes = self.planes.lock().expect("image planes mutex poisoned");
        for buffer in planes.values_mut() {
            *buffer = grow_plane_buffer(buffer, grown);
        }
        *bounds = grown;
        Ok(())
    }

    pub fn allocate_plane(&self, plane: PlaneId, components: ComponentSet, bit_depth: render_protocol::BitDepth) {
        let bounds = self.bounds();
        let mut planes = self.planes.lock().expect("image planes mutex poisoned");
        planes.entry(plane).or_insert_with(|| {
            let bytes_per_pixel = match (components, bit_depth) {
                (ComponentSet::Rgba, render_protocol::BitDepth::Float) => 16,
                _ => 4,
            };
            PlaneBuffer {
                components,
                bit_depth,
                bounds,
                data: vec![0u8; bytes_per_pixel * bounds.width().max(0) as usize * bounds.height().max(0) as usize],
            }
        });
    }

    pub fn read_plane(&self, plane: &PlaneId) -> Option<PlaneBuffer> {
        self.planes.lock().expect("image planes mutex poisoned").get(plane).cloned()
    }

    /// Blits a fully-rendered tile's worth of pixels into the plane buffer.
    /// `tile` must already be covered by `bounds` (call `ensure_bounds` first).
    pub fn write_tile(&self, plane: &PlaneId, tile: &PlaneBuffer) -> Result<(), ImageStoreError> {
        let mut planes = self.planes.lock().expect("image planes mutex poisoned");
        let target = planes
            .get_mut(plane)
            .ok_or_else(|| ImageStoreError::PlaneMissing { plane: plane.clone() })?;
        blit(target, tile);
        Ok(())
    }

    pub fn mark_render_failed(&self, render_age: u64) {
        *self.render_failed.lock().expect("render-failed mutex poisoned") = Some(render_age);
    }

    /// Whether this image is marked failed for `render_age`. A failure
    /// recorded under a stale render age (an abort that has since been
    /// superseded) does not count.
    pub fn is_render_failed(&self, render_age: u64) -> bool {
        *self.render_failed.lock().expect("render-failed mutex poisoned") == Some(render_age)
    }

    pub fn clear_render_failed(&self) {
        *self.render_failed.lock().expect("render-failed mutex poisoned") = None;
    }
}

fn grow_plane_buffer(existing: &PlaneBuffer, new_bounds: PixelRect) -> PlaneBuffer {
    let bytes_per_pixel = existing.bytes_per_pixel();
    let mut data = vec![0u8; bytes_per_pixel * new_bounds.width().max(0) as usize * new_bounds.height().max(0) as usize];
    let stride = new_bounds.width().max(0) as usize * bytes_per_pixel;
    let old_stride = existing.bounds.width().max(0) as usize * bytes_per_pixel;
    for y in existing.bounds.y1..existing.bounds.y2 {
        let src_row = (y - existing.bounds.y1) as usize;
        let dst_row = (y - new_bounds.y1) as usize;
        let src_start = src_row * old_stride;
        let dst_col_offset = (existing.bounds.x1 - new_bounds.x1) as usize * bytes_per_pixel;
        let dst_start = dst_row * stride + dst_col_offset;
        data[dst_start..dst_start + old_stride].copy_from_slice(&existing.data[src_start..src_start + old_stride]);
    }
    PlaneBuffer {
        components: existing.components,
        bit_depth: existing.bit_depth,
        bounds: new_bounds,
        data,
    }
}

fn blit(target: &mut PlaneBuffer, tile: &PlaneBuffer) {
    let bytes_per_pixel = target.bytes_per_pixel();
    let target_stride = target.bounds.width().max(0) as usize * bytes_per_pixel;
    let tile_stride = tile.bounds.width().max(0) as usize * bytes_per_pixel;
    for y in tile.bounds.y1..tile.bounds.y2 {
        let tile_row = (y - tile.bounds.y1) as usize;
        let target_row = (y - target.bounds.y1) as usize;
        let src_start = tile_row * tile_stride;
        let dst_col_offset = (tile.bounds.x1 - target.bounds.x1) as usize * bytes_per_pixel;
        let dst_start = target_row * target_stride + dst_col_offset;
        target.data[dst_start..dst_start + tile_stride].copy_from_slice(&tile.data[src_start..src_start + tile_stride]);
    }
}

/// Content-addressed cache of [`Image`]s, shared by every render thread.
pub struct ImageStore {
    images: Mutex<HashMap<ImageKey, std::sync::Arc<Image>>>,
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStore {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &ImageKey) -> Option<std::sync::Arc<Image>> {
        self.images.lock().expect("image store mutex poisoned").get(key).cloned()
    }

    /// Returns the existing image for `key`, or creates and inserts a fresh
    /// one bound to `rod`. The region of definition given at first creation
    /// wins for the lifetime of the entry.
    pub fn get_or_create(
        &self,
        key: ImageKey,
        rod: CanonicalRect,
        par: PixelAspectRatio,
    ) -> std::sync::Arc<Image> {
        let mut images = self.images.lock().expect("image store mutex poisoned");
        images
            .entry(key.clone())
            .or_insert_with(|| std::sync::Arc::new(Image::new(key, rod, par)))
            .clone()
    }

    pub fn evict(&self, key: &ImageKey) -> Option<std::sync::Arc<Image>> {
        self.images.lock().expect("image store mutex poisoned").remove(key)
    }

    /// Evicts every cached image produced by `node_hash`. Used when a node's
    /// parameters change and its previous hash's outputs are no longer valid.
    pub fn evict_all_with_hash(&self, node_hash: u64) {
        self.images
            .lock()
            .expect("image store mutex poisoned")
            .retain(|key, _| key.node_hash != node_hash);
    }

    pub fn len(&self) -> usize {
        self.images.lock().expect("image store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_protocol::{BitDepth, Time, ViewId};

    fn key() -> ImageKey {
        ImageKey {
            node_hash: 1,
            plane: PlaneId::Color(ComponentSet::Rgba),
            time: Time::new(1.0),
            view: ViewId(0),
            mip: MipmapLevel::FULL,
            frame_varying: false,
        }
    }

    #[test]
    fn tri_map_claim_then_mark_rendered() {
        let image = Image::new(key(), CanonicalRect::new(0.0, 0.0, 300.0, 300.0), PixelAspectRatio::default());
        let tiles = image.tiles_covering(PixelRect::new(0, 0, 10, 10));
        let claimed = image.tiles().try_claim(&tiles);
        assert_eq!(claimed, tiles);

        let reclaim = image.tiles().try_claim(&tiles);
        assert!(reclaim.is_empty(), "already-rendering tiles must not be reclaimed");

        image.tiles().mark_rendered(&tiles);
        for &tile in &tiles {
            assert_eq!(image.tiles().state_of(tile), TileState::Rendered);
        }
    }

    #[test]
    fn tri_map_clear_releases_failed_claim() {
        let image = Image::new(key(), CanonicalRect::new(0.0, 0.0, 300.0, 300.0), PixelAspectRatio::default());
        let tiles = image.tiles_covering(PixelRect::new(0, 0, 10, 10));
        image.tiles().try_claim(&tiles);
        image.tiles().clear(&tiles);
        for &tile in &tiles {
            assert_eq!(image.tiles().state_of(tile), TileState::Unrendered);
        }
    }

    #[test]
    fn ensure_bounds_rejects_rect_outside_extent() {
        let image = Image::new(key(), CanonicalRect::new(0.0, 0.0, 100.0, 100.0), PixelAspectRatio::default());
        let result = image.ensure_bounds(PixelRect::new(0, 0, 1000, 1000));
        assert!(matches!(result, Err(ImageStoreError::OutOfExtent { .. })));
    }

    #[test]
    fn ensure_bounds_preserves_existing_plane_data_on_growth() {
        let image = Image::new(key(), CanonicalRect::new(0.0, 0.0, 200.0, 200.0), PixelAspectRatio::default());
        image.ensure_bounds(PixelRect::new(0, 0, 10, 10)).unwrap();
        image.allocate_plane(PlaneId::Color(ComponentSet::Rgba), ComponentSet::Rgba, BitDepth::U8);

        let mut tile = image.read_plane(&PlaneId::Color(ComponentSet::Rgba)).unwrap();
        tile.data.fill(7);
        image.write_tile(&PlaneId::Color(ComponentSet::Rgba), &tile).unwrap();

        image.ensure_bounds(PixelRect::new(0, 0, 20, 20)).unwrap();
        let grown = image.read_plane(&PlaneId::Color(ComponentSet::Rgba)).unwrap();
        assert_eq!(grown.bounds, PixelRect::new(0, 0, 20, 20));
        assert_eq!(grown.data[0], 7);
    }

    #[test]
    fn image_store_reuses_existing_entry_for_same_key() {
        let store = ImageStore::new();
        let a = store.get_or_create(key(), CanonicalRect::new(0.0, 0.0, 10.0, 10.0), PixelAspectRatio::default());
        let b = store.get_or_create(key(), CanonicalRect::new(0.0, 0.0, 9999.0, 9999.0), PixelAspectRatio::default());
        assert_eq!(a.rod, b.rod, "first write's rod wins for this entry's lifetime");
    }

    #[test]
    fn evict_all_with_hash_drops_matching_entries_only() {
        let store = ImageStore::new();
        let mut other_key = key();
        other_key.node_hash = 2;
        store.get_or_create(key(), CanonicalRect::new(0.0, 0.0, 1.0, 1.0), PixelAspectRatio::default());
        store.get_or_create(other_key.clone(), CanonicalRect::new(0.0, 0.0, 1.0, 1.0), PixelAspectRatio::default());

        store.evict_all_with_hash(1);

        assert!(store.get(&key()).is_none());
        assert!(store.get(&other_key).is_some());
    }
}
