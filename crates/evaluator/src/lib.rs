//! The recursive pull engine: `render_region` walks the graph from an output
//! node down through its inputs, computing only the pixels actually needed
//! for the requested rectangle at each node (spec §4.3, §4.4).
//!
//! Region of definition and identity are memoized per node through
//! [`ActionCache`]; tile state (who is rendering what) is coordinated per
//! image through `image_store`'s tri-map. Thread safety of the actual
//! `Effect::render` call is handled by [`TileDispatcher`].

mod dispatch;
mod planning;

use std::collections::HashMap;
use std::sync::Arc;

use action_cache::ActionCache;
use image_store::{Image, ImageStore};
use model::{canonical_to_pixel_enclosing, PixelAspectRatio, PixelRect};
use rayon::prelude::*;
use render_context::RenderContext;
use render_protocol::{
    ComponentSet, Effect, EffectSafety, IdentityVerdict, ImageKey, InputIndex, NodeId, PlaneId,
    PlaneRequest, RenderError, RenderInvocation, RenderStatus, Time,
};

pub use dispatch::TileDispatcher;

/// One node's view of the graph: its effect implementation, its memoized
/// action cache, its dispatcher, and its connected inputs.
pub trait GraphNode: Send + Sync {
    fn effect(&self) -> &dyn Effect;
    fn action_cache(&self) -> &ActionCache;
    fn dispatcher(&self) -> &TileDispatcher;
    fn input(&self, idx: InputIndex) -> Option<NodeId>;
}

/// The graph `render_region` pulls from. Implemented by the host application;
/// this crate never constructs or mutates a graph itself.
pub trait Graph: Send + Sync {
    fn node(&self, id: NodeId) -> &dyn GraphNode;
}

/// Owns the shared image cache and a handle to the graph being evaluated.
pub struct Evaluator {
    pub image_store: Arc<ImageStore>,
    pub graph: Arc<dyn Graph>,
}

impl Evaluator {
    pub fn new(image_store: Arc<ImageStore>, graph: Arc<dyn Graph>) -> Self {
        Self { image_store, graph }
    }

    /// Renders `requested` (in pixel space, at `ctx.mip`) for every plane in
    /// `planes`, returning the cached [`Image`] for each. Recurses into inputs
    /// as needed; short-circuits through identity chains without touching the
    /// image store at all. `bypass_cache` forces this node's own cached plane
    /// entries to be evicted and re-rendered; it is never forwarded to the
    /// regular upstream-input or plane-passthrough fetches below, which always
    /// use the cache (spec §4.3 step 8).
    pub fn render_region(
        &self,
        ctx: &RenderContext<Image>,
        node_id: NodeId,
        requested: PixelRect,
        planes: &[PlaneRequest],
        bypass_cache: bool,
    ) -> Result<HashMap<PlaneId, Arc<Image>>, RenderError> {
        if ctx.is_aborted() {
            return Err(RenderError::Aborted);
        }

        let node = self.graph.node(node_id);
        let effect = node.effect();
        let action_cache = node.action_cache();

        let node_hash = effect.node_hash(ctx.time, ctx.view);
        if node_hash != action_cache.node_hash() {
            let stale_hash = action_cache.node_hash();
            action_cache.invalidate_all(node_hash);
            self.image_store.evict_all_with_hash(stale_hash);
        }

        let rod = match action_cache.get_rod(ctx.time, ctx.view, ctx.mip) {
            Some(rod) => rod,
            None => {
                let rod = effect.region_of_definition(ctx.time, ctx.view, ctx.mip)?;
                action_cache.set_rod(ctx.time, ctx.view, ctx.mip, rod);
                rod
            }
        };

        let identity = match action_cache.get_identity(ctx.time, ctx.view, ctx.mip) {
            Some(identity) => identity,
            None => {
                let identity = effect.is_identity(ctx.time, ctx.view, ctx.mip, rod);
                action_cache.set_identity(ctx.time, ctx.view, ctx.mip, identity);
                identity
            }
        };

        match identity {
            IdentityVerdict::Input { input_idx, time } => {
                let input_node = node
                    .input(input_idx)
                    .ok_or(RenderError::MissingUpstream { input_idx })?;
                let input_ctx = with_time(ctx, time);
                return self.render_region(&input_ctx, input_node, requested, planes, bypass_cache);
            }
            IdentityVerdict::SelfAtTime(time) => {
                if time == ctx.time {
                    return Err(RenderError::InvalidRequest {
                        reason: "identity to self at the same time".to_string(),
                    });
                }
                let self_ctx = with_time(ctx, time);
                return self.render_region(&self_ctx, node_id, requested, planes, bypass_cache);
            }
            IdentityVerdict::NotIdentity => {}
        }

        let needed_and_produced = effect.needed_and_produced_planes(ctx.time, ctx.view);
        let mut out = HashMap::with_capacity(planes.len());
        let mut local_requests: Vec<&PlaneRequest> = Vec::new();

        for request in planes {
            if needed_and_produced.produced.contains(&request.plane) {
                local_requests.push(request);
                continue;
            }

            let (input_idx, passthrough_time, passthrough_view) = needed_and_produced
                .passthrough_input_and_time_view
                .ok_or_else(|| RenderError::InvalidRequest {
                    reason: format!(
                        "{:?} is not produced by this node and it declares no passthrough input",
                        request.plane
                    ),
                })?;
            let input_node = node
                .input(input_idx)
                .ok_or(RenderError::MissingUpstream { input_idx })?;
            let mut input_ctx = with_time(ctx, passthrough_time);
            input_ctx.view = passthrough_view;
            let rendered = self.render_region(
                &input_ctx,
                input_node,
                requested,
                std::slice::from_ref(request),
                false,
            )?;
            if let Some(image) = rendered.get(&request.plane) {
                out.insert(request.plane.clone(), image.clone());
            }
        }

        if local_requests.is_empty() {
            return Ok(out);
        }

        let extent = canonical_to_pixel_enclosing(rod, ctx.mip, PixelAspectRatio::default());
        let clipped = requested.intersect(&extent);
        if clipped.is_empty() {
            return Err(RenderError::InvalidRequest {
                reason: "requested rect does not intersect region of definition".to_string(),
            });
        }

        for request in local_requests {
            let key = ImageKey {
                node_hash,
                plane: request.plane.clone(),
                time: ctx.time,
                view: ctx.view,
                mip: ctx.mip,
                frame_varying: false,
            };
            if bypass_cache {
                self.image_store.evict(&key);
            }
            let image = self.image_store.get_or_create(key, rod, PixelAspectRatio::default());
            self.render_into(ctx, node_id, &image, &request.plane, clipped)?;
            out.insert(request.plane.clone(), image);
        }
        Ok(out)
    }

    fn render_into(
        &self,
        ctx: &RenderContext<Image>,
        node_id: NodeId,
        image: &Arc<Image>,
        plane: &PlaneId,
        clipped: PixelRect,
    ) -> RenderStatus {
        image
            .ensure_bounds(clipped)
            .map_err(|err| RenderError::InternalInvariant {
                message: err.to_string(),
            })?;
        image.allocate_plane(plane.clone(), components_for(plane), render_protocol::BitDepth::Float);

        let plan = planning::plan_tiles(image, clipped);
        if ctx.is_aborted() {
            image.tiles().clear(&plan.to_render);
            return Err(RenderError::Aborted);
        }

        let host_tiled = self.graph.node(node_id).effect().safety() == EffectSafety::HostTiled;
        if host_tiled && plan.to_render.len() > 1 {
            // The effect promises re-entrancy across threads for a single
            // invocation, so the host (us) is responsible for actually
            // splitting the tile rectangle across worker threads instead of
            // walking it on the calling thread like every other safety mode.
            let results: Vec<(usize, RenderStatus)> = plan
                .to_render
                .par_iter()
                .map(|&tile| (tile, self.render_tile(ctx, node_id, image, plane, tile)))
                .collect();

            let mut first_err = None;
            for (tile, result) in results {
                if let Err(err) = result {
                    image.mark_render_failed(ctx.render_age);
                    image.tiles().clear(&[tile]);
                    first_err.get_or_insert(err);
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
        } else {
            for tile in &plan.to_render {
                if let Err(err) = self.render_tile(ctx, node_id, image, plane, *tile) {
                    image.mark_render_failed(ctx.render_age);
                    image.tiles().clear(&[*tile]);
                    return Err(err);
                }
            }
        }

        image.tiles().wait_until_done_elsewhere(&plan.to_wait_for);
        if image.is_render_failed(ctx.render_age) {
            return Err(RenderError::PluginFailure {
                message: "upstream tile render failed for this render age".to_string(),
            });
        }
        Ok(())
    }

    fn render_tile(
        &self,
        ctx: &RenderContext<Image>,
        node_id: NodeId,
        image: &Arc<Image>,
        plane: &PlaneId,
        tile: usize,
    ) -> RenderStatus {
        let node = self.graph.node(node_id);
        let effect = node.effect();
        let tile_rect = image.tile_rect(tile);
        let tile_canonical = model::pixel_to_canonical(tile_rect, ctx.mip, PixelAspectRatio::default());

        let rois = effect.regions_of_interest(ctx.time, ctx.view, ctx.mip, tile_canonical);
        let frames_needed = effect.frames_needed(ctx.time, ctx.view);
        let mut tile_ctx = ctx.clone();

        for (input_idx, roi) in &rois {
            let input_node = match node.input(*input_idx) {
                Some(n) => n,
                None => continue,
            };
            let input_time = frames_needed
                .get(input_idx)
                .and_then(|per_view| per_view.get(&ctx.view))
                .and_then(|ranges| ranges.first())
                .map(|range| Time::new(range.first.0 as f64))
                .unwrap_or(ctx.time);
            let input_rect = canonical_to_pixel_enclosing(*roi, ctx.mip, PixelAspectRatio::default());
            let input_ctx = with_time(&tile_ctx, input_time);
            let rendered = self.render_region(
                &input_ctx,
                input_node,
                input_rect,
                std::slice::from_ref(&PlaneRequest {
                    plane: plane.clone(),
                    bit_depth: render_protocol::BitDepth::Float,
                }),
                false,
            )?;
            if let Some(input_image) = rendered.get(plane) {
                tile_ctx.hold_input(input_image.clone());
            }
        }

        let mut tile_buffer = render_protocol::PlaneBuffer {
            components: components_for(plane),
            bit_depth: render_protocol::BitDepth::Float,
            bounds: tile_rect,
            data: Vec::new(),
        };
        let area = tile_rect.width().max(0) as usize * tile_rect.height().max(0) as usize;
        tile_buffer.data = vec![0u8; tile_buffer.bytes_per_pixel() * area];

        let mut invocation = RenderInvocation {
            time: ctx.time,
            view: ctx.view,
            render_scale: ctx.mip,
            rect: tile_rect,
            planes_out: std::slice::from_mut(&mut tile_buffer),
            is_sequential: ctx.is_sequential,
            is_interactive: ctx.is_interactive,
        };

        node.dispatcher().invoke(effect, &mut invocation)?;
        image
            .write_tile(plane, &tile_buffer)
            .map_err(|err| RenderError::InternalInvariant {
                message: err.to_string(),
            })?;
        image.tiles().mark_rendered(&[tile]);
        Ok(())
    }
}

fn with_time(ctx: &RenderContext<Image>, time: Time) -> RenderContext<Image> {
    let mut next = ctx.clone();
    next.time = time;
    next
}

fn components_for(plane: &PlaneId) -> ComponentSet {
    match plane {
        PlaneId::Color(components) => *components,
        PlaneId::Named(_) => ComponentSet::Rgba,
    }
}
