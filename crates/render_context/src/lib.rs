//! The explicit render context threaded through `render_region` and snapshotted
//! into every worker it dispatches to. There is no thread-local or global
//! ambient state here by design (spec §9 design notes): a context is a value,
//! passed by reference down the call tree and cloned with overrides when
//! recursing into an input.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use model::CanonicalRect;
use render_protocol::{FrameIndex, InputIndex, MipmapLevel, Time, ViewId};

/// A cooperative abort flag shared by every context derived from the same
/// root render. Checked at tile granularity; never forcibly interrupts a
/// thread mid-tile.
#[derive(Clone)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arms a signal for a fresh run. Only safe once every context derived
    /// from the previous raise has been dropped; a `RenderEngine` calls this
    /// at the start of `run()`, before handing the signal to a new scheduler
    /// or any worker context.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonically increasing render-age counter. Bumped each time a render is
/// aborted and restarted, so stale results (a `render_failed` flag, a
/// late-arriving tile write) can be told apart from the current attempt.
pub struct RenderAgeCounter(AtomicU64);

impl RenderAgeCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for RenderAgeCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a node's `render_region` call needs to know about the request it
/// is answering, plus what it must pass down unchanged (or overridden) to its
/// own recursive calls into its inputs. Generic over the held-input-image type
/// so this crate does not depend on `image_store`.
pub struct RenderContext<Img> {
    pub time: Time,
    pub view: ViewId,
    pub mip: MipmapLevel,
    pub node_hash: u64,
    pub render_age: u64,
    pub is_sequential: bool,
    pub is_interactive: bool,
    pub can_abort: bool,
    pub first_frame: FrameIndex,
    pub last_frame: FrameIndex,
    pub region_of_interest: HashMap<InputIndex, CanonicalRect>,
    held_inputs: Vec<Arc<Img>>,
    abort: AbortSignal,
}

// Not `#[derive(Clone)]`: that would add an `Img: Clone` bound to the impl even
// though `Vec<Arc<Img>>` clones regardless of whether `Img` does.
impl<Img> Clone for RenderContext<Img> {
    fn clone(&self) -> Self {
        Self {
            time: self.time,
            view: self.view,
            mip: self.mip,
            node_hash: self.node_hash,
            render_age: self.render_age,
            is_sequential: self.is_sequential,
            is_interactive: self.is_interactive,
            can_abort: self.can_abort,
            first_frame: self.first_frame,
            last_frame: self.last_frame,
            region_of_interest: self.region_of_interest.clone(),
            held_inputs: self.held_inputs.clone(),
            abort: self.abort.clone(),
        }
    }
}

impl<Img> RenderContext<Img> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        time: Time,
        view: ViewId,
        mip: MipmapLevel,
        node_hash: u64,
        render_age: u64,
        is_sequential: bool,
        is_interactive: bool,
        can_abort: bool,
        first_frame: FrameIndex,
        last_frame: FrameIndex,
        abort: AbortSignal,
    ) -> Self {
        Self {
            time,
            view,
            mip,
            node_hash,
            render_age,
            is_sequential,
            is_interactive,
            can_abort,
            first_frame,
            last_frame,
            region_of_interest: HashMap::new(),
            held_inputs: Vec::new(),
            abort,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.can_abort && self.abort.is_raised()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Derives the context for a recursive call into `node_hash`, carrying the
    /// same time/view/scale/render-age/abort-signal but a fresh region-of-
    /// interest map and no held inputs of its own.
    pub fn for_input(&self, node_hash: u64, region_of_interest: HashMap<InputIndex, CanonicalRect>) -> Self {
        Self {
            node_hash,
            region_of_interest,
            held_inputs: Vec::new(),
            ..self.clone()
        }
    }

    /// Keeps `image` alive for the duration of this call. Used so an input
    /// image fetched early in a node's `render` is not evicted by the image
    /// store before the node finishes compositing with it.
    pub fn hold_input(&mut self, image: Arc<Img>) {
        self.held_inputs.push(image);
    }

    pub fn held_inputs(&self) -> &[Arc<Img>] {
        &self.held_inputs
    }
}
