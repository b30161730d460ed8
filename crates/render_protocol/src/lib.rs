//! Wire-level data model shared between the render core and the external
//! collaborators it pulls from: the `Effect` trait every graph node implements,
//! the `OutputDevice` trait every viewer/writer implements, and the plain data
//! types (`ImageKey`, `PlaneId`, render status/error enums) that cross those
//! boundaries.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use model::{CanonicalRect, MipmapLevel, PixelRect};

slotmap::new_key_type! {
    /// Identifies a node in the host's graph. Opaque to this core.
    pub struct NodeId;
}

/// Index of an input pin on a node (0-based).
pub type InputIndex = u32;

/// A continuous evaluation time, as used by `render_region` and the `Effect`
/// queries. Not derived `Eq`/`Hash` on raw `f64`; compares and hashes on bit
/// pattern so it can key the `ActionCache` and `ImageKey` maps.
#[derive(Debug, Clone, Copy)]
pub struct Time(f64);

impl Time {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Time {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for Time {}

impl Hash for Time {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

/// An integer frame index, used by the output scheduler and by
/// `Effect::time_domain` / `Effect::frames_needed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRange {
    pub first: FrameIndex,
    pub last: FrameIndex,
}

/// A view index in a multi-view (e.g. stereo) project. `0` is the main view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ViewId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentSet {
    Rgba,
    Rgb,
    Alpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BitDepth {
    U8,
    U16,
    Half,
    Float,
}

/// The color plane, or a named auxiliary plane (motion vectors, depth, ...). Only
/// the color plane allows component-set conversion on a cache hit; auxiliary
/// planes require an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlaneId {
    Color(ComponentSet),
    Named(String),
}

impl PlaneId {
    pub fn is_color(&self) -> bool {
        matches!(self, PlaneId::Color(_))
    }
}

/// The full key of a memoized/cached plane image: the node producing it, the
/// plane, and the render coordinates it was produced at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub node_hash: u64,
    pub plane: PlaneId,
    pub time: Time,
    pub view: ViewId,
    pub mip: MipmapLevel,
    pub frame_varying: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectSafety {
    Unsafe,
    InstanceSafe,
    FullySafe,
    HostTiled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequentialPreference {
    Any,
    Only,
    Not,
}

/// Replaces the dynamic-cast-based discrimination of node kinds in the
/// original plugin base class (spec §9 design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Reader,
    Writer,
    Viewer,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStopCode {
    Finished,
    Aborted,
    Failed,
}

/// A node's declared answer to "is my output identical to one of my inputs, or
/// to myself at a different time". `input_idx = -2` in the original protocol is
/// represented here as `SelfAtTime`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdentityVerdict {
    NotIdentity,
    Input { input_idx: InputIndex, time: Time },
    SelfAtTime(Time),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeededProducedPlanes {
    pub needed_per_input: HashMap<InputIndex, HashSet<PlaneId>>,
    pub produced: HashSet<PlaneId>,
    pub passthrough_input_and_time_view: Option<(InputIndex, Time, ViewId)>,
}

/// One plane a caller of `render_region` is asking for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaneRequest {
    pub plane: PlaneId,
    pub bit_depth: BitDepth,
}

/// A fully decoded pixel plane as produced by `Effect::render` or delivered to an
/// `OutputDevice`. `image_store` wraps this with a tile bitmap and bounds-growth
/// semantics (spec §3 "Image"); this type only carries the rendered bytes.
#[derive(Debug, Clone)]
pub struct PlaneBuffer {
    pub components: ComponentSet,
    pub bit_depth: BitDepth,
    pub bounds: PixelRect,
    pub data: Vec<u8>,
}

impl PlaneBuffer {
    pub fn bytes_per_pixel(&self) -> usize {
        let channels = match self.components {
            ComponentSet::Rgba => 4,
            ComponentSet::Rgb => 3,
            ComponentSet::Alpha => 1,
        };
        let bytes_per_channel = match self.bit_depth {
            BitDepth::U8 => 1,
            BitDepth::U16 | BitDepth::Half => 2,
            BitDepth::Float => 4,
        };
        channels * bytes_per_channel
    }
}

/// The three outcomes of `render_region` and of a tile render. `Aborted` is
/// distinguished from `Failed` because only a plugin failure marks an image's
/// `render_failed` flag (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("render aborted")]
    Aborted,
    #[error("plugin render failed: {message}")]
    PluginFailure { message: String },
    #[error("pixel buffer allocation failed")]
    AllocationFailure,
    #[error("identity resolves to unconnected input {input_idx}")]
    MissingUpstream { input_idx: InputIndex },
    #[error("invalid render request: {reason}")]
    InvalidRequest { reason: String },
    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },
}

pub type RenderStatus = Result<(), RenderError>;

/// Arguments passed to `Effect::render` for one tile of one plane.
pub struct RenderInvocation<'a> {
    pub time: Time,
    pub view: ViewId,
    pub render_scale: MipmapLevel,
    pub rect: PixelRect,
    pub planes_out: &'a mut [PlaneBuffer],
    pub is_sequential: bool,
    pub is_interactive: bool,
}

/// The effect interface implemented by every node in the graph (spec §6). All
/// queries except `render` and the sequence brackets are meant to be cheap and
/// side-effect free from the node's point of view; the core is responsible for
/// memoizing them per render through `ActionCache`.
pub trait Effect: Send + Sync {
    fn node_hash(&self, time: Time, view: ViewId) -> u64;

    fn region_of_definition(
        &self,
        time: Time,
        view: ViewId,
        mip: MipmapLevel,
    ) -> Result<CanonicalRect, RenderError>;

    fn regions_of_interest(
        &self,
        time: Time,
        view: ViewId,
        mip: MipmapLevel,
        out_rect: CanonicalRect,
    ) -> HashMap<InputIndex, CanonicalRect>;

    fn frames_needed(
        &self,
        time: Time,
        view: ViewId,
    ) -> HashMap<InputIndex, HashMap<ViewId, Vec<FrameRange>>>;

    fn is_identity(
        &self,
        time: Time,
        view: ViewId,
        mip: MipmapLevel,
        rod: CanonicalRect,
    ) -> IdentityVerdict;

    fn time_domain(&self) -> FrameRange;

    fn available_planes(&self, time: Time) -> HashSet<PlaneId>;

    fn needed_and_produced_planes(&self, time: Time, view: ViewId) -> NeededProducedPlanes;

    fn render(&self, invocation: &mut RenderInvocation<'_>) -> RenderStatus;

    fn supports_tiles(&self) -> bool;
    fn supports_multiresolution(&self) -> bool;
    fn supports_render_scale(&self) -> bool;
    fn safety(&self) -> EffectSafety;
    fn kind(&self) -> NodeKind;

    fn is_writer(&self) -> bool {
        self.kind() == NodeKind::Writer
    }

    fn is_reader(&self) -> bool {
        self.kind() == NodeKind::Reader
    }

    fn sequential_preference(&self) -> SequentialPreference;
    fn input_count(&self) -> usize;

    fn begin_sequence(
        &self,
        _first: FrameIndex,
        _last: FrameIndex,
        _step: i64,
        _interactive: bool,
        _scale: MipmapLevel,
        _view: ViewId,
    ) {
    }

    fn end_sequence(&self) {}
}

/// The output device interface consumed by the `OutputScheduler` (spec §6).
pub trait OutputDevice: Send + Sync {
    fn deliver(&self, time: Time, view: ViewId, planes: Vec<PlaneBuffer>);
    fn timeline_step(&self, direction: Direction);
    fn timeline_goto(&self, time: Time);
    fn timeline_get_time(&self) -> Time;
    fn frame_range_to_render(&self) -> FrameRange;
    fn on_render_started(&self);
    fn on_render_stopped(&self, code: RenderStopCode);

    fn report_fps(&self, _actual: f64, _desired: f64) {}
    fn report_frame_rendered(&self, _time: FrameIndex) {}
    fn report_failure(&self, _message: String) {}
}
