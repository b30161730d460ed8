//! Command-line entry point over `render_engine` (spec §6). Project-file and
//! script formats are out of scope for this core, so `project` is accepted
//! and validated but never parsed; this binary exercises the facade with a
//! single built-in test-pattern generator node standing in for a real
//! project-loaded graph.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;

use action_cache::ActionCache;
use evaluator::{Evaluator, Graph, GraphNode, TileDispatcher};
use image_store::ImageStore;
use model::{CanonicalRect, MipmapLevel};
use render_engine::{stop_code_exit, EngineConfig, RenderEngine};
use render_protocol::{
    BitDepth, ComponentSet, Direction, Effect, EffectSafety, FrameIndex, FrameRange,
    IdentityVerdict, InputIndex, NeededProducedPlanes, NodeId, NodeKind, OutputDevice, PlaneBuffer,
    PlaneId, RenderError, RenderInvocation, RenderStatus, RenderStopCode, SequentialPreference,
    Time, ViewId,
};

#[derive(Parser)]
#[command(author, version, about = "Drive a render-core frame range to one or more writers")]
struct Arguments {
    /// Path to the project or script defining the graph to render. Not
    /// parsed by this core -- see module docs.
    project: PathBuf,

    /// Writer names to render to, comma-separated. Each gets its own output
    /// subdirectory under --output.
    #[arg(long, value_delimiter = ',', default_value = "default")]
    writers: Vec<String>,

    /// Frame range override as "first-last", e.g. "1-100". Defaults to the
    /// graph's declared time domain.
    #[arg(long)]
    frame_range: Option<String>,

    /// Worker thread count override. Defaults to the number of available
    /// CPUs.
    #[arg(long)]
    workers: Option<usize>,

    /// Batch mode: suppress interactive per-frame progress output, logging
    /// only through `tracing`.
    #[arg(long)]
    background: bool,

    /// Directory each writer's rendered frames are written under.
    #[arg(long, default_value = "target/render-output")]
    output: PathBuf,
}

/// Input-validation failures (bad path, malformed frame range) exit with
/// this code. Writer/render failures use `render_engine`'s own exit-code
/// mapping instead.
const USAGE_ERROR_EXIT_CODE: u8 = 64;

fn main() -> std::process::ExitCode {
    match run() {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("render_cli: {err:#}");
            std::process::ExitCode::from(USAGE_ERROR_EXIT_CODE)
        }
    }
}

fn run() -> Result<i32> {
    let arguments = Arguments::parse();
    install_tracing();

    let cache_root = std::env::var_os("RENDER_CORE_CACHE_ROOT").map(PathBuf::from);
    let ocio_config = std::env::var_os("RENDER_CORE_OCIO_CONFIG").map(PathBuf::from);
    tracing::info!(?cache_root, ?ocio_config, "environment configuration (opaque to this core)");

    fs::metadata(&arguments.project)
        .with_context(|| format!("project/script path {} is not accessible", arguments.project.display()))?;

    let mut keys = slotmap::SlotMap::<NodeId, ()>::with_key();
    let node_id = keys.insert(());
    let graph = Arc::new(TestPatternGraph::new());
    let default_range = graph.node(node_id).effect().time_domain();

    let frame_range = match &arguments.frame_range {
        Some(raw) => parse_frame_range(raw)?,
        None => default_range,
    };
    let worker_count = arguments.workers.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

    let image_store = Arc::new(ImageStore::new());
    let evaluator = Arc::new(Evaluator::new(image_store, graph));

    let mut worst_exit_code = 0;
    for writer in &arguments.writers {
        let device = Arc::new(FileWriterDevice::new(writer.clone(), arguments.output.clone(), frame_range));
        let engine = RenderEngine::new(
            evaluator.clone(),
            device.clone(),
            node_id,
            EngineConfig {
                worker_count,
                buffer_capacity: worker_count.max(1),
                mip: MipmapLevel::FULL,
                view: ViewId(0),
                bit_depth: BitDepth::U8,
            },
        );

        if !arguments.background {
            println!("rendering {writer}: frames {}-{}", frame_range.first.0, frame_range.last.0);
        }
        let stop_code = engine.run();
        let error = device.take_error();
        if let Some(error) = &error {
            tracing::warn!(%writer, %error, "writer reported a failure");
        }
        let exit_code = writer_exit_code(stop_code, error.is_some());
        worst_exit_code = worst_exit_code.max(exit_code);
    }

    Ok(worst_exit_code)
}

fn writer_exit_code(stop_code: RenderStopCode, writer_failed: bool) -> i32 {
    if writer_failed {
        2
    } else {
        stop_code_exit(stop_code)
    }
}

fn install_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("RENDER_CORE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_frame_range(raw: &str) -> Result<FrameRange> {
    let (first, last) = raw
        .split_once('-')
        .with_context(|| format!("frame range '{raw}' is not of the form first-last"))?;
    let first: i64 = first.trim().parse().with_context(|| format!("invalid frame range start '{first}'"))?;
    let last: i64 = last.trim().parse().with_context(|| format!("invalid frame range end '{last}'"))?;
    anyhow::ensure!(first <= last, "frame range start {first} is after end {last}");
    Ok(FrameRange {
        first: FrameIndex(first),
        last: FrameIndex(last),
    })
}

/// Writes each delivered plane to a raw file under `<output>/<writer>/`.
/// Real writer plugins (EXR, DPX, ...) are out of scope; this is the minimal
/// concrete `OutputDevice` needed to drive the facade end to end.
struct FileWriterDevice {
    name: String,
    output_root: PathBuf,
    frame_range: FrameRange,
    error: Mutex<Option<String>>,
}

impl FileWriterDevice {
    fn new(name: String, output_root: PathBuf, frame_range: FrameRange) -> Self {
        Self {
            name,
            output_root,
            frame_range,
            error: Mutex::new(None),
        }
    }

    fn take_error(&self) -> Option<String> {
        self.error.lock().expect("writer error mutex poisoned").take()
    }

    fn record_error(&self, message: String) {
        *self.error.lock().expect("writer error mutex poisoned") = Some(message);
    }
}

impl OutputDevice for FileWriterDevice {
    fn deliver(&self, time: Time, _view: ViewId, planes: Vec<PlaneBuffer>) {
        let frame_dir = self.output_root.join(&self.name);
        if let Err(err) = fs::create_dir_all(&frame_dir) {
            self.record_error(format!("create output directory {}: {err}", frame_dir.display()));
            return;
        }
        for (index, plane) in planes.iter().enumerate() {
            let path = frame_dir.join(format!("{:08}.{index}.raw", time.value() as i64));
            if let Err(err) = fs::write(&path, &plane.data) {
                self.record_error(format!("write {}: {err}", path.display()));
                return;
            }
        }
    }

    fn timeline_step(&self, _direction: Direction) {}
    fn timeline_goto(&self, _time: Time) {}

    fn timeline_get_time(&self) -> Time {
        Time::new(self.frame_range.first.0 as f64)
    }

    fn frame_range_to_render(&self) -> FrameRange {
        self.frame_range
    }

    fn on_render_started(&self) {
        tracing::info!(writer = %self.name, "render started");
    }

    fn on_render_stopped(&self, code: RenderStopCode) {
        tracing::info!(writer = %self.name, ?code, "render stopped");
    }

    fn report_fps(&self, actual: f64, desired: f64) {
        tracing::debug!(writer = %self.name, actual, desired, "fps");
    }

    fn report_frame_rendered(&self, time: FrameIndex) {
        tracing::debug!(writer = %self.name, frame = time.0, "frame delivered");
    }

    fn report_failure(&self, message: String) {
        tracing::warn!(writer = %self.name, %message, "render core reported a failure");
    }
}

/// A single generator node producing a flat-color RGBA frame over a fixed
/// time domain, standing in for a project-loaded graph.
struct TestPatternEffect;

impl Effect for TestPatternEffect {
    fn node_hash(&self, time: Time, _view: ViewId) -> u64 {
        time.value().to_bits()
    }

    fn region_of_definition(&self, _time: Time, _view: ViewId, _mip: MipmapLevel) -> Result<CanonicalRect, RenderError> {
        Ok(CanonicalRect::new(0.0, 0.0, 1920.0, 1080.0))
    }

    fn regions_of_interest(&self, _time: Time, _view: ViewId, _mip: MipmapLevel, _out_rect: CanonicalRect) -> HashMap<InputIndex, CanonicalRect> {
        HashMap::new()
    }

    fn frames_needed(&self, _time: Time, _view: ViewId) -> HashMap<InputIndex, HashMap<ViewId, Vec<FrameRange>>> {
        HashMap::new()
    }

    fn is_identity(&self, _time: Time, _view: ViewId, _mip: MipmapLevel, _rod: CanonicalRect) -> IdentityVerdict {
        IdentityVerdict::NotIdentity
    }

    fn time_domain(&self) -> FrameRange {
        FrameRange {
            first: FrameIndex(1),
            last: FrameIndex(1),
        }
    }

    fn available_planes(&self, _time: Time) -> HashSet<PlaneId> {
        let mut planes = HashSet::new();
        planes.insert(PlaneId::Color(ComponentSet::Rgba));
        planes
    }

    fn needed_and_produced_planes(&self, time: Time, _view: ViewId) -> NeededProducedPlanes {
        NeededProducedPlanes {
            needed_per_input: HashMap::new(),
            produced: self.available_planes(time),
            passthrough_input_and_time_view: None,
        }
    }

    fn render(&self, invocation: &mut RenderInvocation<'_>) -> RenderStatus {
        for plane in invocation.planes_out.iter_mut() {
            plane.data.fill(128);
        }
        Ok(())
    }

    fn supports_tiles(&self) -> bool {
        true
    }

    fn supports_multiresolution(&self) -> bool {
        false
    }

    fn supports_render_scale(&self) -> bool {
        false
    }

    fn safety(&self) -> EffectSafety {
        EffectSafety::FullySafe
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Generic
    }

    fn sequential_preference(&self) -> SequentialPreference {
        SequentialPreference::Any
    }

    fn input_count(&self) -> usize {
        0
    }
}

struct TestPatternGraph {
    effect: TestPatternEffect,
    action_cache: ActionCache,
    dispatcher: TileDispatcher,
}

impl TestPatternGraph {
    fn new() -> Self {
        Self {
            effect: TestPatternEffect,
            action_cache: ActionCache::new(1),
            dispatcher: TileDispatcher::default(),
        }
    }
}

impl GraphNode for TestPatternGraph {
    fn effect(&self) -> &dyn Effect {
        &self.effect
    }

    fn action_cache(&self) -> &ActionCache {
        &self.action_cache
    }

    fn dispatcher(&self) -> &TileDispatcher {
        &self.dispatcher
    }

    fn input(&self, _idx: InputIndex) -> Option<NodeId> {
        None
    }
}

impl Graph for TestPatternGraph {
    fn node(&self, _id: NodeId) -> &dyn GraphNode {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_range_parses_first_dash_last() {
        let range = parse_frame_range("10-20").unwrap();
        assert_eq!(range.first, FrameIndex(10));
        assert_eq!(range.last, FrameIndex(20));
    }

    #[test]
    fn frame_range_rejects_reversed_bounds() {
        assert!(parse_frame_range("20-10").is_err());
    }

    #[test]
    fn frame_range_rejects_malformed_input() {
        assert!(parse_frame_range("garbage").is_err());
    }

    #[test]
    fn writer_exit_code_prefers_writer_failure_over_finished_stop_code() {
        assert_eq!(writer_exit_code(RenderStopCode::Finished, true), 2);
        assert_eq!(writer_exit_code(RenderStopCode::Finished, false), 0);
        assert_eq!(writer_exit_code(RenderStopCode::Aborted, false), 1);
    }

    #[test]
    fn file_writer_device_writes_delivered_planes_to_disk() {
        let dir = std::env::temp_dir().join(format!("render_cli_test_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let device = FileWriterDevice::new(
            "test".to_string(),
            dir.clone(),
            FrameRange { first: FrameIndex(1), last: FrameIndex(1) },
        );

        device.deliver(
            Time::new(1.0),
            ViewId(0),
            vec![PlaneBuffer {
                components: ComponentSet::Rgba,
                bit_depth: BitDepth::U8,
                bounds: model::PixelRect::new(0, 0, 1, 1),
                data: vec![1, 2, 3, 4],
            }],
        );

        assert!(device.take_error().is_none());
        let written = fs::read(dir.join("test").join("00000001.0.raw")).unwrap();
        assert_eq!(written, vec![1, 2, 3, 4]);
        let _ = fs::remove_dir_all(&dir);
    }
}
