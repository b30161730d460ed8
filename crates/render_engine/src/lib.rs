//! The facade that turns `evaluator::Evaluator` (a pure pull-based render
//! call) and `output_scheduler::OutputScheduler` (a pure frame-ordering
//! decision engine) into an actually-running render: a pool of worker
//! threads, a job queue, and a main loop that drives the scheduler and calls
//! into an `OutputDevice`. Threading here follows the teacher's engine crate:
//! bounded `crossbeam_channel` queues between a producer side and a consumer
//! side, with atomics for cheap cross-thread counters instead of locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use evaluator::Evaluator;
use image_store::Image;
use model::{MipmapLevel, PixelRect};
use output_scheduler::{DispatchDecision, OutputScheduler, SchedulerState};
use render_context::{AbortSignal, RenderContext};
use render_protocol::{
    BitDepth, Direction, FrameIndex, NodeId, OutputDevice, PlaneBuffer, PlaneRequest,
    RenderError, RenderStopCode, SequentialPreference, Time, ViewId,
};

/// A wide-open request rect. `Evaluator::render_region` intersects every
/// request against the node's actual region of definition, so this just
/// means "the whole frame" without the engine having to resolve the RoD
/// itself before dispatching.
const UNBOUNDED_REQUEST: PixelRect = PixelRect {
    x1: i32::MIN / 2,
    y1: i32::MIN / 2,
    x2: i32::MAX / 2,
    y2: i32::MAX / 2,
};

/// Umbrella error for a CLI-driven render, downcasting everything a run can
/// fail with into the three outcomes the command line cares about.
#[derive(Debug, thiserror::Error)]
pub enum RenderCoreError {
    #[error("render aborted")]
    Aborted,
    #[error("writer failed: {0}")]
    WriterFailure(String),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl RenderCoreError {
    /// The process exit code for this failure, per the CLI's exit-code
    /// contract: `0` full completion, `1` abort, `2` any writer failure.
    /// Argument-parsing failures never reach this type; `clap` exits with
    /// its own code before a `RenderCoreError` can be constructed.
    pub fn exit_code(&self) -> i32 {
        match self {
            RenderCoreError::Aborted => 1,
            RenderCoreError::WriterFailure(_) => 2,
            RenderCoreError::Render(_) => 2,
        }
    }
}

/// Maps a finished run's stop code to the CLI's exit-code contract.
pub fn stop_code_exit(code: RenderStopCode) -> i32 {
    match code {
        RenderStopCode::Finished => 0,
        RenderStopCode::Aborted => 1,
        RenderStopCode::Failed => 2,
    }
}

pub struct EngineConfig {
    pub worker_count: usize,
    pub buffer_capacity: usize,
    pub mip: MipmapLevel,
    pub view: ViewId,
    pub bit_depth: BitDepth,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            buffer_capacity: 4,
            mip: MipmapLevel::FULL,
            view: ViewId(0),
            bit_depth: BitDepth::Float,
        }
    }
}

struct RenderJob {
    frame: FrameIndex,
    render_age: u64,
}

struct RenderJobResult {
    frame: FrameIndex,
    render_age: u64,
    outcome: Result<Vec<PlaneBuffer>, RenderError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
}

/// Owns the worker pool for one output device and drives it end to end:
/// pulls frame indices from an `OutputScheduler`, renders them on worker
/// threads through an `Evaluator`, and delivers completed frames back to the
/// device in playback order.
pub struct RenderEngine<D: OutputDevice + 'static> {
    evaluator: Arc<Evaluator>,
    device: Arc<D>,
    output_node: NodeId,
    config: EngineConfig,
    job_tx: Option<Sender<RenderJob>>,
    result_rx: Receiver<RenderJobResult>,
    workers: Vec<JoinHandle<()>>,
    dropped_jobs: Arc<AtomicU64>,
    abort_signal: AbortSignal,
    quit_requested: Arc<AtomicBool>,
    run_state: Arc<(Mutex<RunState>, Condvar)>,
}

impl<D: OutputDevice + 'static> RenderEngine<D> {
    pub fn new(evaluator: Arc<Evaluator>, device: Arc<D>, output_node: NodeId, config: EngineConfig) -> Self {
        // Sized to the worker pool, not the scheduler's delivery buffer: a
        // frame can be dispatched before any earlier one finishes rendering,
        // so in-flight jobs can briefly outnumber buffered completions.
        let job_capacity = config.worker_count.max(1) + config.buffer_capacity.max(1);
        let (job_tx, job_rx) = bounded::<RenderJob>(job_capacity);
        let (result_tx, result_rx) = bounded::<RenderJobResult>(config.buffer_capacity.max(1));
        let dropped_jobs = Arc::new(AtomicU64::new(0));
        let abort_signal = AbortSignal::new();

        let workers = (0..config.worker_count.max(1))
            .map(|worker_index| {
                spawn_worker(
                    worker_index,
                    evaluator.clone(),
                    output_node,
                    config.mip,
                    config.view,
                    config.bit_depth,
                    job_rx.clone(),
                    result_tx.clone(),
                    abort_signal.clone(),
                )
            })
            .collect();

        Self {
            evaluator,
            device,
            output_node,
            config,
            job_tx: Some(job_tx),
            result_rx,
            workers,
            dropped_jobs,
            abort_signal,
            quit_requested: Arc::new(AtomicBool::new(false)),
            run_state: Arc::new((Mutex::new(RunState::Idle), Condvar::new())),
        }
    }

    pub fn dropped_jobs(&self) -> u64 {
        self.dropped_jobs.load(Ordering::Relaxed)
    }

    /// Raises the abort signal shared with the scheduler and every worker
    /// context. If `blocking`, does not return until a `run()` in progress has
    /// fully unwound (every in-flight producer has returned and the scheduler
    /// has drained back to idle).
    pub fn abort(&self, blocking: bool) {
        self.abort_signal.raise();
        if blocking {
            self.wait_for_idle();
        }
    }

    /// Like `abort`, but also prevents any future `run()` call from starting
    /// a new scheduler; once quit, this engine never renders again.
    pub fn quit(&self, blocking: bool) {
        self.quit_requested.store(true, Ordering::SeqCst);
        self.abort_signal.raise();
        if blocking {
            self.wait_for_idle();
        }
    }

    fn set_run_state(&self, state: RunState) {
        let (lock, condvar) = &*self.run_state;
        let mut guard = lock.lock().expect("render engine run-state mutex poisoned");
        *guard = state;
        condvar.notify_all();
    }

    fn wait_for_idle(&self) {
        let (lock, condvar) = &*self.run_state;
        let guard = lock.lock().expect("render engine run-state mutex poisoned");
        let _idle = condvar
            .wait_while(guard, |state| *state == RunState::Running)
            .expect("render engine run-state mutex poisoned");
    }

    /// Renders the device's requested frame range to completion, or until
    /// `abort`/`quit` is called from another thread. Blocks the calling
    /// thread; callers typically run this on its own "render driver" thread.
    pub fn run(&self) -> RenderStopCode {
        if self.quit_requested.load(Ordering::SeqCst) {
            return RenderStopCode::Aborted;
        }
        self.abort_signal.reset();
        self.set_run_state(RunState::Running);

        let range = self.device.frame_range_to_render();
        let direction = Direction::Forward;
        let mut scheduler = OutputScheduler::new_with_abort(range, direction, self.config.buffer_capacity, self.abort_signal.clone());
        if scheduler.start().is_err() {
            self.set_run_state(RunState::Idle);
            return RenderStopCode::Failed;
        }

        let output = self.evaluator.graph.node(self.output_node);
        let bracket_sequence = output.effect().sequential_preference() == SequentialPreference::Only;
        if bracket_sequence {
            let step = match direction {
                Direction::Forward => 1,
                Direction::Backward => -1,
            };
            output
                .effect()
                .begin_sequence(range.first, range.last, step, false, self.config.mip, self.config.view);
        }

        self.device.on_render_started();
        let stop_code = self.drive(&mut scheduler);
        self.device.on_render_stopped(stop_code);

        if bracket_sequence {
            output.effect().end_sequence();
        }

        self.set_run_state(RunState::Idle);
        stop_code
    }

    /// Drives dispatch/collection/delivery until the range is exhausted and
    /// drained, or the scheduler is aborted/quit (externally, or internally
    /// after a frame failure) and every already-in-flight job has returned.
    fn drive(&self, scheduler: &mut OutputScheduler) -> RenderStopCode {
        let mut last_tick = Instant::now();
        let mut delivered_since_tick = 0u32;
        let mut in_flight: u64 = 0;
        let mut saw_failure = false;

        loop {
            if self.abort_signal.is_raised() && matches!(scheduler.state(), SchedulerState::Starting | SchedulerState::Running) {
                scheduler.abort();
            }

            if matches!(scheduler.state(), SchedulerState::Stopping | SchedulerState::Quitting) {
                while in_flight > 0 {
                    if let Some(failed) = self.collect_one_result(scheduler, Duration::from_millis(50)) {
                        in_flight -= 1;
                        saw_failure |= failed;
                    }
                }
                while let Some(frame) = scheduler.poll_delivery() {
                    self.deliver(frame);
                }
                scheduler.drain_complete();
                return if saw_failure { RenderStopCode::Failed } else { RenderStopCode::Aborted };
            }

            match scheduler.poll_dispatch() {
                DispatchDecision::Render { frame, render_age } => {
                    // Blocks if every worker is busy and the job queue is
                    // full; that is the intended backpressure, a dropped
                    // frame here would never be rendered at all.
                    let job = RenderJob { frame, render_age };
                    if let Some(tx) = self.job_tx.as_ref() {
                        if tx.send(job).is_err() {
                            self.dropped_jobs.fetch_add(1, Ordering::Relaxed);
                        } else {
                            in_flight += 1;
                        }
                    }
                }
                DispatchDecision::Backpressure => {}
                DispatchDecision::RangeExhausted => {
                    if in_flight == 0 {
                        while let Some(frame) = scheduler.poll_delivery() {
                            self.deliver(frame);
                            delivered_since_tick += 1;
                        }
                        return if saw_failure { RenderStopCode::Failed } else { RenderStopCode::Finished };
                    }
                }
                DispatchDecision::NotRunning => return RenderStopCode::Aborted,
            }

            if let Some(failed) = self.collect_one_result(scheduler, Duration::from_millis(50)) {
                in_flight -= 1;
                saw_failure |= failed;
                if failed {
                    scheduler.abort();
                }
            }

            while let Some(frame) = scheduler.poll_delivery() {
                self.deliver(frame);
                delivered_since_tick += 1;
            }

            let elapsed = last_tick.elapsed();
            if elapsed >= Duration::from_secs(1) {
                let actual_fps = delivered_since_tick as f64 / elapsed.as_secs_f64();
                self.device.report_fps(actual_fps, 0.0);
                delivered_since_tick = 0;
                last_tick = Instant::now();
            }
        }
    }

    /// Receives one worker result, if any arrives within `timeout`. Returns
    /// `Some(true)` if it was a failure, `Some(false)` if it rendered
    /// successfully, or `None` if nothing arrived in time.
    fn collect_one_result(&self, scheduler: &mut OutputScheduler, timeout: Duration) -> Option<bool> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => match result.outcome {
                Ok(_) => {
                    scheduler.frame_rendered(result.frame, result.render_age);
                    Some(false)
                }
                Err(err) => {
                    self.device.report_failure(err.to_string());
                    tracing::warn!(frame = ?result.frame, %err, "frame render failed");
                    Some(true)
                }
            },
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Reads the rendered planes back out of the image store and hands them
    /// to the device. The planes themselves were already computed by the
    /// worker that rendered `frame`; this just re-fetches the cached images,
    /// which is cheap since `render_region` already materialized them.
    fn deliver(&self, frame: FrameIndex) {
        let time = Time::new(frame.0 as f64);
        let node = self.evaluator.graph.node(self.output_node);
        let planes = node
            .effect()
            .available_planes(time)
            .into_iter()
            .filter_map(|plane| {
                let key = render_protocol::ImageKey {
                    node_hash: node.effect().node_hash(time, self.config.view),
                    plane: plane.clone(),
                    time,
                    view: self.config.view,
                    mip: self.config.mip,
                    frame_varying: false,
                };
                let image: Option<Arc<Image>> = self.evaluator.image_store.get(&key);
                image.and_then(|image| image.read_plane(&plane))
            })
            .collect::<Vec<_>>();

        self.device.deliver(time, self.config.view, planes);
        self.device.report_frame_rendered(frame);
    }
}

impl<D: OutputDevice + 'static> Drop for RenderEngine<D> {
    fn drop(&mut self) {
        // Drop the sender first: workers block on `job_rx.recv()` and only
        // exit once every sender (this one, plus the clones handed to the
        // original `spawn_worker` calls are all of them) is gone.
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    worker_index: usize,
    evaluator: Arc<Evaluator>,
    output_node: NodeId,
    mip: MipmapLevel,
    view: ViewId,
    bit_depth: BitDepth,
    job_rx: Receiver<RenderJob>,
    result_tx: Sender<RenderJobResult>,
    abort_signal: AbortSignal,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("render-worker-{worker_index}"))
        .spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let outcome = render_one_frame(&evaluator, output_node, job.frame, job.render_age, mip, view, bit_depth, abort_signal.clone());
                if result_tx
                    .send(RenderJobResult {
                        frame: job.frame,
                        render_age: job.render_age,
                        outcome,
                    })
                    .is_err()
                {
                    return;
                }
            }
        })
        .expect("failed to spawn render worker thread")
}

#[allow(clippy::too_many_arguments)]
fn render_one_frame(
    evaluator: &Evaluator,
    output_node: NodeId,
    frame: FrameIndex,
    render_age: u64,
    mip: MipmapLevel,
    view: ViewId,
    bit_depth: BitDepth,
    abort_signal: AbortSignal,
) -> Result<Vec<PlaneBuffer>, RenderError> {
    let time = Time::new(frame.0 as f64);
    let node = evaluator.graph.node(output_node);
    let plane_ids = node.effect().available_planes(time);
    let requests: Vec<PlaneRequest> = plane_ids
        .into_iter()
        .map(|plane| PlaneRequest { plane, bit_depth })
        .collect();
    let is_sequential = node.effect().sequential_preference() == SequentialPreference::Only;

    let ctx = RenderContext::<Image>::new(
        time,
        view,
        mip,
        node.effect().node_hash(time, view),
        render_age,
        is_sequential,
        true,
        true,
        FrameIndex(frame.0),
        FrameIndex(frame.0),
        abort_signal,
    );

    let images = evaluator.render_region(&ctx, output_node, UNBOUNDED_REQUEST, &requests, false)?;
    let mut buffers = Vec::with_capacity(images.len());
    for (plane, image) in images {
        if let Some(buffer) = image.read_plane(&plane) {
            buffers.push(buffer);
        }
    }
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use action_cache::ActionCache;
    use evaluator::{Graph, GraphNode, TileDispatcher};
    use image_store::ImageStore;
    use model::CanonicalRect;
    use render_protocol::{
        ComponentSet, EffectSafety, Effect, FrameRange, IdentityVerdict, NeededProducedPlanes,
        PlaneId, RenderInvocation, RenderStatus, SequentialPreference,
    };
    use std::collections::{HashMap, HashSet};

    struct TestDevice {
        range: FrameRange,
        delivered: Mutex<Vec<Time>>,
    }

    impl OutputDevice for TestDevice {
        fn deliver(&self, time: Time, _view: ViewId, _planes: Vec<PlaneBuffer>) {
            self.delivered.lock().unwrap().push(time);
        }
        fn timeline_step(&self, _direction: Direction) {}
        fn timeline_goto(&self, _time: Time) {}
        fn timeline_get_time(&self) -> Time {
            Time::new(0.0)
        }
        fn frame_range_to_render(&self) -> FrameRange {
            self.range
        }
        fn on_render_started(&self) {}
        fn on_render_stopped(&self, _code: RenderStopCode) {}
    }

    struct ConstantEffect {
        fail: bool,
        render_delay: Duration,
    }

    impl Default for ConstantEffect {
        fn default() -> Self {
            Self {
                fail: false,
                render_delay: Duration::ZERO,
            }
        }
    }

    impl Effect for ConstantEffect {
        fn node_hash(&self, time: Time, _view: ViewId) -> u64 {
            time.value().to_bits()
        }
        fn region_of_definition(&self, _time: Time, _view: ViewId, _mip: MipmapLevel) -> Result<CanonicalRect, RenderError> {
            Ok(CanonicalRect::new(0.0, 0.0, 4.0, 4.0))
        }
        fn regions_of_interest(&self, _time: Time, _view: ViewId, _mip: MipmapLevel, _out_rect: CanonicalRect) -> HashMap<u32, CanonicalRect> {
            HashMap::new()
        }
        fn frames_needed(&self, _time: Time, _view: ViewId) -> HashMap<u32, HashMap<ViewId, Vec<FrameRange>>> {
            HashMap::new()
        }
        fn is_identity(&self, _time: Time, _view: ViewId, _mip: MipmapLevel, _rod: CanonicalRect) -> IdentityVerdict {
            IdentityVerdict::NotIdentity
        }
        fn time_domain(&self) -> FrameRange {
            FrameRange { first: FrameIndex(1), last: FrameIndex(2) }
        }
        fn available_planes(&self, _time: Time) -> HashSet<PlaneId> {
            let mut set = HashSet::new();
            set.insert(PlaneId::Color(ComponentSet::Rgba));
            set
        }
        fn needed_and_produced_planes(&self, _time: Time, _view: ViewId) -> NeededProducedPlanes {
            NeededProducedPlanes {
                needed_per_input: HashMap::new(),
                produced: self.available_planes(Time::new(0.0)),
                passthrough_input_and_time_view: None,
            }
        }
        fn render(&self, invocation: &mut RenderInvocation<'_>) -> RenderStatus {
            if self.render_delay > Duration::ZERO {
                std::thread::sleep(self.render_delay);
            }
            if self.fail {
                return Err(RenderError::PluginFailure {
                    message: "synthetic failure".to_string(),
                });
            }
            for plane in invocation.planes_out.iter_mut() {
                plane.data.fill(42);
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
        fn kind(&self) -> render_protocol::NodeKind {
            render_protocol::NodeKind::Generic
        }
        fn sequential_preference(&self) -> SequentialPreference {
            SequentialPreference::Any
        }
        fn input_count(&self) -> usize {
            0
        }
    }

    struct SingleNodeGraph {
        effect: ConstantEffect,
        action_cache: ActionCache,
        dispatcher: TileDispatcher,
    }

    impl GraphNode for SingleNodeGraph {
        fn effect(&self) -> &dyn Effect {
            &self.effect
        }
        fn action_cache(&self) -> &ActionCache {
            &self.action_cache
        }
        fn dispatcher(&self) -> &TileDispatcher {
            &self.dispatcher
        }
        fn input(&self, _idx: u32) -> Option<NodeId> {
            None
        }
    }

    impl Graph for SingleNodeGraph {
        fn node(&self, _id: NodeId) -> &dyn GraphNode {
            self
        }
    }

    #[test]
    fn engine_renders_and_delivers_a_single_frame_range() {
        let mut keys = slotmap::SlotMap::<NodeId, ()>::with_key();
        let node_id = keys.insert(());

        let graph = Arc::new(SingleNodeGraph {
            effect: ConstantEffect::default(),
            action_cache: ActionCache::new(1),
            dispatcher: TileDispatcher::default(),
        });
        let image_store = Arc::new(ImageStore::new());
        let evaluator = Arc::new(Evaluator::new(image_store, graph));
        let device = Arc::new(TestDevice {
            range: FrameRange { first: FrameIndex(1), last: FrameIndex(1) },
            delivered: Mutex::new(Vec::new()),
        });

        let engine = RenderEngine::new(
            evaluator,
            device.clone(),
            node_id,
            EngineConfig {
                worker_count: 1,
                buffer_capacity: 2,
                mip: MipmapLevel::FULL,
                view: ViewId(0),
                bit_depth: BitDepth::Float,
            },
        );

        let stop_code = engine.run();
        assert_eq!(stop_code, RenderStopCode::Finished);
        assert_eq!(device.delivered.lock().unwrap().as_slice(), &[Time::new(1.0)]);
    }

    #[test]
    fn a_failing_frame_stops_the_run_with_failed_rather_than_hanging() {
        let mut keys = slotmap::SlotMap::<NodeId, ()>::with_key();
        let node_id = keys.insert(());

        let graph = Arc::new(SingleNodeGraph {
            effect: ConstantEffect {
                fail: true,
                render_delay: Duration::ZERO,
            },
            action_cache: ActionCache::new(1),
            dispatcher: TileDispatcher::default(),
        });
        let image_store = Arc::new(ImageStore::new());
        let evaluator = Arc::new(Evaluator::new(image_store, graph));
        let device = Arc::new(TestDevice {
            range: FrameRange { first: FrameIndex(1), last: FrameIndex(3) },
            delivered: Mutex::new(Vec::new()),
        });

        let engine = RenderEngine::new(
            evaluator,
            device,
            node_id,
            EngineConfig {
                worker_count: 1,
                buffer_capacity: 2,
                mip: MipmapLevel::FULL,
                view: ViewId(0),
                bit_depth: BitDepth::Float,
            },
        );

        assert_eq!(engine.run(), RenderStopCode::Failed);
    }

    #[test]
    fn blocking_abort_does_not_return_until_the_run_has_unwound() {
        let mut keys = slotmap::SlotMap::<NodeId, ()>::with_key();
        let node_id = keys.insert(());

        let graph = Arc::new(SingleNodeGraph {
            effect: ConstantEffect {
                fail: false,
                render_delay: Duration::from_millis(20),
            },
            action_cache: ActionCache::new(1),
            dispatcher: TileDispatcher::default(),
        });
        let image_store = Arc::new(ImageStore::new());
        let evaluator = Arc::new(Evaluator::new(image_store, graph));
        let device = Arc::new(TestDevice {
            range: FrameRange { first: FrameIndex(1), last: FrameIndex(500) },
            delivered: Mutex::new(Vec::new()),
        });

        let engine = Arc::new(RenderEngine::new(
            evaluator,
            device,
            node_id,
            EngineConfig {
                worker_count: 1,
                buffer_capacity: 2,
                mip: MipmapLevel::FULL,
                view: ViewId(0),
                bit_depth: BitDepth::Float,
            },
        ));

        let runner = engine.clone();
        let handle = std::thread::spawn(move || runner.run());

        std::thread::sleep(Duration::from_millis(40));
        engine.abort(true);

        let stop_code = handle.join().expect("render driver thread should not panic");
        assert_eq!(stop_code, RenderStopCode::Aborted);
    }

    #[test]
    fn quit_prevents_any_further_run_from_starting() {
        let mut keys = slotmap::SlotMap::<NodeId, ()>::with_key();
        let node_id = keys.insert(());

        let graph = Arc::new(SingleNodeGraph {
            effect: ConstantEffect::default(),
            action_cache: ActionCache::new(1),
            dispatcher: TileDispatcher::default(),
        });
        let image_store = Arc::new(ImageStore::new());
        let evaluator = Arc::new(Evaluator::new(image_store, graph));
        let device = Arc::new(TestDevice {
            range: FrameRange { first: FrameIndex(1), last: FrameIndex(1) },
            delivered: Mutex::new(Vec::new()),
        });

        let engine = RenderEngine::new(
            evaluator,
            device,
            node_id,
            EngineConfig {
                worker_count: 1,
                buffer_capacity: 2,
                mip: MipmapLevel::FULL,
                view: ViewId(0),
                bit_depth: BitDepth::Float,
            },
        );

        engine.quit(true);
        assert_eq!(engine.run(), RenderStopCode::Aborted);
    }

    #[test]
    fn exit_codes_match_the_cli_contract() {
        assert_eq!(stop_code_exit(RenderStopCode::Finished), 0);
        assert_eq!(stop_code_exit(RenderStopCode::Aborted), 1);
        assert_eq!(stop_code_exit(RenderStopCode::Failed), 2);
        assert_eq!(RenderCoreError::Aborted.exit_code(), 1);
        assert_eq!(RenderCoreError::WriterFailure("disk full".to_string()).exit_code(), 2);
    }
}
