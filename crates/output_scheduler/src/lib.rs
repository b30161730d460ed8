//! The output scheduler turns an `OutputDevice`'s requested frame range into an
//! ordered stream of delivered frames (spec §4.5). It is a pure decision
//! engine in the style of the teacher's frame-quota scheduler: given inputs
//! (what finished rendering, how full the delivery buffer is, the measured
//! FPS) it returns what to do next. Actually running render threads and
//! calling `OutputDevice::deliver` is `render_engine`'s job, one layer up.

use std::collections::BTreeMap;

use render_context::{AbortSignal, RenderAgeCounter};
use render_protocol::{Direction, FrameIndex, FrameRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Quitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerTransitionError {
    #[error("cannot start: scheduler is not idle")]
    NotIdle,
    #[error("scheduler has already quit")]
    AlreadyQuit,
}

/// What the caller should do after asking the scheduler for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Render this frame; call `frame_rendered` (or `frame_failed`) with the
    /// same `render_age` once it completes.
    Render { frame: FrameIndex, render_age: u64 },
    /// The delivery buffer is full; wait before asking again.
    Backpressure,
    /// Every frame in range has been dispatched already.
    RangeExhausted,
    /// The scheduler is not in a state that accepts dispatch.
    NotRunning,
}

/// Coordinates an output device's frame range: which frame to render next,
/// which completed frame is next to deliver (frames can finish out of
/// dispatch order), and the idle/starting/running/stopping/quitting state
/// machine of spec §4.5's transition table.
pub struct OutputScheduler {
    state: SchedulerState,
    range: FrameRange,
    direction: Direction,
    next_to_dispatch: Option<FrameIndex>,
    next_to_deliver: Option<FrameIndex>,
    buffer_capacity: usize,
    buffer: BTreeMap<FrameIndex, ()>,
    render_age: RenderAgeCounter,
    abort: AbortSignal,
}

impl OutputScheduler {
    pub fn new(range: FrameRange, direction: Direction, buffer_capacity: usize) -> Self {
        Self::new_with_abort(range, direction, buffer_capacity, AbortSignal::new())
    }

    /// Like `new`, but shares `abort` with the caller instead of minting a
    /// fresh one — so a signal raised from outside (e.g. `RenderEngine::abort`)
    /// is the same one `abort()` below raises, and the same one tile renders
    /// check through `RenderContext::is_aborted`.
    pub fn new_with_abort(range: FrameRange, direction: Direction, buffer_capacity: usize, abort: AbortSignal) -> Self {
        Self {
            state: SchedulerState::Idle,
            range,
            direction,
            next_to_dispatch: None,
            next_to_deliver: None,
            buffer_capacity: buffer_capacity.max(1),
            buffer: BTreeMap::new(),
            render_age: RenderAgeCounter::new(),
            abort,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn render_age(&self) -> u64 {
        self.render_age.current()
    }

    /// `idle -> starting`. Resets the dispatch/delivery cursors to the start
    /// of the range in the requested direction.
    pub fn start(&mut self) -> Result<(), SchedulerTransitionError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerTransitionError::NotIdle);
        }
        let first = match self.direction {
            Direction::Forward => self.range.first,
            Direction::Backward => self.range.last,
        };
        self.next_to_dispatch = Some(first);
        self.next_to_deliver = Some(first);
        self.buffer.clear();
        self.state = SchedulerState::Starting;
        Ok(())
    }

    /// Asks for the next unit of work. Advances the dispatch cursor on
    /// `Render`; does not mutate state on `Backpressure`/`RangeExhausted`.
    pub fn poll_dispatch(&mut self) -> DispatchDecision {
        if !matches!(self.state, SchedulerState::Starting | SchedulerState::Running) {
            return DispatchDecision::NotRunning;
        }
        if self.buffer.len() >= self.buffer_capacity {
            return DispatchDecision::Backpressure;
        }
        let Some(frame) = self.next_to_dispatch else {
            return DispatchDecision::RangeExhausted;
        };
        if out_of_range(frame, self.range) {
            self.next_to_dispatch = None;
            return DispatchDecision::RangeExhausted;
        }
        self.next_to_dispatch = Some(step(frame, self.direction));
        DispatchDecision::Render {
            frame,
            render_age: self.render_age.current(),
        }
    }

    /// Records that `frame` finished rendering under `render_age`. Stale
    /// completions (from a render age that has since been aborted) are
    /// ignored. The first successful completion moves `starting -> running`.
    pub fn frame_rendered(&mut self, frame: FrameIndex, render_age: u64) {
        if render_age != self.render_age.current() {
            tracing::debug!(?frame, render_age, current = self.render_age.current(), "dropping stale frame completion");
            return;
        }
        self.buffer.insert(frame, ());
        if self.state == SchedulerState::Starting {
            self.state = SchedulerState::Running;
        }
    }

    /// Pops the next frame to deliver, in the output device's playback order,
    /// if it has finished rendering. Returns `None` if the scheduler is still
    /// waiting on a gap (an earlier frame in order hasn't completed yet).
    pub fn poll_delivery(&mut self) -> Option<FrameIndex> {
        let next = self.next_to_deliver?;
        if self.buffer.remove(&next).is_none() {
            return None;
        }
        self.next_to_deliver = Some(step(next, self.direction));
        Some(next)
    }

    pub fn backpressured(&self) -> bool {
        self.buffer.len() >= self.buffer_capacity
    }

    /// `starting | running -> stopping`. Bumps the render age so in-flight
    /// renders under the old age are recognized as stale by `frame_rendered`.
    pub fn abort(&mut self) {
        if matches!(self.state, SchedulerState::Starting | SchedulerState::Running) {
            self.abort.raise();
            self.render_age.bump();
            self.state = SchedulerState::Stopping;
        }
    }

    /// `stopping -> idle`. Called once every in-flight render for the old age
    /// has returned.
    pub fn drain_complete(&mut self) {
        if self.state == SchedulerState::Stopping {
            self.buffer.clear();
            self.next_to_dispatch = None;
            self.next_to_deliver = None;
            self.state = SchedulerState::Idle;
        }
    }

    /// Any state `-> quitting`, a terminal state this scheduler never leaves.
    pub fn quit(&mut self) -> Result<(), SchedulerTransitionError> {
        if self.state == SchedulerState::Quitting {
            return Err(SchedulerTransitionError::AlreadyQuit);
        }
        self.abort.raise();
        self.render_age.bump();
        self.state = SchedulerState::Quitting;
        Ok(())
    }
}

fn out_of_range(frame: FrameIndex, range: FrameRange) -> bool {
    frame.0 < range.first.0 || frame.0 > range.last.0
}

fn step(frame: FrameIndex, direction: Direction) -> FrameIndex {
    match direction {
        Direction::Forward => FrameIndex(frame.0 + 1),
        Direction::Backward => FrameIndex(frame.0 - 1),
    }
}

/// Compares measured against desired playback rate and recommends whether the
/// producer pool should slow down dispatch to avoid outrunning the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpsRegulation {
    OnPace,
    Throttle,
}

pub fn regulate_fps(actual: f64, desired: f64) -> FpsRegulation {
    if desired <= 0.0 || actual <= desired * 1.05 {
        FpsRegulation::OnPace
    } else {
        FpsRegulation::Throttle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> OutputScheduler {
        OutputScheduler::new(
            FrameRange {
                first: FrameIndex(1),
                last: FrameIndex(3),
            },
            Direction::Forward,
            2,
        )
    }

    #[test]
    fn start_from_idle_sets_starting_and_resets_cursors() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Starting);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(SchedulerTransitionError::NotIdle));
    }

    #[test]
    fn dispatch_walks_the_range_forward_then_exhausts() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();

        for expected in 1..=3 {
            let decision = scheduler.poll_dispatch();
            assert_eq!(
                decision,
                DispatchDecision::Render {
                    frame: FrameIndex(expected),
                    render_age: 0
                }
            );
        }
        assert_eq!(scheduler.poll_dispatch(), DispatchDecision::RangeExhausted);
    }

    #[test]
    fn dispatch_applies_backpressure_once_buffer_is_full() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();
        scheduler.poll_dispatch();
        scheduler.poll_dispatch();
        scheduler.frame_rendered(FrameIndex(1), 0);
        scheduler.frame_rendered(FrameIndex(2), 0);

        assert_eq!(scheduler.poll_dispatch(), DispatchDecision::Backpressure);
    }

    #[test]
    fn delivery_waits_on_a_gap_in_frame_order() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();
        scheduler.poll_dispatch();
        scheduler.poll_dispatch();

        scheduler.frame_rendered(FrameIndex(2), 0);
        assert_eq!(scheduler.poll_delivery(), None, "frame 1 hasn't finished yet");

        scheduler.frame_rendered(FrameIndex(1), 0);
        assert_eq!(scheduler.poll_delivery(), Some(FrameIndex(1)));
        assert_eq!(scheduler.poll_delivery(), Some(FrameIndex(2)));
    }

    #[test]
    fn stale_completion_from_an_old_render_age_is_dropped() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();
        scheduler.poll_dispatch();
        scheduler.abort();

        scheduler.frame_rendered(FrameIndex(1), 0);
        assert_eq!(scheduler.poll_delivery(), None);
    }

    #[test]
    fn abort_then_drain_complete_returns_to_idle() {
        let mut scheduler = scheduler();
        scheduler.start().unwrap();
        scheduler.abort();
        assert_eq!(scheduler.state(), SchedulerState::Stopping);
        scheduler.drain_complete();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn quit_is_terminal() {
        let mut scheduler = scheduler();
        scheduler.quit().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Quitting);
        assert_eq!(scheduler.quit(), Err(SchedulerTransitionError::AlreadyQuit));
    }

    #[test]
    fn fps_regulation_throttles_only_when_meaningfully_ahead_of_pace() {
        assert_eq!(regulate_fps(24.0, 24.0), FpsRegulation::OnPace);
        assert_eq!(regulate_fps(30.0, 24.0), FpsRegulation::Throttle);
    }
}
