//! Time sources for the pipeline.
//!
//! Everything that needs "now" or has to wait goes through [`TimeSource`], so the
//! same bus, track service and replay logic runs against either the real clock
//! or a [`VirtualClock`] that only moves when a driver advances it.
//!
//! ```ignore
//! let clock = Arc::new(VirtualClock::new(100.0));
//! let sleeper = clock.clone();
//! let task = tokio::spawn(async move { sleeper.sleep(1.5).await });
//! clock.advance(1.5)?; // time is now 101.5 and the sleeper resolves
//! task.await??;
//! ```

use async_trait::async_trait;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::ClockError;

/// Monotonic clock, wall clock and suspendable sleep.
///
/// All values are seconds as `f64`.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Monotonic time, suitable for measuring durations.
    fn monotonic(&self) -> f64;

    /// Wall-clock time as seconds since the Unix epoch.
    fn wall_time(&self) -> f64;

    /// Suspend the calling task for `seconds`.
    async fn sleep(&self, seconds: f64) -> Result<(), ClockError>;

    /// Suspend the calling task until `monotonic() >= deadline`.
    async fn sleep_until(&self, deadline: f64) -> Result<(), ClockError> {
        if !deadline.is_finite() {
            return Err(ClockError::NonFinite(deadline));
        }
        let remaining = deadline - self.monotonic();
        self.sleep(remaining.max(0.0)).await
    }

    /// Time base in which position report timestamps are expressed.
    ///
    /// Live feeds stamp reports with wall time; under a virtual clock reports are
    /// stamped with simulated monotonic time so replayed data ages consistently.
    fn report_time(&self) -> f64 {
        self.wall_time()
    }
}

fn validate_duration(seconds: f64) -> Result<(), ClockError> {
    if !seconds.is_finite() {
        return Err(ClockError::NonFinite(seconds));
    }
    if seconds < 0.0 {
        return Err(ClockError::NegativeDuration(seconds));
    }
    Ok(())
}

/// Pass-through to the OS clocks and the tokio timer.
#[derive(Debug, Clone)]
pub struct RealClock {
    origin: Instant,
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSource for RealClock {
    fn monotonic(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn wall_time(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    async fn sleep(&self, seconds: f64) -> Result<(), ClockError> {
        validate_duration(seconds)?;
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(())
    }
}

/// A pending sleeper. Ordered by due time, then by registration sequence so
/// sleepers due at the same instant resolve in the order they were created.
#[derive(Debug)]
struct Sleeper {
    due: f64,
    seq: u64,
    waker: oneshot::Sender<()>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .total_cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
struct VirtualState {
    now: f64,
    sleepers: BinaryHeap<Reverse<Sleeper>>,
    next_seq: u64,
}

impl VirtualState {
    /// Resolve every sleeper whose due time is now in the past.
    fn wake_due(&mut self) -> usize {
        let mut woken = 0;
        while let Some(Reverse(head)) = self.sleepers.peek() {
            if head.due > self.now {
                break;
            }
            if let Some(Reverse(sleeper)) = self.sleepers.pop() {
                // A closed waker belongs to a cancelled task; skipping it leaves
                // the remaining sleepers untouched.
                if sleeper.waker.send(()).is_ok() {
                    woken += 1;
                }
            }
        }
        woken
    }

    fn prune_cancelled(&mut self) {
        while let Some(Reverse(head)) = self.sleepers.peek() {
            if !head.waker.is_closed() {
                break;
            }
            self.sleepers.pop();
        }
    }
}

/// Deterministic clock that only moves when [`advance`](Self::advance) or
/// [`set_time`](Self::set_time) is called.
///
/// Sleepers never resolve on their own; a test or replay driver steps the clock,
/// typically to [`next_due_monotonic`](Self::next_due_monotonic), and every
/// sleeper due by then is woken in due-time order.
#[derive(Debug)]
pub struct VirtualClock {
    state: Mutex<VirtualState>,
    /// Real wall time captured at creation; simulated wall time is this plus
    /// the simulated monotonic time.
    wall_origin: f64,
}

impl VirtualClock {
    pub fn new(start: f64) -> Self {
        let wall_origin = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self::with_wall_origin(start, wall_origin)
    }

    /// Create a clock with an explicit wall-clock origin.
    pub fn with_wall_origin(start: f64, wall_origin: f64) -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now: start,
                sleepers: BinaryHeap::new(),
                next_seq: 0,
            }),
            wall_origin,
        }
    }

    fn state(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Step time forward by `dt` seconds and wake every sleeper now due.
    pub fn advance(&self, dt: f64) -> Result<(), ClockError> {
        if !dt.is_finite() {
            return Err(ClockError::NonFinite(dt));
        }
        if dt < 0.0 {
            return Err(ClockError::NegativeAdvance(dt));
        }
        let mut state = self.state();
        state.now += dt;
        let woken = state.wake_due();
        trace!(now = state.now, woken, "Virtual clock advanced");
        Ok(())
    }

    /// Jump to absolute time `t` (forward only) and wake every sleeper now due.
    pub fn set_time(&self, t: f64) -> Result<(), ClockError> {
        if !t.is_finite() {
            return Err(ClockError::NonFinite(t));
        }
        let mut state = self.state();
        if t < state.now {
            return Err(ClockError::Backwards {
                requested: t,
                current: state.now,
            });
        }
        state.now = t;
        let woken = state.wake_due();
        trace!(now = state.now, woken, "Virtual clock set");
        Ok(())
    }

    /// Earliest due time among sleepers that are still waiting, if any.
    pub fn next_due_monotonic(&self) -> Option<f64> {
        let mut state = self.state();
        state.prune_cancelled();
        state.sleepers.peek().map(|Reverse(s)| s.due)
    }

    /// Number of sleepers still waiting to be resolved.
    pub fn pending_sleepers(&self) -> usize {
        self.state()
            .sleepers
            .iter()
            .filter(|Reverse(s)| !s.waker.is_closed())
            .count()
    }

    /// Register a sleeper due at `deadline(now)`, reading `now` under the same
    /// lock that pushes it. Returns `None` when that time has already come.
    fn schedule(&self, deadline: impl FnOnce(f64) -> f64) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state();
        let due = deadline(state.now);
        if due <= state.now {
            return None;
        }
        state
            .sleepers
            .retain(|Reverse(sleeper)| !sleeper.waker.is_closed());

        let (tx, rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sleepers.push(Reverse(Sleeper {
            due,
            seq,
            waker: tx,
        }));
        Some(rx)
    }

    async fn wait(&self, rx: Option<oneshot::Receiver<()>>) {
        match rx {
            // The sender only disappears if the clock itself is dropped.
            Some(rx) => {
                let _ = rx.await;
            }
            None => tokio::task::yield_now().await,
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl TimeSource for VirtualClock {
    fn monotonic(&self) -> f64 {
        self.state().now
    }

    fn wall_time(&self) -> f64 {
        self.wall_origin + self.monotonic()
    }

    async fn sleep(&self, seconds: f64) -> Result<(), ClockError> {
        validate_duration(seconds)?;
        let rx = if seconds == 0.0 {
            None
        } else {
            self.schedule(|now| now + seconds)
        };
        self.wait(rx).await;
        Ok(())
    }

    async fn sleep_until(&self, deadline: f64) -> Result<(), ClockError> {
        if !deadline.is_finite() {
            return Err(ClockError::NonFinite(deadline));
        }
        let rx = self.schedule(|_| deadline);
        self.wait(rx).await;
        Ok(())
    }

    fn report_time(&self) -> f64 {
        self.monotonic()
    }
}
