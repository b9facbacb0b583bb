//! [`PeriodicTask`] – run a callback every N ms on a dedicated, cancellable
//! worker thread.
//!
//! Used by the telemetry and black-box recorders, the load guard, and any
//! module with a polling loop of its own.
//!
//! # Timing
//!
//! The interval is measured from the end of one tick to the start of the
//! next.  Drift is accepted; this is not a real-time scheduler.
//!
//! Intervals below [`MIN_INTERVAL`] are raised to it, so a zero interval
//! cannot turn the worker into a busy loop.
//!
//! # Cancellation
//!
//! [`PeriodicTask::stop`] sets a flag and wakes the worker if it is sleeping.
//! A stopped task cannot be started again.
//! A tick already in progress is never interrupted, so at most one further
//! tick can complete after `stop` returns.  Call [`PeriodicTask::join`] when
//! the worker must be gone (e.g. before process exit).
//!
//! # Error ceiling
//!
//! A failing tick is logged and the loop continues.  With
//! [`PeriodicTask::with_error_ceiling`] set, reaching that many *consecutive*
//! failures ends the loop, moves the task to [`TaskStatus::Degraded`] and
//! invokes the degraded callback once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use raspilot_types::{KernelError, panic_reason};
use tracing::{debug, error, warn};

/// Shortest sleep between two ticks.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Tick callback.
pub type Tick = Box<dyn FnMut() -> Result<(), KernelError> + Send>;

/// Invoked once when the error ceiling is reached.
pub type DegradedCallback = Arc<dyn Fn(&KernelError) + Send + Sync>;

/// Lifecycle of a [`PeriodicTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Idle = 0,
    Running = 1,
    Stopped = 2,
    Degraded = 3,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopped,
            3 => Self::Degraded,
            _ => Self::Idle,
        }
    }
}

struct Shared {
    name: String,
    interval_ms: AtomicU64,
    status: AtomicU8,
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Move `from` → `to` only if the status is still `from`.
    fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleep until `deadline` or cancellation.  Returns `true` when cancelled.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Interval-driven background worker.
pub struct PeriodicTask {
    shared: Arc<Shared>,
    tick: Mutex<Option<Tick>>,
    error_ceiling: Option<u32>,
    on_degraded: Option<DegradedCallback>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new<F>(name: impl Into<String>, interval: Duration, tick: F) -> Self
    where
        F: FnMut() -> Result<(), KernelError> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                interval_ms: AtomicU64::new(duration_ms(interval)),
                status: AtomicU8::new(TaskStatus::Idle as u8),
                cancelled: Mutex::new(false),
                wake: Condvar::new(),
            }),
            tick: Mutex::new(Some(Box::new(tick))),
            error_ceiling: None,
            on_degraded: None,
            worker: Mutex::new(None),
        }
    }

    /// Stop after `ceiling` consecutive failing ticks.  `None` never stops.
    pub fn with_error_ceiling(mut self, ceiling: Option<u32>) -> Self {
        self.error_ceiling = ceiling.filter(|c| *c > 0);
        self
    }

    pub fn on_degraded(mut self, callback: DegradedCallback) -> Self {
        self.on_degraded = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::Acquire))
    }

    /// Takes effect from the next sleep.
    pub fn set_interval(&self, interval: Duration) {
        self.shared
            .interval_ms
            .store(duration_ms(interval), Ordering::Release);
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    /// Spawn the worker.  Returns `true` once it is launched; `false` if the
    /// task was already started or stopped, or the thread could not be
    /// spawned.
    pub fn start(&self) -> bool {
        if self.shared.is_cancelled() {
            warn!(task = %self.shared.name, "Periodic task already stopped");
            return false;
        }
        let Some(tick) = self.tick.lock().take() else {
            warn!(task = %self.shared.name, "Periodic task already started");
            return false;
        };

        let shared = Arc::clone(&self.shared);
        let ceiling = self.error_ceiling;
        let on_degraded = self.on_degraded.clone();
        shared.set_status(TaskStatus::Running);

        let spawned = thread::Builder::new()
            .name(format!("periodic-{}", self.shared.name))
            .spawn(move || worker_loop(&shared, tick, ceiling, on_degraded));

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                debug!(task = %self.shared.name, interval_ms = self.interval().as_millis() as u64, "Periodic task started");
                true
            }
            Err(e) => {
                error!(task = %self.shared.name, error = %e, "Failed to spawn periodic task worker");
                self.shared.set_status(TaskStatus::Stopped);
                false
            }
        }
    }

    /// Request cancellation.  Never blocks on a tick in progress.
    pub fn stop(&self) {
        *self.shared.cancelled.lock() = true;
        self.shared.wake.notify_all();
        if !self.shared.transition(TaskStatus::Running, TaskStatus::Stopped) {
            self.shared.transition(TaskStatus::Idle, TaskStatus::Stopped);
        }
    }

    /// Wait for the worker to exit.  No-op if it was never started.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(task = %self.shared.name, "Periodic task worker panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    shared: &Shared,
    mut tick: Tick,
    ceiling: Option<u32>,
    on_degraded: Option<DegradedCallback>,
) {
    let mut consecutive_errors: u32 = 0;

    while !shared.is_cancelled() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| tick())).unwrap_or_else(|payload| {
            Err(KernelError::TickFailed {
                task: shared.name.clone(),
                reason: format!("panicked: {}", panic_reason(payload.as_ref())),
            })
        });

        match result {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                warn!(task = %shared.name, error = %e, consecutive_errors, "Periodic tick failed");
                if ceiling.is_some_and(|c| consecutive_errors >= c) {
                    error!(task = %shared.name, consecutive_errors, "Error ceiling reached, periodic task degraded");
                    shared.set_status(TaskStatus::Degraded);
                    if let Some(callback) = &on_degraded {
                        callback(&KernelError::TickFailed {
                            task: shared.name.clone(),
                            reason: format!("{consecutive_errors} consecutive failures, last: {e}"),
                        });
                    }
                    return;
                }
            }
        }

        let interval = Duration::from_millis(shared.interval_ms.load(Ordering::Acquire));
        if shared.sleep_until(Instant::now() + interval) {
            break;
        }
    }
    shared.transition(TaskStatus::Running, TaskStatus::Stopped);
    debug!(task = %shared.name, "Periodic task exited");
}

fn duration_ms(interval: Duration) -> u64 {
    u64::try_from(interval.max(MIN_INTERVAL).as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> Result<(), KernelError> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn ticks_repeatedly_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("counter", Duration::from_millis(5), counting(&ticks));
        assert_eq!(task.status(), TaskStatus::Idle);
        assert!(task.start());
        assert_eq!(task.status(), TaskStatus::Running);

        thread::sleep(Duration::from_millis(100));
        task.stop();
        task.join();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert_eq!(task.status(), TaskStatus::Stopped);
    }

    #[test]
    fn at_most_one_tick_after_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("bounded", Duration::from_millis(1), counting(&ticks));
        task.start();
        thread::sleep(Duration::from_millis(30));

        task.stop();
        let at_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        let after = ticks.load(Ordering::SeqCst);
        assert!(after <= at_stop + 1, "{after} ticks vs {at_stop} at stop");
        task.join();
    }

    #[test]
    fn stop_wakes_a_sleeping_worker() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("sleepy", Duration::from_secs(60), counting(&ticks));
        task.start();
        thread::sleep(Duration::from_millis(20));

        let begun = Instant::now();
        task.stop();
        task.join();
        assert!(begun.elapsed() < Duration::from_secs(5));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_start_is_rejected() {
        let task = PeriodicTask::new("once", Duration::from_millis(10), || Ok(()));
        assert!(task.start());
        assert!(!task.start());
        task.stop();
        task.join();
    }

    #[test]
    fn failing_tick_does_not_end_loop_without_ceiling() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = PeriodicTask::new("flaky", Duration::from_millis(2), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(KernelError::Io("transient".to_string()))
            } else {
                panic!("tick {n} blew up")
            }
        });
        task.start();
        thread::sleep(Duration::from_millis(80));
        task.stop();
        task.join();
        assert!(ticks.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn error_ceiling_degrades_and_reports_once() {
        let reports = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reports);
        let task = PeriodicTask::new("serial-read", Duration::from_millis(1), || {
            Err(KernelError::Io("port closed".to_string()))
        })
        .with_error_ceiling(Some(3))
        .on_degraded(Arc::new(move |e: &KernelError| {
            assert!(matches!(e, KernelError::TickFailed { .. }));
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        task.start();
        task.join();
        assert_eq!(task.status(), TaskStatus::Degraded);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let degraded = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&degraded);
        let mut n = 0u32;
        let task = PeriodicTask::new("alternating", Duration::from_millis(1), move || {
            n += 1;
            if n % 2 == 0 { Ok(()) } else { Err(KernelError::Io("odd".to_string())) }
        })
        .with_error_ceiling(Some(2))
        .on_degraded(Arc::new(move |_: &KernelError| flag.store(true, Ordering::SeqCst)));

        task.start();
        thread::sleep(Duration::from_millis(50));
        task.stop();
        task.join();
        assert!(!degraded.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_before_start_prevents_launch() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("early-stop", Duration::from_millis(1), counting(&ticks));
        task.stop();
        assert_eq!(task.status(), TaskStatus::Stopped);
        assert!(!task.start());
        task.join();
        assert_eq!(task.status(), TaskStatus::Stopped);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_keeps_degraded_status() {
        let task = PeriodicTask::new("dead-port", Duration::from_millis(1), || {
            Err(KernelError::Io("port closed".to_string()))
        })
        .with_error_ceiling(Some(1));
        task.start();
        task.join();
        task.stop();
        assert_eq!(task.status(), TaskStatus::Degraded);
    }

    #[test]
    fn worker_marks_itself_stopped_on_exit() {
        let task = PeriodicTask::new("self-exit", Duration::from_secs(60), || Ok(()));
        task.start();
        *task.shared.cancelled.lock() = true;
        task.shared.wake.notify_all();
        task.join();
        assert_eq!(task.status(), TaskStatus::Stopped);
    }

    #[test]
    fn zero_interval_is_raised_to_minimum() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("zero", Duration::ZERO, counting(&ticks));
        assert_eq!(task.interval(), MIN_INTERVAL);
        task.set_interval(Duration::ZERO);
        assert_eq!(task.interval(), MIN_INTERVAL);

        task.start();
        thread::sleep(Duration::from_millis(50));
        task.stop();
        task.join();
        // One tick per millisecond at most, plus scheduling slack.
        assert!(ticks.load(Ordering::SeqCst) <= 60);
    }

    #[test]
    fn interval_can_change_while_running() {
        let task = PeriodicTask::new("retune", Duration::from_millis(200), || Ok(()));
        task.set_interval(Duration::from_millis(50));
        assert_eq!(task.interval(), Duration::from_millis(50));
    }
}
