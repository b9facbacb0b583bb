//! [`Watchdog`] – load guard with panic/calm-down hysteresis.
//!
//! Every tick samples a metric (CPU utilization, 0–100) and feeds it to a
//! [`LoadMonitor`].  The monitor has two states and two thresholds:
//!
//! | From | Condition | To | Callback |
//! |---|---|---|---|
//! | `Ok` | `metric > panic_threshold` | `Panic` | `on_panic(metric)` |
//! | `Panic` | `metric < calm_threshold` | `Ok` | `on_calm_down(metric)` |
//!
//! Samples between the thresholds never change state.  Transitions are
//! edge-triggered: staying above the panic threshold fires `on_panic` once.
//! Independently of edges, every sample is reported through
//! [`LoadListener::on_sample`] (the continuous `system_state` side-channel).
//!
//! The watchdog is a [`Recorder`]; the kernel wraps it in a
//! [`LoadGuardController`][crate::recorder::LoadGuardController] which drives
//! [`Watchdog::check_state`] from a periodic task.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use raspilot_types::{Command, KernelError};
use tracing::{info, warn};

use crate::context::{KernelContext, WeakKernelContext};
use crate::recorder::{Recorder, RecorderKind};
use crate::roles::LoadGuard;

// ────────────────────────────────────────────────────────────────────────────
// Hysteresis state machine
// ────────────────────────────────────────────────────────────────────────────

/// Load guard state.  Initial state is [`WatchdogState::Ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchdogState {
    #[default]
    Ok,
    Panic,
}

/// An edge produced by [`LoadMonitor::observe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// Entered [`WatchdogState::Panic`] at this sample.
    Panic(f32),
    /// Returned to [`WatchdogState::Ok`] at this sample.
    CalmDown(f32),
}

/// Two-threshold hysteresis over a sampled metric.
///
/// # Example
///
/// ```
/// use raspilot_kernel::watchdog::{LoadMonitor, Transition};
///
/// let mut monitor = LoadMonitor::new(85.0, 70.0).unwrap();
/// assert_eq!(monitor.observe(50.0), None);
/// assert_eq!(monitor.observe(90.0), Some(Transition::Panic(90.0)));
/// assert_eq!(monitor.observe(80.0), None); // between thresholds
/// assert_eq!(monitor.observe(60.0), Some(Transition::CalmDown(60.0)));
/// ```
#[derive(Debug, Clone)]
pub struct LoadMonitor {
    panic_threshold: f32,
    calm_threshold: f32,
    state: WatchdogState,
    last_sample: Option<f32>,
}

impl LoadMonitor {
    /// # Errors
    ///
    /// [`KernelError::InvalidThresholds`] unless `calm_threshold < panic_threshold`.
    pub fn new(panic_threshold: f32, calm_threshold: f32) -> Result<Self, KernelError> {
        // Also rejects NaN thresholds.
        if !(calm_threshold < panic_threshold) {
            return Err(KernelError::InvalidThresholds {
                calm: calm_threshold,
                panic: panic_threshold,
            });
        }
        Ok(Self {
            panic_threshold,
            calm_threshold,
            state: WatchdogState::Ok,
            last_sample: None,
        })
    }

    /// Feed one sample; returns the edge it caused, if any.
    pub fn observe(&mut self, metric: f32) -> Option<Transition> {
        self.last_sample = Some(metric);
        if metric > self.panic_threshold && self.state != WatchdogState::Panic {
            self.state = WatchdogState::Panic;
            Some(Transition::Panic(metric))
        } else if metric < self.calm_threshold && self.state != WatchdogState::Ok {
            self.state = WatchdogState::Ok;
            Some(Transition::CalmDown(metric))
        } else {
            None
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn last_sample(&self) -> Option<f32> {
        self.last_sample
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborators
// ────────────────────────────────────────────────────────────────────────────

/// Source of the guarded metric.
pub trait MetricSampler: Send {
    fn sample(&mut self) -> Result<f32, KernelError>;
}

impl<F> MetricSampler for F
where
    F: FnMut() -> Result<f32, KernelError> + Send,
{
    fn sample(&mut self) -> Result<f32, KernelError> {
        self()
    }
}

/// Receives load guard edges and samples.
pub trait LoadListener: Send + Sync {
    fn on_panic(&self, metric: f32);
    fn on_calm_down(&self, metric: f32);
    fn on_sample(&self, _metric: f32) {}
}

/// Resolved load guard settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub panic_threshold: f32,
    pub calm_threshold: f32,
    /// Delay carried in the `panic` command when entering panic.
    pub panic_delay_ms: u64,
    /// Delay carried in the `panic` command when calming down.
    pub calm_down_delay_ms: u64,
    /// Send a `system_state` command with every sample.
    pub emit_status: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            panic_threshold: 85.0,
            calm_threshold: 70.0,
            panic_delay_ms: 100,
            calm_down_delay_ms: 20,
            emit_status: true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// CPU-load panic detector.
pub struct Watchdog {
    config: WatchdogConfig,
    monitor: Mutex<LoadMonitor>,
    sampler: Mutex<Box<dyn MetricSampler>>,
    listeners: RwLock<Vec<Arc<dyn LoadListener>>>,
}

impl Watchdog {
    /// # Errors
    ///
    /// [`KernelError::InvalidThresholds`] when the calm threshold is not
    /// below the panic threshold.
    pub fn new(config: WatchdogConfig, sampler: impl MetricSampler + 'static) -> Result<Self, KernelError> {
        let monitor = LoadMonitor::new(config.panic_threshold, config.calm_threshold)?;
        Ok(Self {
            config,
            monitor: Mutex::new(monitor),
            sampler: Mutex::new(Box::new(sampler)),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn with_listener(self, listener: Arc<dyn LoadListener>) -> Self {
        self.add_listener(listener);
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn LoadListener>) {
        self.listeners.write().push(listener);
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Take one sample and apply the hysteresis.  Listeners run after the
    /// monitor lock is released.
    pub fn check_state(&self) -> Result<Option<Transition>, KernelError> {
        let metric = self.sampler.lock().sample()?;
        let transition = self.monitor.lock().observe(metric);

        let listeners = self.listeners.read().clone();
        match transition {
            Some(Transition::Panic(m)) => {
                warn!(utilization = m, "PANIC mode entered");
                listeners.iter().for_each(|l| l.on_panic(m));
            }
            Some(Transition::CalmDown(m)) => {
                info!(utilization = m, "CALMED DOWN mode entered");
                listeners.iter().for_each(|l| l.on_calm_down(m));
            }
            None => {}
        }
        listeners.iter().for_each(|l| l.on_sample(metric));
        Ok(transition)
    }
}

impl LoadGuard for Watchdog {
    fn utilization(&self) -> Option<f32> {
        self.monitor.lock().last_sample()
    }

    fn state(&self) -> WatchdogState {
        self.monitor.lock().state()
    }
}

impl Recorder for Watchdog {
    fn name(&self) -> &str {
        "Watchdog"
    }

    fn kind(&self) -> RecorderKind {
        RecorderKind::LoadGuard
    }

    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        if ctx.flight_control().is_none() {
            warn!("No flight control provider found, load guard notifications stay local");
        }
        self.add_listener(Arc::new(CommandNotifier {
            ctx: ctx.downgrade(),
            config: self.config.clone(),
        }));
        Ok(())
    }

    fn record_state(&self) -> Result<(), KernelError> {
        self.check_state().map(|_| ())
    }

    fn as_load_guard(self: Arc<Self>) -> Option<Arc<dyn LoadGuard>> {
        Some(self)
    }
}

/// Turns load guard events into commands.
///
/// Edges are executed on the command bus so local modules can react, and
/// forwarded to the flight-control provider when one is available.  Samples
/// only go to the flight-control provider.  The provider is looked up on
/// every event, so one that failed to start is simply skipped.
struct CommandNotifier {
    ctx: WeakKernelContext,
    config: WatchdogConfig,
}

impl CommandNotifier {
    fn forward(&self, ctx: &KernelContext, command: &Command) {
        if let Some(sink) = ctx.flight_control() {
            if let Err(e) = sink.send_message(command) {
                warn!(command = %command.name(), error = %e, "Failed to forward load guard command");
            }
        }
    }

    fn edge(&self, command: Command) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        ctx.execute(&command);
        self.forward(&ctx, &command);
    }
}

impl LoadListener for CommandNotifier {
    fn on_panic(&self, metric: f32) {
        self.edge(Command::panic(true, self.config.panic_delay_ms, metric));
    }

    fn on_calm_down(&self, metric: f32) {
        self.edge(Command::panic(false, self.config.calm_down_delay_ms, metric));
    }

    fn on_sample(&self, metric: f32) {
        if !self.config.emit_status {
            return;
        }
        if let Some(ctx) = self.ctx.upgrade() {
            self.forward(&ctx, &Command::system_state(metric));
        }
    }
}
