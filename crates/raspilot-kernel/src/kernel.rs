//! [`Kernel`] – owns the module set and drives its lifecycle.
//!
//! ```text
//!  new ──▶ Constructed ──initialize──▶ Initialized ──run──▶ Running ──stop──▶ Stopped
//!                │                                                              ▲
//!                └──── first initialize error ──▶ Failed ────────stop───────────┘
//! ```
//!
//! * **Construction** classifies every module by its declared capabilities,
//!   wraps recorders in their controllers and resolves the role table.
//! * **`initialize`** runs the load pass over every module, then initializes
//!   passive modules before started ones.  The first error aborts the
//!   bootstrap; there is no partial success.
//! * **`run`** starts every started module in registration order, recording
//!   failures without aborting, then blocks on the event loop until shutdown
//!   is requested.
//! * **`stop`** gives every started module exactly one stop attempt, even
//!   when others fail or panic.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raspilot_middleware::{CommandExecutor, CommandReceiver, CommandSender};
use raspilot_types::{Command, KernelError, names, panic_reason};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::context::{KernelContext, KernelShared};
use crate::event_loop::{EventLoop, ShutdownHandle};
use crate::module::{Module, ModuleEntry, ModuleHandle};
use crate::recorder::{BlackBoxController, LoadGuardController, Recorder, RecorderKind, TelemetryController};
use crate::roles::{FlightControlProvider, LoadGuard, OrientationProvider, RxProvider};

const KERNEL_CONTEXT: &str = "Kernel";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Already-resolved kernel settings.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    pub telemetry_interval: Duration,
    pub black_box_interval: Duration,
    pub load_guard_interval: Duration,
    /// Consecutive failing ticks after which a recorder controller gives up.
    /// `None` keeps retrying forever.
    pub tick_error_ceiling: Option<u32>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_millis(200),
            black_box_interval: Duration::from_millis(500),
            load_guard_interval: Duration::from_millis(100),
            tick_error_ceiling: Some(10),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Phase & report
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPhase {
    Constructed,
    Initialized,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for KernelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Constructed => "constructed",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of the load and start passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: Vec<String>,
    /// Modules that opted out in `load`.
    pub skipped: Vec<String>,
    /// Modules whose `start` returned `false`, errored or panicked, with the
    /// reason.
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Collects modules and recorders in registration order.
///
/// # Example
///
/// ```
/// use raspilot_kernel::{Kernel, Module};
///
/// struct Logger;
/// impl Module for Logger {}
///
/// let kernel = Kernel::builder().module(Logger).build().unwrap();
/// kernel.initialize().unwrap();
/// assert!(kernel.get_module::<Logger>().is_some());
/// ```
#[derive(Default)]
pub struct KernelBuilder {
    modules: Vec<ModuleHandle>,
    recorders: Vec<Arc<dyn Recorder>>,
    config: KernelConfig,
}

impl KernelBuilder {
    pub fn module(mut self, module: impl Module) -> Self {
        self.modules.push(ModuleHandle::new(module));
        self
    }

    /// Register a module the caller keeps a handle to.
    pub fn shared_module<M: Module>(mut self, module: Arc<M>) -> Self {
        self.modules.push(ModuleHandle::shared(module));
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn recorders(mut self, recorders: impl IntoIterator<Item = Arc<dyn Recorder>>) -> Self {
        self.recorders.extend(recorders);
        self
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    ///
    /// [`KernelError::Io`] if the event loop cannot be created.
    pub fn build(self) -> Result<Kernel, KernelError> {
        Kernel::with_config(self.modules, self.recorders, self.config)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kernel
// ────────────────────────────────────────────────────────────────────────────

/// The module lifecycle kernel.
pub struct Kernel {
    shared: Arc<KernelShared>,
    event_loop: EventLoop,
    phase: Mutex<KernelPhase>,
    report: Mutex<StartReport>,
    span: Span,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    /// # Errors
    ///
    /// [`KernelError::Io`] if the event loop cannot be created.
    pub fn new(modules: Vec<ModuleHandle>, recorders: Vec<Arc<dyn Recorder>>) -> Result<Self, KernelError> {
        Self::with_config(modules, recorders, KernelConfig::default())
    }

    /// Recorders are wrapped in their controllers and registered after
    /// `modules`, so a load guard recorder overrides a load guard module.
    ///
    /// # Errors
    ///
    /// [`KernelError::Io`] if the event loop cannot be created.
    pub fn with_config(
        modules: Vec<ModuleHandle>,
        recorders: Vec<Arc<dyn Recorder>>,
        config: KernelConfig,
    ) -> Result<Self, KernelError> {
        let span = info_span!("kernel");
        let event_loop = EventLoop::new()?;

        let mut handles = modules;
        for recorder in recorders {
            handles.push(controller_for(recorder, &config));
        }

        let entries: Vec<ModuleEntry> = handles.into_iter().map(ModuleEntry::new).collect();
        for entry in &entries {
            debug!(parent: &span, module = %entry.name, roles = ?entry.roles, "Module registered");
        }

        let shared = KernelShared::new(entries, event_loop.handle(), ShutdownHandle::new(), span.clone());
        Ok(Self {
            shared: Arc::new(shared),
            event_loop,
            phase: Mutex::new(KernelPhase::Constructed),
            report: Mutex::new(StartReport::default()),
            span,
        })
    }

    pub fn phase(&self) -> KernelPhase {
        *self.phase.lock()
    }

    /// Report of the last load/start passes.
    pub fn report(&self) -> StartReport {
        self.report.lock().clone()
    }

    /// Run the load pass and initialize every activated module.
    ///
    /// # Errors
    ///
    /// * [`KernelError::InvalidState`] unless the kernel is freshly constructed.
    /// * The first module error.  [`KernelError::MissingRole`] and
    ///   [`KernelError::Initialization`] pass through; anything else is
    ///   wrapped in [`KernelError::Initialization`].  The kernel moves to
    ///   [`KernelPhase::Failed`] and `run` is no longer reachable.
    pub fn initialize(&self) -> Result<(), KernelError> {
        self.expect_phase(&[KernelPhase::Constructed], "constructed")?;

        let skipped = self.load_pass();
        self.report.lock().skipped = skipped;

        let shutdown = self.shared.shutdown.clone();
        self.context()
            .register_command(names::SYSTEM_STOP, move |_: &Command| {
                shutdown.request();
                Ok(())
            });

        let passive = self.active().filter(|e| e.started().is_none());
        let started = self.active().filter(|e| e.started().is_some());
        for entry in passive.chain(started) {
            let _span = info_span!(parent: &self.span, "lifecycle", module = %entry.name, phase = "initialize").entered();
            let ctx = KernelContext::new(Arc::clone(&self.shared), &entry.name);
            if let Err(e) = entry.module.initialize(&ctx) {
                let e = match e {
                    KernelError::MissingRole { .. } | KernelError::Initialization { .. } => e,
                    other => KernelError::Initialization {
                        module: entry.name.clone(),
                        reason: other.to_string(),
                    },
                };
                error!(error = %e, "Module initialization failed, aborting bootstrap");
                *self.phase.lock() = KernelPhase::Failed;
                return Err(e);
            }
            debug!("Module initialized");
        }

        *self.phase.lock() = KernelPhase::Initialized;
        info!(parent: &self.span, modules = self.active().count(), "Kernel initialized");
        Ok(())
    }

    /// Start every started module in registration order without blocking.
    /// Called by [`Kernel::run`]; exposed for hosts that drive their own loop.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] unless the kernel is initialized.
    pub fn start_modules(&self) -> Result<StartReport, KernelError> {
        self.expect_phase(&[KernelPhase::Initialized], "initialized")?;
        *self.phase.lock() = KernelPhase::Running;

        let mut started = Vec::new();
        let mut failed = Vec::new();
        for entry in self.active() {
            let Some(module) = entry.started() else {
                continue;
            };
            let _span = info_span!(parent: &self.span, "lifecycle", module = %entry.name, phase = "start").entered();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| module.start()));
            let failure = match outcome {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some("start returned false".to_string()),
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("panicked: {}", panic_reason(payload.as_ref()))),
            };
            match failure {
                None => {
                    info!("Module started");
                    started.push(entry.name.clone());
                }
                Some(reason) => {
                    entry.mark_failed();
                    error!(reason = %reason, "Module failed to start");
                    failed.push((entry.name.clone(), reason));
                }
            }
        }

        let report = {
            let mut report = self.report.lock();
            report.started = started;
            report.failed = failed;
            report.clone()
        };
        info!(
            parent: &self.span,
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Module start pass complete"
        );
        if !report.all_started() {
            let names: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
            error!(parent: &self.span, failed = ?names, "Some modules failed to start, running degraded");
            for (module, reason) in &report.failed {
                self.shared.report_degraded(module, "start", reason);
            }
        }
        Ok(report)
    }

    /// Start modules (if not already started), then block on the event loop
    /// until shutdown is requested through [`Kernel::shutdown_handle`] or the
    /// `system.stop` command.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] unless the kernel is initialized or
    /// already running.
    pub fn run(&self) -> Result<StartReport, KernelError> {
        let phase = self.phase();
        let report = match phase {
            KernelPhase::Initialized => self.start_modules()?,
            KernelPhase::Running => self.report(),
            _ => {
                return Err(KernelError::InvalidState {
                    expected: "initialized".to_string(),
                    actual: phase.to_string(),
                });
            }
        };

        info!(parent: &self.span, "Kernel running");
        self.event_loop.run_until(
            &self.shared.shutdown,
            self.shared.inbox.take_receiver(),
            self.shared.receiver(),
        );
        info!(parent: &self.span, "Event loop returned");
        Ok(report)
    }

    /// Stop every started module, continuing past failures.  A second call
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// [`KernelError::StopFailed`] listing every module whose `stop` errored
    /// or panicked.  All other modules were still stopped.
    pub fn stop(&self) -> Result<(), KernelError> {
        let previous = {
            let mut phase = self.phase.lock();
            std::mem::replace(&mut *phase, KernelPhase::Stopped)
        };
        self.shared.shutdown.request();
        match previous {
            KernelPhase::Stopped => return Ok(()),
            KernelPhase::Constructed => {
                info!(parent: &self.span, "Kernel stopped before initialization");
                return Ok(());
            }
            _ => {}
        }

        let mut failures = Vec::new();
        for entry in self.active() {
            let Some(module) = entry.started() else {
                continue;
            };
            let _span = info_span!(parent: &self.span, "lifecycle", module = %entry.name, phase = "stop").entered();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| module.stop()));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("panicked: {}", panic_reason(payload.as_ref()))),
            };
            match failure {
                None => debug!("Module stopped"),
                Some(reason) => {
                    error!(reason = %reason, "Module failed to stop");
                    failures.push((entry.name.clone(), reason));
                }
            }
        }

        if failures.is_empty() {
            info!(parent: &self.span, "Kernel stopped");
            Ok(())
        } else {
            warn!(parent: &self.span, failed = failures.len(), "Kernel stopped with failures");
            Err(KernelError::StopFailed { failures })
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// First activated module of concrete type `T`, in registration order.
    pub fn get_module<T: Module>(&self) -> Option<Arc<T>> {
        self.shared.get_module::<T>()
    }

    pub fn orientation_provider(&self) -> Option<Arc<dyn OrientationProvider>> {
        self.shared.orientation_provider()
    }

    pub fn rx_provider(&self) -> Option<Arc<dyn RxProvider>> {
        self.shared.rx_provider()
    }

    pub fn flight_control(&self) -> Option<Arc<dyn FlightControlProvider>> {
        self.shared.flight_control()
    }

    pub fn load_guard(&self) -> Option<Arc<dyn LoadGuard>> {
        self.shared.load_guard()
    }

    pub fn command_executor(&self) -> Arc<dyn CommandExecutor> {
        self.shared.executor()
    }

    pub fn command_receiver(&self) -> Arc<dyn CommandReceiver> {
        self.shared.receiver()
    }

    pub fn command_sender(&self) -> CommandSender {
        self.shared.inbox.sender()
    }

    /// A context for the host program itself.
    pub fn context(&self) -> KernelContext {
        KernelContext::new(Arc::clone(&self.shared), KERNEL_CONTEXT)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shared.shutdown.clone()
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn active(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.shared.entries.iter().filter(|e| !e.is_excluded())
    }

    fn load_pass(&self) -> Vec<String> {
        let mut skipped = Vec::new();
        for entry in &self.shared.entries {
            let _span = info_span!(parent: &self.span, "lifecycle", module = %entry.name, phase = "load").entered();
            if !entry.module.load() {
                entry.exclude();
                info!("Module opted out of activation");
                skipped.push(entry.name.clone());
            }
        }
        skipped
    }

    fn expect_phase(&self, allowed: &[KernelPhase], expected: &str) -> Result<(), KernelError> {
        let actual = self.phase();
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(KernelError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if matches!(self.phase(), KernelPhase::Initialized | KernelPhase::Running) {
            if let Err(e) = self.stop() {
                error!(parent: &self.span, error = %e, "Stop on drop failed");
            }
        }
    }
}

fn controller_for(recorder: Arc<dyn Recorder>, config: &KernelConfig) -> ModuleHandle {
    let ceiling = config.tick_error_ceiling;
    match recorder.kind() {
        RecorderKind::Telemetry => {
            TelemetryController::new(recorder, config.telemetry_interval, ceiling).into()
        }
        RecorderKind::BlackBox => {
            BlackBoxController::new(recorder, config.black_box_interval, ceiling).into()
        }
        RecorderKind::LoadGuard => {
            LoadGuardController::new(recorder, config.load_guard_interval, ceiling).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Capabilities, StartedModule};
    use crate::watchdog::{Watchdog, WatchdogConfig};
    use raspilot_types::{Orientation, Role, RxChannels};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Ok,
        StartFalse,
        StopErr,
        StopPanic,
    }

    /// Instrumented started module that records every lifecycle call.
    struct Probe {
        label: &'static str,
        log: Log,
        behaviour: Behaviour,
        rx: bool,
        stops: AtomicUsize,
    }

    impl Probe {
        fn new(label: &'static str, log: &Log) -> Self {
            Self {
                label,
                log: Arc::clone(log),
                behaviour: Behaviour::Ok,
                rx: false,
                stops: AtomicUsize::new(0),
            }
        }

        fn behaving(mut self, behaviour: Behaviour) -> Self {
            self.behaviour = behaviour;
            self
        }

        fn with_rx(mut self) -> Self {
            self.rx = true;
            self
        }

        fn record(&self, event: &str) {
            self.log.lock().push(format!("{event} {}", self.label));
        }
    }

    impl Module for Probe {
        fn name(&self) -> &str {
            self.label
        }
        fn initialize(&self, _ctx: &KernelContext) -> Result<(), KernelError> {
            self.record("init");
            Ok(())
        }
        fn capabilities(self: Arc<Self>) -> Capabilities {
            let caps = Capabilities::new().started(self.clone());
            if self.rx { caps.rx(self) } else { caps }
        }
    }

    impl StartedModule for Probe {
        fn start(&self) -> Result<bool, KernelError> {
            self.record("start");
            Ok(self.behaviour != Behaviour::StartFalse)
        }
        fn stop(&self) -> Result<(), KernelError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.record("stop");
            match self.behaviour {
                Behaviour::StopErr => Err(KernelError::module(self.label, "port busy")),
                Behaviour::StopPanic => panic!("{} exploded", self.label),
                _ => Ok(()),
            }
        }
    }

    impl RxProvider for Probe {
        fn channels(&self) -> Option<RxChannels> {
            Some(RxChannels::default())
        }
    }

    /// Passive module that only records initialization.
    struct Passive {
        log: Log,
    }

    impl Module for Passive {
        fn initialize(&self, _ctx: &KernelContext) -> Result<(), KernelError> {
            self.log.lock().push("init Passive".to_string());
            Ok(())
        }
    }

    struct Gyro {
        yaw: f32,
    }

    impl Module for Gyro {
        fn capabilities(self: Arc<Self>) -> Capabilities {
            Capabilities::new().orientation(self)
        }
    }

    impl OrientationProvider for Gyro {
        fn current_orientation(&self) -> Option<Orientation> {
            Some(Orientation {
                yaw: self.yaw,
                ..Orientation::default()
            })
        }
    }

    /// Flight-controller-like module with hard role dependencies.
    struct FlightController {
        started: AtomicUsize,
    }

    impl Module for FlightController {
        fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
            ctx.require_orientation_provider()?;
            ctx.require_rx_provider()?;
            Ok(())
        }
        fn capabilities(self: Arc<Self>) -> Capabilities {
            Capabilities::new().started(self)
        }
    }

    impl StartedModule for FlightController {
        fn start(&self) -> Result<bool, KernelError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn stop(&self) -> Result<(), KernelError> {
            Ok(())
        }
    }

    struct Disabled;

    impl Module for Disabled {
        fn load(&self) -> bool {
            false
        }
        fn initialize(&self, _ctx: &KernelContext) -> Result<(), KernelError> {
            panic!("excluded module must never be initialized")
        }
    }

    struct Broken;

    impl Module for Broken {
        fn initialize(&self, _ctx: &KernelContext) -> Result<(), KernelError> {
            Err(KernelError::Io("/dev/ttyACM0 not found".to_string()))
        }
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn last_registered_role_wins_and_absent_role_is_none() {
        let kernel = Kernel::builder()
            .module(Gyro { yaw: 1.0 })
            .module(Gyro { yaw: 2.0 })
            .build()
            .unwrap();
        kernel.initialize().unwrap();

        let yaw = kernel
            .orientation_provider()
            .and_then(|p| p.current_orientation())
            .map(|o| o.yaw);
        assert_eq!(yaw, Some(2.0));
        assert!(kernel.rx_provider().is_none());
        assert!(kernel.flight_control().is_none());
        assert!(kernel.load_guard().is_none());
    }

    #[test]
    fn every_initialize_precedes_every_start() {
        let log = log();
        let kernel = Kernel::builder()
            .module(Probe::new("A", &log))
            .module(Passive { log: Arc::clone(&log) })
            .module(Probe::new("B", &log))
            .build()
            .unwrap();
        kernel.initialize().unwrap();
        let report = kernel.start_modules().unwrap();
        assert_eq!(report.started, vec!["A", "B"]);

        let events = log.lock().clone();
        assert_eq!(
            events,
            vec!["init Passive", "init A", "init B", "start A", "start B"]
        );
        kernel.stop().unwrap();
    }

    #[test]
    fn failing_stop_does_not_prevent_other_stops() {
        for behaviour in [Behaviour::StopErr, Behaviour::StopPanic] {
            let log = log();
            let a = Arc::new(Probe::new("A", &log));
            let b = Arc::new(Probe::new("B", &log).behaving(behaviour));
            let c = Arc::new(Probe::new("C", &log));
            let kernel = Kernel::builder()
                .shared_module(Arc::clone(&a))
                .shared_module(Arc::clone(&b))
                .shared_module(Arc::clone(&c))
                .build()
                .unwrap();
            kernel.initialize().unwrap();
            kernel.start_modules().unwrap();

            match kernel.stop() {
                Err(KernelError::StopFailed { failures }) => {
                    assert_eq!(failures.len(), 1);
                    assert_eq!(failures[0].0, "B");
                }
                other => panic!("expected StopFailed, got {other:?}"),
            }
            assert_eq!(a.stops.load(Ordering::SeqCst), 1);
            assert_eq!(b.stops.load(Ordering::SeqCst), 1);
            assert_eq!(c.stops.load(Ordering::SeqCst), 1);

            kernel.stop().unwrap();
            drop(kernel);
            assert_eq!(a.stops.load(Ordering::SeqCst), 1);
            assert_eq!(c.stops.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn missing_required_role_aborts_before_run() {
        let controller = Arc::new(FlightController {
            started: AtomicUsize::new(0),
        });
        let kernel = Kernel::builder()
            .module(Gyro { yaw: 0.0 })
            .shared_module(Arc::clone(&controller))
            .build()
            .unwrap();

        match kernel.initialize() {
            Err(KernelError::MissingRole { module, role }) => {
                assert_eq!(module, "FlightController");
                assert_eq!(role, Role::RxProvider);
            }
            other => panic!("expected MissingRole, got {other:?}"),
        }
        assert_eq!(kernel.phase(), KernelPhase::Failed);
        assert!(matches!(kernel.run(), Err(KernelError::InvalidState { .. })));
        assert!(matches!(kernel.start_modules(), Err(KernelError::InvalidState { .. })));
        assert_eq!(controller.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn required_roles_present_lets_controller_start() {
        let log = log();
        let controller = Arc::new(FlightController {
            started: AtomicUsize::new(0),
        });
        let kernel = Kernel::builder()
            .module(Gyro { yaw: 0.0 })
            .module(Probe::new("Radio", &log).with_rx())
            .shared_module(Arc::clone(&controller))
            .build()
            .unwrap();
        kernel.initialize().unwrap();
        kernel.start_modules().unwrap();
        assert_eq!(controller.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_initialize_errors_are_wrapped() {
        let kernel = Kernel::builder().module(Broken).build().unwrap();
        match kernel.initialize() {
            Err(KernelError::Initialization { module, reason }) => {
                assert_eq!(module, "Broken");
                assert!(reason.contains("ttyACM0"));
            }
            other => panic!("expected Initialization, got {other:?}"),
        }
        assert!(matches!(kernel.initialize(), Err(KernelError::InvalidState { .. })));
    }

    #[test]
    fn opted_out_module_is_excluded_everywhere() {
        let kernel = Kernel::builder().module(Disabled).build().unwrap();
        kernel.initialize().unwrap();
        assert!(kernel.get_module::<Disabled>().is_none());
        assert_eq!(kernel.report().skipped, vec!["Disabled"]);
    }

    #[test]
    fn start_failure_hides_role_and_reports_degraded() {
        let log = log();
        let kernel = Kernel::builder()
            .module(Probe::new("Radio", &log).with_rx().behaving(Behaviour::StartFalse))
            .module(Probe::new("Logger", &log))
            .build()
            .unwrap();
        kernel.initialize().unwrap();

        let degraded = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&degraded);
        kernel
            .context()
            .register_command(names::SYSTEM_DEGRADED, move |cmd: &Command| {
                let component = cmd.get("component").and_then(|v| v.as_str()).unwrap_or_default();
                seen.lock().push(component.to_string());
                Ok(())
            });

        assert!(kernel.rx_provider().is_some());
        let report = kernel.start_modules().unwrap();
        assert_eq!(report.started, vec!["Logger"]);
        assert_eq!(report.failed.len(), 1);
        assert!(kernel.rx_provider().is_none());
        assert_eq!(*degraded.lock(), vec!["Radio"]);

        // Every started module still gets its stop attempt.
        kernel.stop().unwrap();
        let events = log.lock().clone();
        assert!(events.contains(&"stop Radio".to_string()));
        assert!(events.contains(&"stop Logger".to_string()));
    }

    #[test]
    fn stop_command_ends_run() {
        let log = log();
        let kernel = Kernel::builder().module(Probe::new("A", &log)).build().unwrap();
        kernel.initialize().unwrap();

        let sender = kernel.command_sender();
        let remote = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            sender.send(Command::system_stop()).unwrap();
        });
        let report = kernel.run().unwrap();
        remote.join().unwrap();

        assert_eq!(report.started, vec!["A"]);
        assert!(kernel.shutdown_handle().is_requested());
        kernel.stop().unwrap();
        assert_eq!(kernel.phase(), KernelPhase::Stopped);
    }

    #[test]
    fn shutdown_requested_before_run_returns_immediately() {
        let kernel = Kernel::builder().build().unwrap();
        kernel.initialize().unwrap();
        kernel.shutdown_handle().request();
        assert!(kernel.run().unwrap().started.is_empty());
    }

    #[test]
    fn watchdog_recorder_fills_load_guard_role() {
        let watchdog = Watchdog::new(WatchdogConfig::default(), || -> Result<f32, KernelError> { Ok(12.5) }).unwrap();
        let kernel = Kernel::builder()
            .recorder(Arc::new(watchdog))
            .config(KernelConfig {
                load_guard_interval: Duration::from_millis(5),
                ..KernelConfig::default()
            })
            .build()
            .unwrap();
        kernel.initialize().unwrap();
        assert!(kernel.get_module::<LoadGuardController>().is_some());

        kernel.start_modules().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let guard = kernel.load_guard().unwrap();
        assert_eq!(guard.utilization(), Some(12.5));
        kernel.stop().unwrap();
    }
}
