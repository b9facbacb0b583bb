//! Recorders and the controllers that drive them.
//!
//! A [`Recorder`] only knows how to capture one state sample.  The kernel
//! wraps every recorder in a controller that owns a [`PeriodicTask`] and runs
//! `record_state` at the interval configured for the recorder's kind:
//!
//! | Kind | Controller | Default interval |
//! |---|---|---|
//! | [`RecorderKind::Telemetry`] | [`TelemetryController`] | 200 ms |
//! | [`RecorderKind::BlackBox`] | [`BlackBoxController`] | 500 ms |
//! | [`RecorderKind::LoadGuard`] | [`LoadGuardController`] | 100 ms |
//!
//! Controllers are ordinary started modules, so they are initialized after
//! every passive module and can be found with `get_module`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use raspilot_types::KernelError;
use tracing::debug;

use crate::context::{KernelContext, WeakKernelContext};
use crate::module::{Capabilities, Module, StartedModule};
use crate::periodic::{PeriodicTask, TaskStatus};
use crate::roles::LoadGuard;

/// Which controller a recorder is driven by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    Telemetry,
    BlackBox,
    LoadGuard,
}

/// Captures one state sample per tick.
pub trait Recorder: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> RecorderKind;

    /// Called once, from the owning controller's initialization.
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        let _ = ctx;
        Ok(())
    }

    fn record_state(&self) -> Result<(), KernelError>;

    /// Recorders with load-check semantics expose their sampled metric here;
    /// the kernel then binds them to the load guard role.
    fn as_load_guard(self: Arc<Self>) -> Option<Arc<dyn LoadGuard>> {
        None
    }
}

/// Shared machinery of the three controllers.
struct RecorderLoop {
    recorder: Arc<dyn Recorder>,
    task: PeriodicTask,
    ctx: Arc<OnceLock<WeakKernelContext>>,
}

impl RecorderLoop {
    fn new(recorder: Arc<dyn Recorder>, interval: Duration, error_ceiling: Option<u32>) -> Self {
        let ctx: Arc<OnceLock<WeakKernelContext>> = Arc::new(OnceLock::new());

        let ticking = Arc::clone(&recorder);
        let degraded_ctx = Arc::clone(&ctx);
        let component = recorder.name().to_string();
        let task = PeriodicTask::new(recorder.name(), interval, move || ticking.record_state())
            .with_error_ceiling(error_ceiling)
            .on_degraded(Arc::new(move |e: &KernelError| {
                if let Some(ctx) = degraded_ctx.get().and_then(WeakKernelContext::upgrade) {
                    ctx.report_degraded_for(&component, "record", &e.to_string());
                }
            }));
        Self { recorder, task, ctx }
    }

    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        let _ = self.ctx.set(ctx.downgrade());
        debug!(recorder = %self.recorder.name(), interval_ms = self.task.interval().as_millis() as u64, "Recorder attached");
        self.recorder.initialize(ctx)
    }

    fn start(&self) -> Result<bool, KernelError> {
        Ok(self.task.start())
    }

    fn stop(&self) -> Result<(), KernelError> {
        self.task.stop();
        self.task.join();
        Ok(())
    }
}

macro_rules! recorder_controller {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name {
            inner: RecorderLoop,
        }

        impl $name {
            pub fn new(recorder: Arc<dyn Recorder>, interval: Duration, error_ceiling: Option<u32>) -> Self {
                Self {
                    inner: RecorderLoop::new(recorder, interval, error_ceiling),
                }
            }

            pub fn recorder(&self) -> &Arc<dyn Recorder> {
                &self.inner.recorder
            }

            pub fn interval(&self) -> Duration {
                self.inner.task.interval()
            }

            pub fn status(&self) -> TaskStatus {
                self.inner.task.status()
            }
        }

        impl StartedModule for $name {
            fn start(&self) -> Result<bool, KernelError> {
                self.inner.start()
            }

            fn stop(&self) -> Result<(), KernelError> {
                self.inner.stop()
            }
        }
    };
}

recorder_controller! {
    /// Drives telemetry recorders.  The interval can be retuned at runtime
    /// through the `telemetry.frequency` command.
    TelemetryController
}

recorder_controller! {
    /// Drives black-box recorders.
    BlackBoxController
}

recorder_controller! {
    /// Drives the load guard.  Also fills the load guard role when the
    /// wrapped recorder exposes one.
    LoadGuardController
}

impl TelemetryController {
    /// Takes effect after the current sleep.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.task.set_interval(interval);
    }
}

impl Module for TelemetryController {
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        self.inner.initialize(ctx)
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::new().started(self)
    }
}

impl Module for BlackBoxController {
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        self.inner.initialize(ctx)
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::new().started(self)
    }
}

impl Module for LoadGuardController {
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        self.inner.initialize(ctx)
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        let caps = Capabilities::new().started(self.clone());
        match Arc::clone(&self.inner.recorder).as_load_guard() {
            Some(guard) => caps.load_guard(guard),
            None => caps,
        }
    }
}
