//! [`SystemStateRecorder`] – composite snapshot of the running system.
//!
//! Every tick it reads the orientation and RX roles, the load guard's last
//! utilization and the list of modules that failed to start.  The telemetry
//! variant sends the snapshot to the ground station as `telemetry.update`;
//! the black-box variant keeps it locally.
//!
//! Roles are looked up on every tick rather than cached at initialization,
//! so a provider that failed to start simply shows up as `null`.

use std::sync::OnceLock;

use chrono::Utc;
use parking_lot::Mutex;
use raspilot_kernel::{KernelContext, Recorder, RecorderKind, WeakKernelContext};
use raspilot_types::{Command, KernelError, SystemSnapshot};
use tracing::{debug, trace};

use crate::commands::register_telemetry_frequency;

pub struct SystemStateRecorder {
    kind: RecorderKind,
    ctx: OnceLock<WeakKernelContext>,
    last: Mutex<Option<SystemSnapshot>>,
}

impl SystemStateRecorder {
    /// Transmits each snapshot and serves `telemetry.frequency`.
    pub fn telemetry() -> Self {
        Self::with_kind(RecorderKind::Telemetry)
    }

    /// Keeps the latest snapshot only.
    pub fn black_box() -> Self {
        Self::with_kind(RecorderKind::BlackBox)
    }

    fn with_kind(kind: RecorderKind) -> Self {
        Self {
            kind,
            ctx: OnceLock::new(),
            last: Mutex::new(None),
        }
    }

    pub fn last_snapshot(&self) -> Option<SystemSnapshot> {
        self.last.lock().clone()
    }

    pub fn capture(ctx: &KernelContext) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            orientation: ctx.orientation_provider().and_then(|p| p.current_orientation()),
            rx: ctx.rx_provider().and_then(|p| p.channels()),
            cpu: ctx.load_guard().and_then(|g| g.utilization()),
            failed_modules: ctx.failed_modules(),
        }
    }
}

impl Recorder for SystemStateRecorder {
    fn name(&self) -> &str {
        match self.kind {
            RecorderKind::Telemetry => "TelemetryRecorder",
            RecorderKind::BlackBox => "BlackBoxRecorder",
            RecorderKind::LoadGuard => "SystemStateRecorder",
        }
    }

    fn kind(&self) -> RecorderKind {
        self.kind
    }

    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        let _ = self.ctx.set(ctx.downgrade());
        if self.kind == RecorderKind::Telemetry {
            register_telemetry_frequency(ctx);
        }
        Ok(())
    }

    fn record_state(&self) -> Result<(), KernelError> {
        let Some(ctx) = self.ctx.get().and_then(WeakKernelContext::upgrade) else {
            return Ok(());
        };
        let snapshot = Self::capture(&ctx);

        if self.kind == RecorderKind::Telemetry {
            match ctx.flight_control() {
                Some(sink) => sink.send_message(&Command::telemetry_update(&snapshot)?)?,
                None => trace!("No flight control provider, telemetry update skipped"),
            }
        } else {
            debug!(
                cpu = ?snapshot.cpu,
                orientation = ?snapshot.orientation,
                rx = ?snapshot.rx,
                "Black box sample"
            );
        }

        *self.last.lock() = Some(snapshot);
        Ok(())
    }
}
