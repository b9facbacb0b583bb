//! Process-level lifecycle: initialize → run → stop.

use std::sync::Arc;

use raspilot_kernel::{Kernel, Recorder, StartReport, Watchdog, WatchdogConfig};
use raspilot_types::KernelError;
use tracing::{error, info, warn};

use crate::cpu::ProcStatSampler;
use crate::state_recorder::SystemStateRecorder;

/// Telemetry, black-box and `/proc/stat` load guard recorders.
///
/// # Errors
///
/// [`KernelError::InvalidThresholds`] when the watchdog thresholds are
/// inverted.
pub fn standard_recorders(watchdog: WatchdogConfig) -> Result<Vec<Arc<dyn Recorder>>, KernelError> {
    let load_guard = Watchdog::new(watchdog, ProcStatSampler::new())?;
    Ok(vec![
        Arc::new(SystemStateRecorder::telemetry()),
        Arc::new(SystemStateRecorder::black_box()),
        Arc::new(load_guard),
    ])
}

/// Drive `kernel` through its whole lifecycle on the calling thread.
///
/// Blocks until shutdown is requested.  Modules are always stopped, also
/// when `run` fails; an initialization error is returned in preference to
/// any stop error.
///
/// # Errors
///
/// The initialization error, or the stop error when every earlier phase
/// succeeded.
pub fn launch(kernel: &Kernel) -> Result<StartReport, KernelError> {
    if let Err(e) = kernel.initialize() {
        error!(error = %e, "Bootstrap aborted");
        if let Err(stop) = kernel.stop() {
            warn!(error = %stop, "Cleanup after failed bootstrap reported errors");
        }
        return Err(e);
    }

    let run = kernel.run();
    let stop = kernel.stop();
    let report = run?;
    stop?;

    info!(
        started = report.started.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Raspilot shut down"
    );
    Ok(report)
}
