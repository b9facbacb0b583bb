//! Standard command handlers.

use std::sync::Arc;
use std::time::Duration;

use raspilot_kernel::{KernelContext, TelemetryController, WeakKernelContext};
use raspilot_middleware::{CommandHandler, HandlerHandle};
use raspilot_types::{Command, KernelError, names};
use serde_json::Value;
use tracing::{debug, info, warn};

/// `telemetry.frequency`: query or retune the telemetry interval.
///
/// * `{"isRequest": true}` replies with the current interval.
/// * `{"frequency": <ms>}` sets the interval, then replies with it.
///
/// Replies go to the flight-control provider and echo the request id.
pub struct TelemetryFrequencyHandler {
    controller: Arc<TelemetryController>,
    ctx: WeakKernelContext,
}

impl TelemetryFrequencyHandler {
    pub fn new(controller: Arc<TelemetryController>, ctx: WeakKernelContext) -> Self {
        Self { controller, ctx }
    }

    fn reply(&self, request: &Command) -> Result<(), KernelError> {
        let interval_ms = u64::try_from(self.controller.interval().as_millis()).unwrap_or(u64::MAX);
        let mut reply = Command::telemetry_frequency(interval_ms);
        if let Some(id) = request.id() {
            reply = reply.with_id(id);
        }
        match self.ctx.upgrade().and_then(|ctx| ctx.flight_control()) {
            Some(sink) => sink.send_message(&reply),
            None => {
                debug!(interval_ms, "No flight control provider, telemetry frequency reply dropped");
                Ok(())
            }
        }
    }
}

impl CommandHandler for TelemetryFrequencyHandler {
    fn handle(&self, command: &Command) -> Result<(), KernelError> {
        let is_request = command
            .get("isRequest")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !is_request {
            let interval_ms = command
                .get("frequency")
                .and_then(Value::as_u64)
                .filter(|ms| *ms > 0)
                .ok_or_else(|| {
                    KernelError::InvalidCommand(
                        "telemetry.frequency needs isRequest or a positive frequency in ms".to_string(),
                    )
                })?;
            self.controller.set_interval(Duration::from_millis(interval_ms));
            info!(interval_ms, "Telemetry interval changed");
        }
        self.reply(command)
    }
}

/// Register [`TelemetryFrequencyHandler`] against the first telemetry
/// controller.  Returns `None` when no telemetry recorder is configured.
pub fn register_telemetry_frequency(ctx: &KernelContext) -> Option<HandlerHandle> {
    let Some(controller) = ctx.get_module::<TelemetryController>() else {
        warn!("No telemetry controller, {} is not available", names::TELEMETRY_FREQUENCY);
        return None;
    };
    let handler = TelemetryFrequencyHandler::new(controller, ctx.downgrade());
    Some(ctx.register_handler(names::TELEMETRY_FREQUENCY, Arc::new(handler)))
}
