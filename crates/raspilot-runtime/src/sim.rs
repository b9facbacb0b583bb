//! Simulated providers for bench runs and tests.
//!
//! | Module | Roles | Worker |
//! |---|---|---|
//! | [`SimulatedImu`] | orientation | periodic attitude update |
//! | [`SimulatedReceiver`] | RX | periodic "serial read" pushing `rx.update` through the inbox |
//! | [`LoggingGroundLink`] | flight control | none; logs outbound commands |
//! | [`FlightController`] | – | control loop; requires orientation and RX |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use raspilot_kernel::{
    Capabilities, FlightControlProvider, KernelContext, Module, OrientationProvider, PeriodicTask,
    RxProvider, StartedModule,
};
use raspilot_middleware::CommandSender;
use raspilot_types::{Command, KernelError, Orientation, RxChannels, names};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

/// Command the simulated receiver's read loop produces.
pub const RX_UPDATE: &str = "rx.update";

// ────────────────────────────────────────────────────────────────────────────
// IMU
// ────────────────────────────────────────────────────────────────────────────

/// Orientation provider that sweeps a slow attitude oscillation.
pub struct SimulatedImu {
    attitude: Arc<RwLock<Option<Orientation>>>,
    task: PeriodicTask,
}

impl SimulatedImu {
    pub fn new(interval: Duration) -> Self {
        let attitude = Arc::new(RwLock::new(None));
        let writer = Arc::clone(&attitude);
        let epoch = Instant::now();
        let task = PeriodicTask::new("imu", interval, move || {
            let t = epoch.elapsed().as_secs_f32();
            *writer.write() = Some(Orientation {
                roll: 5.0 * (t * 0.5).sin(),
                pitch: 3.0 * (t * 0.3).cos(),
                yaw: (t * 10.0) % 360.0,
            });
            Ok(())
        });
        Self { attitude, task }
    }
}

impl Module for SimulatedImu {
    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::new().started(self.clone()).orientation(self)
    }
}

impl StartedModule for SimulatedImu {
    fn start(&self) -> Result<bool, KernelError> {
        Ok(self.task.start())
    }

    fn stop(&self) -> Result<(), KernelError> {
        self.task.stop();
        Ok(())
    }
}

impl OrientationProvider for SimulatedImu {
    fn current_orientation(&self) -> Option<Orientation> {
        *self.attitude.read()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RX receiver
// ────────────────────────────────────────────────────────────────────────────

/// RX provider fed by commands.
///
/// The worker plays the role of a serial read loop: it never touches the
/// cached channels itself, it pushes `rx.update` commands into the kernel's
/// inbox.  The module's own `rx.update` handler applies them on the event
/// loop.
pub struct SimulatedReceiver {
    channels: Arc<RwLock<Option<RxChannels>>>,
    sender: Arc<OnceLock<CommandSender>>,
    task: PeriodicTask,
}

impl SimulatedReceiver {
    pub fn new(interval: Duration) -> Self {
        let sender: Arc<OnceLock<CommandSender>> = Arc::new(OnceLock::new());
        let outbox = Arc::clone(&sender);
        let mut frame: u64 = 0;
        let task = PeriodicTask::new("rx-read", interval, move || {
            let Some(outbox) = outbox.get() else {
                return Ok(());
            };
            frame = frame.wrapping_add(1);
            let throttle = 1000 + (frame % 100) * 5;
            let update = Command::new(RX_UPDATE)?
                .with_entry("throttle", Value::from(throttle))
                .with_entry("ailerons", Value::from(1500))
                .with_entry("elevator", Value::from(1500))
                .with_entry("rudder", Value::from(1500));
            outbox.send(update)
        });
        Self {
            channels: Arc::new(RwLock::new(None)),
            sender,
            task,
        }
    }

    fn apply(channels: &RwLock<Option<RxChannels>>, command: &Command) -> Result<(), KernelError> {
        let field = |key: &str| -> Result<u16, KernelError> {
            command
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| KernelError::InvalidCommand(format!("{RX_UPDATE} needs a numeric '{key}'")))
        };
        let update = RxChannels {
            ailerons: field("ailerons")?,
            elevator: field("elevator")?,
            throttle: field("throttle")?,
            rudder: field("rudder")?,
        };
        *channels.write() = Some(update);
        Ok(())
    }
}

impl Module for SimulatedReceiver {
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        let _ = self.sender.set(ctx.command_sender());
        let channels = Arc::clone(&self.channels);
        ctx.register_command(RX_UPDATE, move |cmd: &Command| Self::apply(&channels, cmd));
        Ok(())
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::new().started(self.clone()).rx(self)
    }
}

impl StartedModule for SimulatedReceiver {
    fn start(&self) -> Result<bool, KernelError> {
        Ok(self.task.start())
    }

    fn stop(&self) -> Result<(), KernelError> {
        self.task.stop();
        Ok(())
    }
}

impl RxProvider for SimulatedReceiver {
    fn channels(&self) -> Option<RxChannels> {
        *self.channels.read()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Ground link
// ────────────────────────────────────────────────────────────────────────────

/// Flight-control provider that logs outbound commands instead of sending
/// them anywhere.
#[derive(Default)]
pub struct LoggingGroundLink {
    sent: AtomicU64,
    last: Mutex<Option<Command>>,
}

impl LoggingGroundLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn last_message(&self) -> Option<Command> {
        self.last.lock().clone()
    }
}

impl Module for LoggingGroundLink {
    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::new().flight_control(self)
    }
}

impl FlightControlProvider for LoggingGroundLink {
    fn send_message(&self, command: &Command) -> Result<(), KernelError> {
        let frame = command.to_json()?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!(command = %command.name(), bytes = frame.len(), "Ground link frame");
        if command.name() != names::TELEMETRY_UPDATE && command.name() != names::SYSTEM_STATE {
            info!(command = %command.name(), data = ?command.data(), "Sent to ground station");
        }
        *self.last.lock() = Some(command.clone());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Flight controller
// ────────────────────────────────────────────────────────────────────────────

struct Inputs {
    orientation: Arc<dyn OrientationProvider>,
    rx: Arc<dyn RxProvider>,
}

/// Control loop stand-in.  Refuses to initialize without orientation and
/// RX providers, and throttles back while the load guard reports panic.
pub struct FlightController {
    inputs: Arc<OnceLock<Inputs>>,
    load_panic: Arc<AtomicBool>,
    task: PeriodicTask,
}

impl FlightController {
    pub fn new(interval: Duration) -> Self {
        let inputs: Arc<OnceLock<Inputs>> = Arc::new(OnceLock::new());
        let load_panic = Arc::new(AtomicBool::new(false));

        let reader = Arc::clone(&inputs);
        let panicking = Arc::clone(&load_panic);
        let task = PeriodicTask::new("flight-control", interval, move || {
            let Some(inputs) = reader.get() else {
                return Ok(());
            };
            let attitude = inputs.orientation.current_orientation();
            let channels = inputs.rx.channels();
            trace!(
                ?attitude,
                ?channels,
                reduced = panicking.load(Ordering::Relaxed),
                "Control step"
            );
            Ok(())
        });
        Self {
            inputs,
            load_panic,
            task,
        }
    }

    pub fn is_load_panic(&self) -> bool {
        self.load_panic.load(Ordering::Relaxed)
    }
}

impl Module for FlightController {
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        let inputs = Inputs {
            orientation: ctx.require_orientation_provider()?,
            rx: ctx.require_rx_provider()?,
        };
        let _ = self.inputs.set(inputs);

        let flag = Arc::clone(&self.load_panic);
        ctx.register_command(names::PANIC, move |cmd: &Command| {
            let in_panic = cmd
                .get("panic")
                .and_then(Value::as_bool)
                .ok_or_else(|| KernelError::InvalidCommand("panic needs a boolean 'panic'".to_string()))?;
            if flag.swap(in_panic, Ordering::Relaxed) != in_panic {
                if in_panic {
                    warn!("Load panic, reducing control effort");
                } else {
                    info!("Load calmed down, resuming normal control");
                }
            }
            Ok(())
        });
        debug!("Flight controller wired");
        Ok(())
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::new().started(self)
    }
}

impl StartedModule for FlightController {
    fn start(&self) -> Result<bool, KernelError> {
        Ok(self.task.start())
    }

    fn stop(&self) -> Result<(), KernelError> {
        self.task.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raspilot_kernel::Kernel;
    use raspilot_types::Role;
    use serde_json::json;

    #[test]
    fn receiver_applies_rx_update_commands() {
        let channels = RwLock::new(None);
        let cmd = Command::new(RX_UPDATE)
            .unwrap()
            .with_entry("ailerons", json!(1400))
            .with_entry("elevator", json!(1600))
            .with_entry("throttle", json!(1100))
            .with_entry("rudder", json!(1500));
        SimulatedReceiver::apply(&channels, &cmd).unwrap();
        assert_eq!(channels.read().map(|c| c.throttle), Some(1100));

        let bad = Command::new(RX_UPDATE).unwrap().with_entry("throttle", json!(70000));
        assert!(matches!(
            SimulatedReceiver::apply(&channels, &bad),
            Err(KernelError::InvalidCommand(_))
        ));
    }

    #[test]
    fn flight_controller_requires_rx() {
        let kernel = Kernel::builder()
            .module(SimulatedImu::new(Duration::from_millis(10)))
            .module(FlightController::new(Duration::from_millis(10)))
            .build()
            .unwrap();
        assert!(matches!(
            kernel.initialize(),
            Err(KernelError::MissingRole { role: Role::RxProvider, .. })
        ));
    }

    #[test]
    fn full_simulation_runs_until_stop_command() {
        let link = Arc::new(LoggingGroundLink::new());
        let controller = Arc::new(FlightController::new(Duration::from_millis(5)));
        let receiver = Arc::new(SimulatedReceiver::new(Duration::from_millis(5)));
        let kernel = Kernel::builder()
            .module(SimulatedImu::new(Duration::from_millis(5)))
            .shared_module(Arc::clone(&receiver))
            .shared_module(Arc::clone(&link))
            .shared_module(Arc::clone(&controller))
            .build()
            .unwrap();
        kernel.initialize().unwrap();

        let sender = kernel.command_sender();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            sender.send(Command::panic(true, 100, 95.0)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            sender.send(Command::system_stop()).unwrap();
        });
        let report = kernel.run().unwrap();
        stopper.join().unwrap();
        kernel.stop().unwrap();

        assert_eq!(report.failed, Vec::<(String, String)>::new());
        assert_eq!(report.started.len(), 3);
        assert!(receiver.channels().is_some());
        assert!(kernel.orientation_provider().and_then(|p| p.current_orientation()).is_some());
        assert!(controller.is_load_panic());
    }

    #[test]
    fn ground_link_keeps_last_message() {
        let link = LoggingGroundLink::new();
        link.send_message(&Command::system_state(12.0)).unwrap();
        link.send_message(&Command::system_stop()).unwrap();
        assert_eq!(link.sent_count(), 2);
        assert_eq!(link.last_message().map(|c| c.name().to_string()), Some(names::SYSTEM_STOP.to_string()));
    }
}
