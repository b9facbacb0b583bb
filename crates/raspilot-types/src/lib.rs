//! Shared value types for the raspilot kernel.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! the [`Command`] message routed by the command bus, the [`Role`] tags the
//! kernel resolves at construction time, the telemetry values providers
//! expose, and the [`KernelError`] taxonomy.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Opaque key/value payload carried by a [`Command`].
pub type CommandData = Map<String, Value>;

/// Names of the commands the kernel and its standard recorders emit or handle.
pub mod names {
    /// Load guard edge notification (`{panic, delay, utilization}`).
    pub const PANIC: &str = "panic";
    /// Continuous load guard sample (`{utilization}`).
    pub const SYSTEM_STATE: &str = "system_state";
    /// Requests an orderly shutdown of the kernel.
    pub const SYSTEM_STOP: &str = "system.stop";
    /// A component failed and the system runs degraded (`{component, phase, reason}`).
    pub const SYSTEM_DEGRADED: &str = "system.degraded";
    /// Query or change the telemetry sampling interval (`{frequency, isRequest}`).
    pub const TELEMETRY_FREQUENCY: &str = "telemetry.frequency";
    /// Composite system snapshot sent to the ground station.
    pub const TELEMETRY_UPDATE: &str = "telemetry.update";
}

// ────────────────────────────────────────────────────────────────────────────
// Command
// ────────────────────────────────────────────────────────────────────────────

/// A named, data-carrying message routed through the command bus.
///
/// Commands are immutable once constructed.  The name is validated to be
/// non-empty both by [`Command::new`] and when decoding from JSON, so every
/// `Command` value in the system has a usable name.
///
/// # Example
///
/// ```
/// use raspilot_types::Command;
/// use serde_json::json;
///
/// let cmd = Command::new("altitude.change")
///     .unwrap()
///     .with_entry("altitude", json!(120));
/// assert_eq!(cmd.name(), "altitude.change");
/// assert_eq!(cmd.get("altitude"), Some(&json!(120)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand")]
pub struct Command {
    name: String,
    data: Option<CommandData>,
    id: Option<String>,
}

/// Wire shape used for decoding; validated into a [`Command`].
#[derive(Deserialize, JsonSchema)]
struct RawCommand {
    /// Command name, required and non-empty.
    #[schemars(length(min = 1))]
    name: String,
    /// Optional command payload.
    #[serde(default)]
    data: Option<CommandData>,
    /// Optional correlation id.
    #[serde(default)]
    id: Option<String>,
}

impl TryFrom<RawCommand> for Command {
    type Error = KernelError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let mut cmd = Command::new(raw.name)?;
        cmd.data = raw.data;
        cmd.id = raw.id;
        Ok(cmd)
    }
}

impl Command {
    /// Create a command with the given name and no payload.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidCommand`] when `name` is empty or
    /// whitespace only.
    pub fn new(name: impl Into<String>) -> Result<Self, KernelError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(KernelError::InvalidCommand(
                "command name must be set".to_string(),
            ));
        }
        Ok(Self {
            name,
            data: None,
            id: None,
        })
    }

    /// Create a command that expects a correlated reply: a fresh UUID is used
    /// as its id.
    pub fn request(name: impl Into<String>) -> Result<Self, KernelError> {
        Ok(Self::new(name)?.with_id(Uuid::new_v4().to_string()))
    }

    /// Replace the payload.
    pub fn with_data(mut self, data: CommandData) -> Self {
        self.data = Some(data);
        self
    }

    /// Insert a single payload entry, creating the payload if needed.
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data
            .get_or_insert_with(CommandData::new)
            .insert(key.into(), value);
        self
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> Option<&CommandData> {
        self.data.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Look up a single payload entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// Encode as the `{"name", "data", "id"}` JSON object exchanged with
    /// external protocols.
    pub fn to_json(&self) -> Result<Vec<u8>, KernelError> {
        serde_json::to_vec(self).map_err(|e| KernelError::InvalidCommand(e.to_string()))
    }

    /// Decode from the JSON wire shape.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidCommand`] for malformed JSON or a missing
    /// or empty `name`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, KernelError> {
        serde_json::from_slice(bytes).map_err(|e| KernelError::InvalidCommand(e.to_string()))
    }

    /// JSON schema of the wire shape, published to ground-station clients.
    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(RawCommand)
    }

    // ── Well-known commands ────────────────────────────────────────────────

    fn named(name: &'static str) -> Self {
        Self {
            name: name.to_string(),
            data: None,
            id: None,
        }
    }

    /// Load guard edge notification.  `delay_ms` tells the receiver how long
    /// to hold the new mode before acting on it.
    pub fn panic(in_panic: bool, delay_ms: u64, utilization: f32) -> Self {
        Self::named(names::PANIC)
            .with_entry("panic", Value::Bool(in_panic))
            .with_entry("delay", Value::from(delay_ms))
            .with_entry("utilization", Value::from(utilization))
    }

    /// Continuous load guard sample.
    pub fn system_state(utilization: f32) -> Self {
        Self::named(names::SYSTEM_STATE).with_entry("utilization", Value::from(utilization))
    }

    pub fn system_stop() -> Self {
        Self::named(names::SYSTEM_STOP)
    }

    /// Notification that `component` failed during `phase` and the system
    /// keeps running without it.
    pub fn system_degraded(component: &str, phase: &str, reason: &str) -> Self {
        Self::named(names::SYSTEM_DEGRADED)
            .with_entry("component", Value::from(component))
            .with_entry("phase", Value::from(phase))
            .with_entry("reason", Value::from(reason))
    }

    /// Telemetry interval report, in milliseconds.
    pub fn telemetry_frequency(interval_ms: u64) -> Self {
        Self::named(names::TELEMETRY_FREQUENCY)
            .with_entry("frequency", Value::from(interval_ms))
            .with_entry("isRequest", Value::Bool(false))
    }

    /// Composite snapshot for the ground station.  Every update carries a
    /// fresh id.
    pub fn telemetry_update(snapshot: &SystemSnapshot) -> Result<Self, KernelError> {
        let value = serde_json::to_value(snapshot)
            .map_err(|e| KernelError::InvalidCommand(e.to_string()))?;
        match value {
            Value::Object(data) => Ok(Self::named(names::TELEMETRY_UPDATE)
                .with_data(data)
                .with_id(Uuid::new_v4().to_string())),
            other => Err(KernelError::InvalidCommand(format!(
                "snapshot must encode as an object, got {other}"
            ))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Roles
// ────────────────────────────────────────────────────────────────────────────

/// Capability tags the kernel recognises on a module.
///
/// A module declares zero or more of these; the kernel resolves each
/// singleton role to the last module declaring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    OrientationProvider,
    RxProvider,
    FlightControlProvider,
    LoadGuard,
    CommandExecutor,
    CommandReceiver,
    /// The module takes part in the start/stop phases.
    Started,
    /// No capability beyond load/initialize.
    Plain,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Role::OrientationProvider => "Orientation Provider",
            Role::RxProvider => "RX Provider",
            Role::FlightControlProvider => "Flight Control Provider",
            Role::LoadGuard => "Load Guard",
            Role::CommandExecutor => "Command Executor",
            Role::CommandReceiver => "Command Receiver",
            Role::Started => "Started",
            Role::Plain => "Plain",
        };
        f.write_str(label)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry values
// ────────────────────────────────────────────────────────────────────────────

/// Attitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Receiver channel values as PWM pulse widths (typically 1000–2000 µs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxChannels {
    pub ailerons: u16,
    pub elevator: u16,
    pub throttle: u16,
    pub rudder: u16,
}

impl Default for RxChannels {
    fn default() -> Self {
        Self {
            ailerons: 1500,
            elevator: 1500,
            throttle: 1000,
            rudder: 1500,
        }
    }
}

/// Snapshot assembled by the system-state recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub orientation: Option<Orientation>,
    pub rx: Option<RxChannels>,
    /// Last CPU utilization sampled by the load guard, 0–100.
    pub cpu: Option<f32>,
    pub failed_modules: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by the kernel, the command bus and modules.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelError {
    #[error("Initialization of {module} failed: {reason}")]
    Initialization { module: String, reason: String },

    #[error("{module} requires the {role} role, but no module provides it")]
    MissingRole { module: String, role: Role },

    #[error("{module} failed to start: {reason}")]
    StartFailed { module: String, reason: String },

    #[error("{} module(s) failed to stop", failures.len())]
    StopFailed { failures: Vec<(String, String)> },

    #[error("Handler for '{command}' failed: {reason}")]
    HandlerFailed { command: String, reason: String },

    #[error("Periodic task {task} failed: {reason}")]
    TickFailed { task: String, reason: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("calm threshold {calm} must be below panic threshold {panic}")]
    InvalidThresholds { calm: f32, panic: f32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Kernel is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{module}: {reason}")]
    Module { module: String, reason: String },
}

impl KernelError {
    /// Shorthand for a module-specific failure.
    pub fn module(module: impl Into<String>, reason: impl Into<String>) -> Self {
        KernelError::Module {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::Io(e.to_string())
    }
}

/// Extract a readable message from a payload caught by
/// [`std::panic::catch_unwind`].
pub fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
