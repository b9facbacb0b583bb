//! `raspilot-runtime` – Process wiring around the kernel
//!
//! Everything a host binary needs beyond the kernel core.
//!
//! # Modules
//!
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional JSON output and OTLP span export.
//! - [`cpu`] – [`ProcStatSampler`][cpu::ProcStatSampler]: CPU utilization
//!   from `/proc/stat`, the load guard's metric.
//! - [`state_recorder`] – [`SystemStateRecorder`][state_recorder::SystemStateRecorder]:
//!   composite snapshot (orientation, RX, CPU, failed modules) for
//!   telemetry and the black box.
//! - [`commands`] – standard command handlers (`telemetry.frequency`).
//! - [`bootstrap`] – [`launch`][bootstrap::launch]: initialize → run → stop,
//!   and the standard recorder set.
//! - [`sim`] – simulated IMU, receiver, ground link and flight controller
//!   for bench runs.

pub mod bootstrap;
pub mod commands;
pub mod cpu;
pub mod sim;
pub mod state_recorder;
pub mod telemetry;

pub use bootstrap::{launch, standard_recorders};
pub use commands::{TelemetryFrequencyHandler, register_telemetry_frequency};
pub use cpu::ProcStatSampler;
pub use state_recorder::SystemStateRecorder;
pub use telemetry::{LogFormat, TracerProviderGuard, TracingOptions, init_tracing, init_tracing_with};
