//! `raspilot-kernel` – Module lifecycle & orchestration
//!
//! Owns the set of pluggable modules (sensor providers, actuator drivers,
//! network links, recorders), wires their dependencies through singleton
//! roles, and brings them up and down in a safe order.
//!
//! # Modules
//!
//! - [`module`] – the [`Module`] / [`StartedModule`] contract and the
//!   [`Capabilities`] a module declares.
//! - [`roles`] – role traits ([`OrientationProvider`], [`RxProvider`],
//!   [`FlightControlProvider`], [`LoadGuard`]) and their resolution: the last
//!   module declaring a role wins.
//! - [`context`] – [`KernelContext`]: what a module receives at
//!   initialization (role lookup, `get_module`, command registration, event
//!   loop, logging span).
//! - [`kernel`] – [`Kernel`]: `initialize` → `run` → `stop`.
//! - [`periodic`] – [`PeriodicTask`]: a callback every N ms on a dedicated,
//!   cancellable worker.
//! - [`watchdog`] – [`Watchdog`]: the CPU-load guard with panic/calm-down
//!   hysteresis.
//! - [`recorder`] – [`Recorder`] and the telemetry, black-box and load guard
//!   controllers that drive recorders periodically.
//! - [`event_loop`] – the shared reactor and the [`ShutdownHandle`] that ends
//!   it.

pub mod context;
pub mod event_loop;
pub mod kernel;
pub mod module;
pub mod periodic;
pub mod recorder;
pub mod roles;
pub mod watchdog;

pub use context::{KernelContext, WeakKernelContext};
pub use event_loop::ShutdownHandle;
pub use kernel::{Kernel, KernelBuilder, KernelConfig, KernelPhase, StartReport};
pub use module::{Capabilities, Module, ModuleHandle, StartedModule};
pub use periodic::{PeriodicTask, TaskStatus};
pub use recorder::{BlackBoxController, LoadGuardController, Recorder, RecorderKind, TelemetryController};
pub use roles::{FlightControlProvider, LoadGuard, OrientationProvider, RxProvider};
pub use watchdog::{LoadListener, LoadMonitor, MetricSampler, Transition, Watchdog, WatchdogConfig, WatchdogState};
