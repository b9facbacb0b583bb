//! Singleton roles and their resolution.
//!
//! Roles are extracted from the generic module set once, when the kernel is
//! constructed.  For every role the **last** module declaring it wins, so an
//! explicitly registered custom module overrides a default registered before
//! it.  Bindings are write-once; afterwards only the owning module's
//! availability (opted out at load, failed at start) can hide a role.

use std::sync::Arc;

use raspilot_middleware::{CommandExecutor, CommandReceiver};
use raspilot_types::{Command, KernelError, Orientation, Role, RxChannels};
use tracing::debug;

use crate::module::ModuleEntry;
use crate::watchdog::WatchdogState;

/// Supplies the current attitude.
///
/// Implementations written from their own worker thread must hand out a
/// consistent snapshot (guard the cached value with a lock).
pub trait OrientationProvider: Send + Sync {
    fn current_orientation(&self) -> Option<Orientation>;
}

/// Supplies the latest receiver channel values.
pub trait RxProvider: Send + Sync {
    fn channels(&self) -> Option<RxChannels>;
}

/// Outbound link to the ground station.
pub trait FlightControlProvider: Send + Sync {
    fn send_message(&self, command: &Command) -> Result<(), KernelError>;
}

/// Exposes the load guard's sampled metric to other recorders.
pub trait LoadGuard: Send + Sync {
    /// Last sampled utilization, 0–100.  `None` before the first sample.
    fn utilization(&self) -> Option<f32>;

    fn state(&self) -> WatchdogState;
}

/// A resolved role: the handle plus the index of the entry that owns it.
pub(crate) struct Binding<T: ?Sized> {
    pub(crate) owner: usize,
    pub(crate) handle: Arc<T>,
}

impl<T: ?Sized> Binding<T> {
    /// The handle, if its owner is still available.
    pub(crate) fn available(&self, entries: &[ModuleEntry]) -> Option<Arc<T>> {
        entries
            .get(self.owner)
            .filter(|e| e.is_available())
            .map(|_| Arc::clone(&self.handle))
    }
}

/// Role bindings extracted from the module set.
#[derive(Default)]
pub(crate) struct RoleTable {
    pub(crate) orientation: Option<Binding<dyn OrientationProvider>>,
    pub(crate) rx: Option<Binding<dyn RxProvider>>,
    pub(crate) flight_control: Option<Binding<dyn FlightControlProvider>>,
    pub(crate) load_guard: Option<Binding<dyn LoadGuard>>,
    pub(crate) command_executor: Option<Binding<dyn CommandExecutor>>,
    pub(crate) command_receiver: Option<Binding<dyn CommandReceiver>>,
}

fn bind<T: ?Sized>(
    slot: &mut Option<Binding<T>>,
    candidate: &Option<Arc<T>>,
    owner: usize,
    module: &str,
    role: Role,
) {
    if let Some(handle) = candidate {
        if let Some(previous) = slot.as_ref() {
            debug!(module, replaced = previous.owner, "Custom {role} set");
        } else {
            debug!(module, "{role} set");
        }
        *slot = Some(Binding {
            owner,
            handle: Arc::clone(handle),
        });
    }
}

impl RoleTable {
    /// Resolve every role over `entries` in registration order.
    pub(crate) fn resolve(entries: &[ModuleEntry]) -> Self {
        let mut table = RoleTable::default();
        for (idx, entry) in entries.iter().enumerate() {
            let caps = &entry.caps;
            let name = entry.name.as_str();
            bind(&mut table.orientation, &caps.orientation, idx, name, Role::OrientationProvider);
            bind(&mut table.rx, &caps.rx, idx, name, Role::RxProvider);
            bind(&mut table.flight_control, &caps.flight_control, idx, name, Role::FlightControlProvider);
            bind(&mut table.load_guard, &caps.load_guard, idx, name, Role::LoadGuard);
            bind(&mut table.command_executor, &caps.command_executor, idx, name, Role::CommandExecutor);
            bind(&mut table.command_receiver, &caps.command_receiver, idx, name, Role::CommandReceiver);
        }
        table
    }
}
