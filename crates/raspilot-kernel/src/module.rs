//! The module lifecycle contract.
//!
//! A module is any `Send + Sync` type implementing [`Module`].  Modules that
//! take part in the run phase additionally implement [`StartedModule`] and
//! advertise it, together with any singleton roles they fill, through
//! [`Module::capabilities`]:
//!
//! ```
//! use std::sync::Arc;
//! use raspilot_kernel::{Capabilities, Module, OrientationProvider, StartedModule};
//! use raspilot_types::{KernelError, Orientation};
//!
//! struct Imu;
//!
//! impl Module for Imu {
//!     fn capabilities(self: Arc<Self>) -> Capabilities {
//!         Capabilities::new().started(self.clone()).orientation(self)
//!     }
//! }
//!
//! impl StartedModule for Imu {
//!     fn start(&self) -> Result<bool, KernelError> { Ok(true) }
//!     fn stop(&self) -> Result<(), KernelError> { Ok(()) }
//! }
//!
//! impl OrientationProvider for Imu {
//!     fn current_orientation(&self) -> Option<Orientation> { None }
//! }
//!
//! let caps = Arc::new(Imu).capabilities();
//! assert_eq!(caps.roles().len(), 2);
//! ```

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use raspilot_middleware::{CommandExecutor, CommandReceiver};
use raspilot_types::{KernelError, Role};

use crate::context::KernelContext;
use crate::roles::{FlightControlProvider, LoadGuard, OrientationProvider, RxProvider};

/// Lifecycle contract every module satisfies.
pub trait Module: Send + Sync + 'static {
    /// Name used in logs and reports.  Defaults to the unqualified type name.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Return `false` to opt out of activation entirely.  Evaluated once,
    /// before any module is initialized.
    fn load(&self) -> bool {
        true
    }

    /// Called once per activated module.  Look up roles and siblings, and
    /// register command handlers here.  Return an error when a hard
    /// dependency is missing; the kernel aborts the bootstrap.
    fn initialize(&self, ctx: &KernelContext) -> Result<(), KernelError> {
        let _ = ctx;
        Ok(())
    }

    /// Capabilities this module declares.  Inspected once, at kernel
    /// construction.
    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::default()
    }
}

/// Run-phase contract for modules tagged [`Role::Started`].
pub trait StartedModule: Send + Sync {
    /// Called exactly once during the run phase.  `Ok(false)` and `Err` both
    /// mark the module as failed to start.
    fn start(&self) -> Result<bool, KernelError>;

    /// Called exactly once during shutdown, whether or not `start` succeeded.
    fn stop(&self) -> Result<(), KernelError>;
}

/// Capability set declared by a module.
#[derive(Default, Clone)]
pub struct Capabilities {
    pub(crate) started: Option<Arc<dyn StartedModule>>,
    pub(crate) orientation: Option<Arc<dyn OrientationProvider>>,
    pub(crate) rx: Option<Arc<dyn RxProvider>>,
    pub(crate) flight_control: Option<Arc<dyn FlightControlProvider>>,
    pub(crate) load_guard: Option<Arc<dyn LoadGuard>>,
    pub(crate) command_executor: Option<Arc<dyn CommandExecutor>>,
    pub(crate) command_receiver: Option<Arc<dyn CommandReceiver>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(mut self, module: Arc<dyn StartedModule>) -> Self {
        self.started = Some(module);
        self
    }

    pub fn orientation(mut self, provider: Arc<dyn OrientationProvider>) -> Self {
        self.orientation = Some(provider);
        self
    }

    pub fn rx(mut self, provider: Arc<dyn RxProvider>) -> Self {
        self.rx = Some(provider);
        self
    }

    pub fn flight_control(mut self, provider: Arc<dyn FlightControlProvider>) -> Self {
        self.flight_control = Some(provider);
        self
    }

    pub fn load_guard(mut self, guard: Arc<dyn LoadGuard>) -> Self {
        self.load_guard = Some(guard);
        self
    }

    pub fn command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.command_executor = Some(executor);
        self
    }

    pub fn command_receiver(mut self, receiver: Arc<dyn CommandReceiver>) -> Self {
        self.command_receiver = Some(receiver);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    /// Role tags derived from the declared capabilities.  A module with no
    /// capability is [`Role::Plain`].
    pub fn roles(&self) -> Vec<Role> {
        let mut roles = Vec::new();
        if self.orientation.is_some() {
            roles.push(Role::OrientationProvider);
        }
        if self.rx.is_some() {
            roles.push(Role::RxProvider);
        }
        if self.flight_control.is_some() {
            roles.push(Role::FlightControlProvider);
        }
        if self.load_guard.is_some() {
            roles.push(Role::LoadGuard);
        }
        if self.command_executor.is_some() {
            roles.push(Role::CommandExecutor);
        }
        if self.command_receiver.is_some() {
            roles.push(Role::CommandReceiver);
        }
        if self.started.is_some() {
            roles.push(Role::Started);
        }
        if roles.is_empty() {
            roles.push(Role::Plain);
        }
        roles
    }
}

/// A module ready to be handed to the kernel.
///
/// Keeps a type-erased handle next to the trait object so the kernel can
/// answer `get_module::<T>()` lookups by concrete type.
pub struct ModuleHandle {
    module: Arc<dyn Module>,
    any: Arc<dyn Any + Send + Sync>,
}

impl ModuleHandle {
    pub fn new<M: Module>(module: M) -> Self {
        Self::shared(Arc::new(module))
    }

    /// Wrap a module the caller keeps its own reference to.
    pub fn shared<M: Module>(module: Arc<M>) -> Self {
        Self {
            any: module.clone(),
            module,
        }
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }
}

impl<M: Module> From<M> for ModuleHandle {
    fn from(module: M) -> Self {
        Self::new(module)
    }
}

/// Kernel-side record of one module.
pub(crate) struct ModuleEntry {
    pub(crate) name: String,
    pub(crate) module: Arc<dyn Module>,
    any: Arc<dyn Any + Send + Sync>,
    pub(crate) caps: Capabilities,
    pub(crate) roles: Vec<Role>,
    excluded: AtomicBool,
    failed: AtomicBool,
}

impl ModuleEntry {
    pub(crate) fn new(handle: ModuleHandle) -> Self {
        let caps = Arc::clone(&handle.module).capabilities();
        let roles = caps.roles();
        Self {
            name: handle.module.name().to_string(),
            module: handle.module,
            any: handle.any,
            caps,
            roles,
            excluded: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn started(&self) -> Option<&Arc<dyn StartedModule>> {
        self.caps.started.as_ref()
    }

    pub(crate) fn downcast<T: Module>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }

    pub(crate) fn exclude(&self) {
        self.excluded.store(true, Ordering::Release);
    }

    pub(crate) fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Whether the roles this module fills may be handed out.
    pub(crate) fn is_available(&self) -> bool {
        !self.is_excluded() && !self.is_failed()
    }
}

/// `a::b::Name<c::D>` → `Name<c::D>`.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
