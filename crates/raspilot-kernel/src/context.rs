//! [`KernelContext`] – the handle every module receives at initialization.
//!
//! The context is how a module reaches the rest of the system: singleton
//! roles, sibling modules by concrete type, the command bus, the inbound
//! command inbox, the event loop, and a logging span scoped to the module.
//!
//! Holding a context keeps the kernel's shared state alive.  Long-lived
//! listeners stored *inside* that state (watchdog notifiers, handlers)
//! should keep a [`WeakKernelContext`] instead.

use std::sync::{Arc, Weak};

use raspilot_middleware::{
    CommandBus, CommandExecutor, CommandHandler, CommandInbox, CommandReceiver, CommandSender,
    DispatchOutcome, ForwardingReceiver, HandlerHandle,
};
use raspilot_types::{Command, KernelError, Role};
use tokio::runtime::Handle;
use tracing::{Span, info_span, warn};

use crate::event_loop::ShutdownHandle;
use crate::module::{Module, ModuleEntry};
use crate::roles::{FlightControlProvider, LoadGuard, OrientationProvider, RoleTable, RxProvider};

/// State shared by the kernel and every context it hands out.
pub(crate) struct KernelShared {
    pub(crate) entries: Vec<ModuleEntry>,
    pub(crate) roles: RoleTable,
    default_executor: Arc<dyn CommandExecutor>,
    default_receiver: Arc<dyn CommandReceiver>,
    pub(crate) inbox: CommandInbox,
    pub(crate) event_loop: Handle,
    pub(crate) shutdown: ShutdownHandle,
    pub(crate) span: Span,
}

impl KernelShared {
    pub(crate) fn new(
        entries: Vec<ModuleEntry>,
        event_loop: Handle,
        shutdown: ShutdownHandle,
        span: Span,
    ) -> Self {
        let roles = RoleTable::resolve(&entries);
        let default_executor: Arc<dyn CommandExecutor> = Arc::new(CommandBus::new());
        let default_receiver: Arc<dyn CommandReceiver> =
            Arc::new(ForwardingReceiver::new(Arc::clone(&default_executor)));
        Self {
            entries,
            roles,
            default_executor,
            default_receiver,
            inbox: CommandInbox::new(),
            event_loop,
            shutdown,
            span,
        }
    }

    /// The executor role.  A custom executor is used even if its owner failed
    /// to start: commands must always have somewhere to go.
    pub(crate) fn executor(&self) -> Arc<dyn CommandExecutor> {
        match &self.roles.command_executor {
            Some(binding) if !self.entries[binding.owner].is_excluded() => Arc::clone(&binding.handle),
            _ => Arc::clone(&self.default_executor),
        }
    }

    /// The receiver role.  The default forwards to [`Self::executor`].
    pub(crate) fn receiver(&self) -> Arc<dyn CommandReceiver> {
        match &self.roles.command_receiver {
            Some(binding) if !self.entries[binding.owner].is_excluded() => Arc::clone(&binding.handle),
            _ if self.roles.command_executor.is_some() => {
                Arc::new(ForwardingReceiver::new(self.executor()))
            }
            _ => Arc::clone(&self.default_receiver),
        }
    }

    pub(crate) fn get_module<T: Module>(&self) -> Option<Arc<T>> {
        self.entries
            .iter()
            .filter(|e| !e.is_excluded())
            .find_map(ModuleEntry::downcast::<T>)
    }

    pub(crate) fn orientation_provider(&self) -> Option<Arc<dyn OrientationProvider>> {
        self.roles.orientation.as_ref()?.available(&self.entries)
    }

    pub(crate) fn rx_provider(&self) -> Option<Arc<dyn RxProvider>> {
        self.roles.rx.as_ref()?.available(&self.entries)
    }

    pub(crate) fn flight_control(&self) -> Option<Arc<dyn FlightControlProvider>> {
        self.roles.flight_control.as_ref()?.available(&self.entries)
    }

    pub(crate) fn load_guard(&self) -> Option<Arc<dyn LoadGuard>> {
        self.roles.load_guard.as_ref()?.available(&self.entries)
    }

    pub(crate) fn failed_modules(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.is_failed())
            .map(|e| e.name.clone())
            .collect()
    }

    /// Log and broadcast a `system.degraded` notification.
    pub(crate) fn report_degraded(&self, component: &str, phase: &str, reason: &str) {
        warn!(parent: &self.span, module = component, phase, reason, "System degraded");
        let command = Command::system_degraded(component, phase, reason);
        self.executor().execute(&command);
        if let Some(sink) = self.flight_control() {
            if let Err(e) = sink.send_message(&command) {
                warn!(parent: &self.span, error = %e, "Failed to forward degraded notification");
            }
        }
    }
}

/// Handle passed to [`Module::initialize`].
#[derive(Clone)]
pub struct KernelContext {
    shared: Arc<KernelShared>,
    module: String,
    span: Span,
}

impl KernelContext {
    pub(crate) fn new(shared: Arc<KernelShared>, module: &str) -> Self {
        let span = info_span!(parent: &shared.span, "module", module);
        Self {
            shared,
            module: module.to_string(),
            span,
        }
    }

    /// Name of the module this context was issued to.
    pub fn module_name(&self) -> &str {
        &self.module
    }

    /// Logging span scoped to this module.  Enter it from worker threads the
    /// module spawns so their events carry the module name.
    pub fn span(&self) -> &Span {
        &self.span
    }

    // ── Sibling lookup ──────────────────────────────────────────────────────

    /// First activated module of concrete type `T`, in registration order.
    pub fn get_module<T: Module>(&self) -> Option<Arc<T>> {
        self.shared.get_module::<T>()
    }

    // ── Roles ───────────────────────────────────────────────────────────────

    pub fn orientation_provider(&self) -> Option<Arc<dyn OrientationProvider>> {
        self.shared.orientation_provider()
    }

    pub fn rx_provider(&self) -> Option<Arc<dyn RxProvider>> {
        self.shared.rx_provider()
    }

    pub fn flight_control(&self) -> Option<Arc<dyn FlightControlProvider>> {
        self.shared.flight_control()
    }

    pub fn load_guard(&self) -> Option<Arc<dyn LoadGuard>> {
        self.shared.load_guard()
    }

    pub fn command_executor(&self) -> Arc<dyn CommandExecutor> {
        self.shared.executor()
    }

    /// Modules that failed to start in this run.
    pub fn failed_modules(&self) -> Vec<String> {
        self.shared.failed_modules()
    }

    pub fn command_receiver(&self) -> Arc<dyn CommandReceiver> {
        self.shared.receiver()
    }

    /// # Errors
    ///
    /// [`KernelError::MissingRole`] when no module supplies orientation.
    pub fn require_orientation_provider(&self) -> Result<Arc<dyn OrientationProvider>, KernelError> {
        self.orientation_provider()
            .ok_or_else(|| self.missing(Role::OrientationProvider))
    }

    /// # Errors
    ///
    /// [`KernelError::MissingRole`] when no module supplies RX channels.
    pub fn require_rx_provider(&self) -> Result<Arc<dyn RxProvider>, KernelError> {
        self.rx_provider().ok_or_else(|| self.missing(Role::RxProvider))
    }

    /// # Errors
    ///
    /// [`KernelError::MissingRole`] when no flight-control link is registered.
    pub fn require_flight_control(&self) -> Result<Arc<dyn FlightControlProvider>, KernelError> {
        self.flight_control()
            .ok_or_else(|| self.missing(Role::FlightControlProvider))
    }

    fn missing(&self, role: Role) -> KernelError {
        KernelError::MissingRole {
            module: self.module.clone(),
            role,
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    pub fn register_handler(&self, name: &str, handler: Arc<dyn CommandHandler>) -> HandlerHandle {
        self.shared.executor().register(name, handler)
    }

    pub fn register_command<F>(&self, name: &str, handler: F) -> HandlerHandle
    where
        F: Fn(&Command) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(handler))
    }

    pub fn unregister_command(&self, handle: &HandlerHandle) {
        self.shared.executor().unregister(handle);
    }

    /// Dispatch `command` synchronously on the caller's thread.
    pub fn execute(&self, command: &Command) -> DispatchOutcome {
        self.shared.executor().execute(command)
    }

    /// Producer handle for the inbound command inbox.  Safe to move into
    /// read loops on other threads.
    pub fn command_sender(&self) -> CommandSender {
        self.shared.inbox.sender()
    }

    /// Log and broadcast a `system.degraded` notification for this module.
    pub fn report_degraded(&self, phase: &str, reason: &str) {
        self.shared.report_degraded(&self.module, phase, reason);
    }

    pub(crate) fn report_degraded_for(&self, component: &str, phase: &str, reason: &str) {
        self.shared.report_degraded(component, phase, reason);
    }

    // ── Runtime ─────────────────────────────────────────────────────────────

    /// Handle to the shared event loop for non-blocking I/O.
    pub fn event_loop(&self) -> Handle {
        self.shared.event_loop.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shared.shutdown.clone()
    }

    pub fn downgrade(&self) -> WeakKernelContext {
        WeakKernelContext {
            shared: Arc::downgrade(&self.shared),
            module: self.module.clone(),
            span: self.span.clone(),
        }
    }
}

/// Non-owning [`KernelContext`].
#[derive(Clone)]
pub struct WeakKernelContext {
    shared: Weak<KernelShared>,
    module: String,
    span: Span,
}

impl WeakKernelContext {
    /// `None` once the kernel has been dropped.
    pub fn upgrade(&self) -> Option<KernelContext> {
        Some(KernelContext {
            shared: self.shared.upgrade()?,
            module: self.module.clone(),
            span: self.span.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::module::{Capabilities, ModuleHandle};
    use raspilot_types::{Orientation, RxChannels};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Radio;
    impl Module for Radio {
        fn capabilities(self: Arc<Self>) -> Capabilities {
            Capabilities::new().rx(self)
        }
    }
    impl RxProvider for Radio {
        fn channels(&self) -> Option<RxChannels> {
            Some(RxChannels::default())
        }
    }

    struct Logger;
    impl Module for Logger {}

    struct Router {
        bus: CommandBus,
        routed: AtomicUsize,
    }
    impl Module for Router {
        fn capabilities(self: Arc<Self>) -> Capabilities {
            Capabilities::new().command_executor(self)
        }
    }
    impl CommandExecutor for Router {
        fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) -> HandlerHandle {
            self.bus.register(name, handler)
        }
        fn unregister(&self, handle: &HandlerHandle) {
            self.bus.unregister(handle)
        }
        fn execute(&self, command: &Command) -> DispatchOutcome {
            self.routed.fetch_add(1, Ordering::SeqCst);
            self.bus.execute(command)
        }
    }

    fn shared(handles: Vec<ModuleHandle>) -> (Arc<KernelShared>, EventLoop) {
        let event_loop = EventLoop::new().unwrap();
        let entries = handles.into_iter().map(ModuleEntry::new).collect();
        let shared = KernelShared::new(entries, event_loop.handle(), ShutdownHandle::new(), Span::none());
        (Arc::new(shared), event_loop)
    }

    #[test]
    fn require_reports_missing_role_with_module_name() {
        let (shared, _loop) = shared(vec![Logger.into()]);
        let ctx = KernelContext::new(shared, "FlightController");
        match ctx.require_rx_provider() {
            Err(KernelError::MissingRole { module, role }) => {
                assert_eq!(module, "FlightController");
                assert_eq!(role, Role::RxProvider);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("rx provider should be missing"),
        }
        assert!(ctx.orientation_provider().is_none());
    }

    #[test]
    fn get_module_finds_sibling_by_type() {
        let (shared, _loop) = shared(vec![Logger.into(), Radio.into()]);
        let ctx = KernelContext::new(shared, "test");
        assert!(ctx.get_module::<Radio>().is_some());
        assert!(ctx.get_module::<Router>().is_none());
        assert!(ctx.require_rx_provider().is_ok());
    }

    #[test]
    fn excluded_module_is_invisible() {
        let (shared, _loop) = shared(vec![Radio.into()]);
        shared.entries[0].exclude();
        let ctx = KernelContext::new(shared, "test");
        assert!(ctx.get_module::<Radio>().is_none());
        assert!(ctx.rx_provider().is_none());
    }

    #[test]
    fn custom_executor_receives_dispatches() {
        let router = Arc::new(Router {
            bus: CommandBus::new(),
            routed: AtomicUsize::new(0),
        });
        let (shared, _loop) = shared(vec![ModuleHandle::shared(Arc::clone(&router))]);
        let ctx = KernelContext::new(shared, "test");

        ctx.register_command("ahi", |_: &Command| Ok(()));
        assert!(ctx.execute(&Command::new("ahi").unwrap()).is_handled());
        assert!(ctx.command_receiver().receive(Command::new("ahi").unwrap()).is_handled());
        assert_eq!(router.routed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn default_executor_is_shared_between_contexts() {
        let (shared, _loop) = shared(vec![]);
        let a = KernelContext::new(Arc::clone(&shared), "a");
        let b = KernelContext::new(shared, "b");
        a.register_command("orientation.set", |cmd: &Command| {
            cmd.get("roll").map(|_| ()).ok_or_else(|| KernelError::InvalidCommand("roll".into()))
        });
        let cmd = Command::new("orientation.set")
            .unwrap()
            .with_entry("roll", serde_json::json!(Orientation::default().roll));
        assert!(b.execute(&cmd).is_handled());
    }

    #[test]
    fn weak_context_does_not_keep_kernel_alive() {
        let (shared, _loop) = shared(vec![]);
        let ctx = KernelContext::new(shared, "test");
        let weak = ctx.downgrade();
        assert!(weak.upgrade().is_some());
        drop(ctx);
        assert!(weak.upgrade().is_none());
    }
}
