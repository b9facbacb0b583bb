//! Command bus: name→handler registry and dispatcher.
//!
//! The registry is the only structure mutated concurrently by unrelated
//! modules (handlers are registered from every module's `initialize`, and
//! dispatch happens from network callbacks, serial read threads and timer
//! threads).  A single mutex guards the map; it is held for the map
//! operation only, never across a handler invocation, so a slow handler
//! cannot stall registration elsewhere.
//!
//! # Dispatch rules
//!
//! | Situation | Result |
//! |---|---|
//! | No handler for the name | warning logged, [`DispatchOutcome::Unknown`] |
//! | Handler returns `Err` | error logged with name and data, [`DispatchOutcome::Failed`] |
//! | Handler panics | panic caught, logged, [`DispatchOutcome::Failed`] |
//!
//! Nothing is ever propagated to the caller of [`CommandBus::execute`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use raspilot_types::{Command, KernelError, panic_reason};
use tracing::{debug, error, warn};

/// A callable bound to one command name.
///
/// Any `Fn(&Command) -> Result<(), KernelError>` closure is a handler.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command) -> Result<(), KernelError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> Result<(), KernelError> + Send + Sync,
{
    fn handle(&self, command: &Command) -> Result<(), KernelError> {
        self(command)
    }
}

/// Returned by [`CommandExecutor::register`]; identifies one specific
/// registration so that a stale handle cannot remove a newer handler
/// registered under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    name: String,
    token: u64,
}

impl HandlerHandle {
    /// Command name this handle was registered for.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A handler ran and returned `Ok`.
    Handled,
    /// No handler is registered for the command name.
    Unknown,
    /// The handler returned an error or panicked.
    Failed(KernelError),
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled)
    }
}

/// The command executor role: registry plus dispatch.
///
/// [`CommandBus`] is the default implementation; a module may supply its own
/// by declaring the command-executor role.
pub trait CommandExecutor: Send + Sync {
    /// Install `handler` for `name`, replacing any existing handler.
    fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) -> HandlerHandle;

    /// Remove the registration identified by `handle`.  Unknown or stale
    /// handles are ignored.
    fn unregister(&self, handle: &HandlerHandle);

    /// Dispatch `command` to its handler.  Never fails.
    fn execute(&self, command: &Command) -> DispatchOutcome;
}

impl dyn CommandExecutor {
    /// Register a closure as the handler for `name`.
    pub fn register_fn<F>(&self, name: &str, handler: F) -> HandlerHandle
    where
        F: Fn(&Command) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler))
    }
}

struct Registration {
    token: u64,
    handler: Arc<dyn CommandHandler>,
}

/// Default [`CommandExecutor`]: a mutex-guarded map from command name to
/// handler.
///
/// # Example
///
/// ```
/// use raspilot_middleware::{CommandBus, CommandExecutor, DispatchOutcome};
/// use raspilot_types::Command;
///
/// let bus = CommandBus::new();
/// bus.register_fn("ping", |_cmd: &Command| Ok(()));
///
/// let ping = Command::new("ping").unwrap();
/// assert_eq!(bus.execute(&ping), DispatchOutcome::Handled);
///
/// let noise = Command::new("nonexistent.cmd").unwrap();
/// assert_eq!(bus.execute(&noise), DispatchOutcome::Unknown);
/// ```
#[derive(Default)]
pub struct CommandBus {
    handlers: Mutex<HashMap<String, Registration>>,
    next_token: AtomicU64,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure as the handler for `name`.
    pub fn register_fn<F>(&self, name: &str, handler: F) -> HandlerHandle
    where
        F: Fn(&Command) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler))
    }

    /// Whether a handler is currently registered for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.lock().contains_key(name)
    }

    /// Names with a registered handler, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl CommandExecutor for CommandBus {
    fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) -> HandlerHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .handlers
            .lock()
            .insert(name.to_string(), Registration { token, handler })
            .is_some();
        if replaced {
            debug!(command = %name, "Handler replaced");
        } else {
            debug!(command = %name, "Handler registered");
        }
        HandlerHandle {
            name: name.to_string(),
            token,
        }
    }

    fn unregister(&self, handle: &HandlerHandle) {
        let mut handlers = self.handlers.lock();
        let current = handlers.get(&handle.name).map(|r| r.token);
        if current == Some(handle.token) {
            handlers.remove(&handle.name);
            drop(handlers);
            debug!(command = %handle.name, "Handler unregistered");
        }
    }

    fn execute(&self, command: &Command) -> DispatchOutcome {
        // Clone the handler out so the lock is released before it runs.
        let handler = self
            .handlers
            .lock()
            .get(command.name())
            .map(|r| Arc::clone(&r.handler));

        let Some(handler) = handler else {
            warn!(command = %command.name(), "Unknown command received");
            return DispatchOutcome::Unknown;
        };

        debug!(command = %command.name(), "Executing command");
        match catch_unwind(AssertUnwindSafe(|| handler.handle(command))) {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                error!(
                    command = %command.name(),
                    data = ?command.data(),
                    id = ?command.id(),
                    error = %e,
                    "Command handler failed"
                );
                DispatchOutcome::Failed(KernelError::HandlerFailed {
                    command: command.name().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                error!(
                    command = %command.name(),
                    data = ?command.data(),
                    id = ?command.id(),
                    %reason,
                    "Command handler panicked"
                );
                DispatchOutcome::Failed(KernelError::HandlerFailed {
                    command: command.name().to_string(),
                    reason,
                })
            }
        }
    }
}
