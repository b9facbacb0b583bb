//! Inbound command entry point.

use std::sync::Arc;

use raspilot_types::Command;
use tracing::debug;

use crate::bus::{CommandExecutor, DispatchOutcome};

/// Receives commands that originate outside the kernel.
///
/// Protocol collaborators never reach into the executor directly; they hand
/// decoded commands to the receiver role, which decides how to route them.
pub trait CommandReceiver: Send + Sync {
    fn receive(&self, command: Command) -> DispatchOutcome;
}

/// Default receiver: every inbound command goes straight to the executor.
pub struct ForwardingReceiver {
    executor: Arc<dyn CommandExecutor>,
}

impl ForwardingReceiver {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

impl CommandReceiver for ForwardingReceiver {
    fn receive(&self, command: Command) -> DispatchOutcome {
        debug!(command = %command.name(), "Received command");
        self.executor.execute(&command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CommandBus;
    use raspilot_types::KernelError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn forwards_to_executor() {
        let bus = Arc::new(CommandBus::new());
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        bus.register_fn("ahi", move |_: &Command| -> Result<(), KernelError> {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let receiver = ForwardingReceiver::new(bus);
        let outcome = receiver.receive(Command::new("ahi").unwrap());
        assert!(outcome.is_handled());
        assert!(seen.load(Ordering::SeqCst));
    }
}
