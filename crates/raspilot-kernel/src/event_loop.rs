//! The shared event loop and the shutdown signal that ends it.
//!
//! Network-bound collaborators spawn their non-blocking I/O onto the loop
//! through [`KernelContext::event_loop`][crate::KernelContext::event_loop].
//! Blocking work (serial reads, periodic ticks) never runs here; those own a
//! dedicated thread.

use std::sync::Arc;

use raspilot_middleware::{CommandReceiver, inbox};
use raspilot_types::{Command, KernelError};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Cloneable request to make [`Kernel::run`][crate::Kernel::run] return.
///
/// Level-triggered: once requested it stays requested.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }

    pub fn request(&self) {
        if !self.flag.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-threaded tokio reactor owned by the kernel.
pub struct EventLoop {
    runtime: Runtime,
}

impl EventLoop {
    /// # Errors
    ///
    /// [`KernelError::Io`] if the reactor cannot be created.
    pub fn new() -> Result<Self, KernelError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("raspilot-event-loop")
            .build()?;
        Ok(Self { runtime })
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Drive the loop until `shutdown` is requested, draining the command
    /// inbox into `receiver` meanwhile.  Tasks spawned by modules keep running
    /// for as long as this call blocks.
    pub fn run_until(
        &self,
        shutdown: &ShutdownHandle,
        inbox: Option<mpsc::UnboundedReceiver<Command>>,
        receiver: Arc<dyn CommandReceiver>,
    ) {
        self.runtime.block_on(async {
            let pump = inbox.map(|rx| tokio::spawn(inbox::pump(rx, receiver)));
            debug!(inbox = pump.is_some(), "Event loop running");
            shutdown.wait().await;
            if let Some(pump) = pump {
                pump.abort();
            }
        });
        debug!("Event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raspilot_middleware::{CommandBus, CommandExecutor, CommandInbox, ForwardingReceiver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn shutdown_is_level_triggered() {
        let shutdown = ShutdownHandle::new();
        assert!(!shutdown.is_requested());
        shutdown.request();
        shutdown.request();
        assert!(shutdown.clone().is_requested());
    }

    #[test]
    fn run_until_returns_after_request_from_another_thread() {
        let event_loop = EventLoop::new().unwrap();
        let shutdown = ShutdownHandle::new();
        let remote = shutdown.clone();
        let bus: Arc<dyn CommandExecutor> = Arc::new(CommandBus::new());

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.request();
        });
        event_loop.run_until(&shutdown, None, Arc::new(ForwardingReceiver::new(bus)));
        stopper.join().unwrap();
        assert!(shutdown.is_requested());
    }

    #[test]
    fn inbox_commands_reach_receiver_while_running() {
        let event_loop = EventLoop::new().unwrap();
        let shutdown = ShutdownHandle::new();
        let bus = Arc::new(CommandBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let stop = shutdown.clone();
        bus.register_fn("ping", move |_: &Command| -> Result<(), KernelError> {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                stop.request();
            }
            Ok(())
        });

        let inbox = CommandInbox::new();
        let sender = inbox.sender();
        sender.send(Command::new("ping").unwrap()).unwrap();
        sender.send(Command::new("ping").unwrap()).unwrap();

        let executor: Arc<dyn CommandExecutor> = bus;
        event_loop.run_until(
            &shutdown,
            inbox.take_receiver(),
            Arc::new(ForwardingReceiver::new(executor)),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
