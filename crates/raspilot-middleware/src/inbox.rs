//! [`CommandInbox`] – non-blocking hand-off from protocol threads.
//!
//! Serial read loops and socket callbacks run on their own workers.  Rather
//! than calling into kernel internals from there, they push decoded
//! [`Command`] values through a [`CommandSender`].  The kernel drains the
//! inbox on its event loop with [`pump`] and forwards each command to the
//! [`CommandReceiver`] role.

use std::sync::Arc;

use parking_lot::Mutex;
use raspilot_types::{Command, KernelError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::receiver::CommandReceiver;

/// Owns both ends of the inbound command queue until the kernel takes the
/// receiving end.
pub struct CommandInbox {
    sender: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl CommandInbox {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// A cloneable producer handle.
    pub fn sender(&self) -> CommandSender {
        CommandSender(self.sender.clone())
    }

    /// Take the consuming end.  Returns `None` once it has been taken.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Command>> {
        self.receiver.lock().take()
    }
}

impl Default for CommandInbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the [`CommandInbox`].  Never blocks.
#[derive(Clone, Debug)]
pub struct CommandSender(mpsc::UnboundedSender<Command>);

impl CommandSender {
    /// Queue `command` for dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Io`] once the kernel has shut the inbox down.
    pub fn send(&self, command: Command) -> Result<(), KernelError> {
        self.0
            .send(command)
            .map_err(|e| KernelError::Io(format!("command inbox closed, dropped '{}'", e.0.name())))
    }

    /// Decode a JSON command frame and queue it.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidCommand`] for undecodable frames, or
    /// [`KernelError::Io`] when the inbox is closed.
    pub fn send_json(&self, frame: &[u8]) -> Result<(), KernelError> {
        let command = Command::from_json(frame)?;
        self.send(command)
    }
}

/// Drain `rx` into `receiver` until every sender is gone or the task is
/// cancelled.  Returns the number of commands delivered.
pub async fn pump(
    mut rx: mpsc::UnboundedReceiver<Command>,
    receiver: Arc<dyn CommandReceiver>,
) -> usize {
    let mut delivered = 0;
    while let Some(command) = rx.recv().await {
        debug!(command = %command.name(), "Inbound command dequeued");
        receiver.receive(command);
        delivered += 1;
    }
    warn!(delivered, "Command inbox closed");
    delivered
}
