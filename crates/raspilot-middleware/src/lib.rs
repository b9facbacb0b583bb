//! `raspilot-middleware` – command routing
//!
//! Moves [`Command`][raspilot_types::Command] values between modules without
//! caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – [`CommandBus`]: the name→handler registry and dispatcher.
//!   At most one handler per command name; handler failures are isolated to
//!   the single dispatch that triggered them.
//! - [`receiver`] – [`CommandReceiver`]: the entry point for commands that
//!   arrive from outside (ground station, companion devices).  The default
//!   [`ForwardingReceiver`] hands them straight to the executor.
//! - [`inbox`] – [`CommandInbox`]: a non-blocking queue that protocol
//!   collaborators push decoded commands onto from any thread; the kernel
//!   drains it on its event loop.

pub mod bus;
pub mod inbox;
pub mod receiver;

pub use bus::{CommandBus, CommandExecutor, CommandHandler, DispatchOutcome, HandlerHandle};
pub use inbox::{CommandInbox, CommandSender};
pub use receiver::{CommandReceiver, ForwardingReceiver};
