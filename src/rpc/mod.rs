//! JSON-lines RPC with the agent subprocess.
//!
//! Commands are encoded one per line on the agent's stdin; events are read
//! one per line from its stdout and fanned out to registered handlers.

mod client;
mod command;
mod dispatch;
mod error;
mod events;
mod process;
mod reader;

pub use client::*;
pub use command::*;
pub use dispatch::*;
pub use error::*;
pub use events::*;
pub use process::*;
pub use reader::*;
