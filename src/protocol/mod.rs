//! FTP Protocol implementation
//!
//! Command parsing, address formats, reply formatting and the server-side
//! command handlers.

pub mod address;
pub mod commands;
pub mod handlers;
pub mod parser;
pub mod responses;

pub use commands::{Command, CommandResult, CommandStatus, OptsCommand};
pub use handlers::{HandlerContext, handle_command};
pub use parser::{build_command, parse_command, split_command};
