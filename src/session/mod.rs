//! Session module
//!
//! Per-connection state, the control reply writer, the command loop and
//! the registry that counts live sessions.

pub mod handler;
pub mod registry;
pub mod reply;
pub mod state;

pub use handler::{SessionServices, handle_session};
pub use registry::{ServerStats, SessionGuard, SessionRegistry, StatsSnapshot};
pub use reply::ReplyWriter;
pub use state::{ChecksumState, DomainContext, Session};
