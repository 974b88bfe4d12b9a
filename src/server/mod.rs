//! Server module
//!
//! Control port listener and connection admission.

mod core;

pub use self::core::Server;
