//! dissftp
//!
//! FTP control and data channel engine: a framed data channel codec, a
//! client with passive/active negotiation and a session server that speaks
//! the `OPTS` extensions.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transfer;

pub use client::FtpClient;
pub use config::{ClientConfig, ServerConfig};
pub use error::FtpError;
pub use keepalive::KeepAliveService;
pub use server::Server;
