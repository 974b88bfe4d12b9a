//! Transfer module
//!
//! Data channel framing, socket tuning, passive/active setup and the file
//! copy loops used by the data-bearing commands.

pub mod data_channel;
pub mod file_ops;
pub mod framing;
pub mod modes;
pub mod operations;
pub mod socket_opts;

pub use data_channel::DataChannel;
pub use file_ops::{TransferOptions, TransferReport, receive_file, send_file, send_listing};
pub use framing::{DataSocket, DataStream, FramedReader, FramedWriter, PACKET_MODE, PACKET_SIZE};
pub use modes::{TransferMode, TransferType};
pub use operations::{open_data_socket, setup_active_mode, setup_passive_mode};
