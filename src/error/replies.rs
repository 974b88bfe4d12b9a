//! Error replies
//!
//! Converts handler-level errors into the single FTP reply the client sees.

use log::error;

use crate::error::types::{AuthError, StorageError, TransferError};
use crate::protocol::responses::format_reply;

/// Reply for a backing-store failure on `path`.
///
/// Not-found is always `550`. Other failures are `451` unless the operation
/// is a directory one (`MKD`/`RMD`), which legacy clients expect as `550`.
pub fn storage_reply(err: &StorageError, path: &str, directory_op: bool) -> String {
    match err {
        StorageError::NotFound(_) => format_reply(550, &format!("{path}: No such file or directory")),
        StorageError::Io(e) => {
            error!("Storage failure on {}: {}", path, e);
            let code = if directory_op { 550 } else { 451 };
            format_reply(code, &format!("{path}: Requested action aborted ({e})"))
        }
        other => {
            let code = if directory_op { 550 } else { 451 };
            format_reply(code, &format!("{path}: {other}"))
        }
    }
}

/// Reply for a failed data transfer or data channel setup.
pub fn transfer_reply(err: &TransferError, path: &str) -> String {
    match err {
        TransferError::DataChannelNotInitialized => format_reply(
            425,
            "Can't open data connection. Try using passive (PASV) transfers",
        ),
        TransferError::PortBindingFailed(..)
        | TransferError::NoAvailablePort
        | TransferError::ForeignPeer(_)
        | TransferError::ConnectionTimeout(_) => {
            format_reply(425, &format!("Can't open data connection ({err})"))
        }
        TransferError::InvalidPortCommand(_)
        | TransferError::IpMismatch { .. }
        | TransferError::InvalidPortRange(_) => format_reply(501, &err.to_string()),
        TransferError::SizeMismatch { .. } => format_reply(
            426,
            &format!("Connection closed; transfer aborted ({err})"),
        ),
        TransferError::FileTooLarge(_) => {
            format_reply(552, &format!("Insufficient storage space ({err})"))
        }
        TransferError::Storage(e) => storage_reply(e, path, false),
        TransferError::Framing(_) | TransferError::TransferFailed(_) => format_reply(
            426,
            &format!("Connection closed; transfer aborted ({err})"),
        ),
    }
}

/// Reply for a failed `PASS`.
pub fn auth_reply(err: &AuthError) -> String {
    format_reply(530, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn not_found_is_550_even_for_plain_files() {
        let reply = storage_reply(&StorageError::NotFound("/a".into()), "a", false);
        assert_eq!(reply, "550 a: No such file or directory\r\n");
    }

    #[test]
    fn directory_ops_map_logic_errors_to_550() {
        let err = StorageError::PermissionDenied("/d".into());
        assert!(storage_reply(&err, "d", true).starts_with("550 "));
        assert!(storage_reply(&err, "d", false).starts_with("451 "));
    }

    #[test]
    fn size_mismatch_is_a_hard_failure() {
        let err = TransferError::SizeMismatch { expected: 100, actual: 90 };
        assert!(transfer_reply(&err, "f").starts_with("426 "));
    }

    #[test]
    fn io_failure_during_transfer_is_426() {
        let err = TransferError::TransferFailed(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(transfer_reply(&err, "f").starts_with("426 "));
    }
}
