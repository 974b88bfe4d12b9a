//! FTP Response handling
//!
//! Defines FTP response codes and formatting.

/// Standard FTP response codes
pub const OPENING_DATA: u16 = 150;
pub const OK: u16 = 200;
pub const FEATURES: u16 = 211;
pub const FILE_STATUS: u16 = 213;
pub const SYSTEM_TYPE: u16 = 215;
pub const READY: u16 = 220;
pub const GOODBYE: u16 = 221;
pub const TRANSFER_COMPLETE: u16 = 226;
pub const PASSIVE_MODE: u16 = 227;
pub const EXTENDED_PASSIVE_MODE: u16 = 229;
pub const LOGIN_SUCCESS: u16 = 230;
pub const FILE_ACTION_OK: u16 = 250;
pub const PATH_CREATED: u16 = 257;
pub const PASSWORD_REQUIRED: u16 = 331;
pub const PENDING_FURTHER_INFO: u16 = 350;
pub const SERVICE_UNAVAILABLE: u16 = 421;
pub const CANT_OPEN_DATA: u16 = 425;
pub const TRANSFER_ABORTED: u16 = 426;
pub const ACTION_ABORTED: u16 = 451;
pub const UNKNOWN_COMMAND: u16 = 500;
pub const SYNTAX_ERROR: u16 = 501;
pub const BAD_SEQUENCE: u16 = 503;
pub const NOT_IMPLEMENTED_FOR_PARAM: u16 = 504;
pub const NOT_LOGGED_IN: u16 = 530;
pub const FILE_NOT_FOUND: u16 = 550;

/// Format a single-line FTP reply.
pub fn format_reply(code: u16, message: &str) -> String {
    format!("{} {}\r\n", code, message)
}

/// Format a multi-line reply: every body line carries `code-`, the last one
/// `code ` so the peer knows where the reply ends.
pub fn format_multiline<S: AsRef<str>>(code: u16, lines: &[S], last: &str) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&format!("{}-{}\r\n", code, line.as_ref()));
    }
    out.push_str(&format_reply(code, last));
    out
}

/// Reply for a command this server does not understand (or has disabled).
pub fn not_understood(command: &str) -> String {
    format_reply(UNKNOWN_COMMAND, &format!("'{}': command not understood", command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_reply_terminates_with_space_separator() {
        let reply = format_multiline(211, &["Extensions supported:", " EPSV"], "End");
        assert_eq!(reply, "211-Extensions supported:\r\n211- EPSV\r\n211 End\r\n");
    }
}
