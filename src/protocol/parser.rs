//! FTP Command parsing
//!
//! Turns one control line into a [`Command`].

use crate::protocol::commands::{Command, OptsCommand};

/// Splits a control line into an upper-case verb and its argument.
///
/// Leading NUL bytes (keep-alive probes) and the line terminator are
/// stripped.
pub fn split_command(raw: &str) -> (String, String) {
    let trimmed = raw.trim_start_matches('\0').trim_end_matches(['\r', '\n']).trim_start();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let arg = parts.next().unwrap_or("").trim().to_string();
    (verb, arg)
}

/// Parses a raw command string received from a client into the `Command` enum.
pub fn parse_command(raw: &str) -> Command {
    let (verb, arg) = split_command(raw);
    build_command(&verb, arg)
}

/// Builds a command from an already split verb and argument.
pub fn build_command(verb: &str, arg: String) -> Command {
    match verb {
        "USER" => Command::USER(arg),
        "PASS" => Command::PASS(arg),
        "QUIT" => Command::QUIT,
        "ABOR" => Command::ABOR,
        "FEAT" => Command::FEAT,
        "SYST" => Command::SYST,
        "TYPE" => Command::TYPE(arg),
        "ALIAS" => Command::ALIAS(arg),
        "DOMAIN" => Command::DOMAIN(arg),
        "PWD" | "XPWD" => Command::PWD,
        "CWD" | "XCWD" => Command::CWD(arg),
        "CDUP" | "XCUP" => Command::CDUP,
        "MKD" | "XMKD" => Command::MKD(arg),
        "RMD" | "XRMD" => Command::RMD(arg),
        "DELE" => Command::DELE(arg),
        "RNFR" => Command::RNFR(arg),
        "RNTO" => Command::RNTO(arg),
        "SIZE" => Command::SIZE(arg),
        "MDTM" => Command::MDTM(arg),
        "NOOP" => Command::NOOP,
        "REST" => Command::REST(arg),
        "PASV" => Command::PASV,
        "EPSV" => Command::EPSV,
        "PORT" => Command::PORT(arg),
        "EPRT" => Command::EPRT(arg),
        "RETR" => Command::RETR(arg),
        "STOR" => Command::STOR(arg),
        "APPE" => Command::APPE(arg),
        "LIST" => Command::LIST(arg),
        "NLST" => Command::NLST(arg),
        "SITE" => Command::SITE(arg),
        "OPTS" => Command::OPTS(OptsCommand::parse(&arg)),
        other => Command::UNKNOWN(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(parse_command("retr file.txt\r\n"), Command::RETR("file.txt".into()));
        assert_eq!(parse_command("Pasv"), Command::PASV);
    }

    #[test]
    fn keepalive_nul_is_ignored() {
        assert_eq!(parse_command("\0\0NOOP\r\n"), Command::NOOP);
    }

    #[test]
    fn opts_subcommands() {
        assert_eq!(
            parse_command("OPTS PTCP 4"),
            Command::OPTS(OptsCommand::Ptcp("4".into()))
        );
        assert_eq!(
            parse_command("opts dataalive"),
            Command::OPTS(OptsCommand::DataAlive)
        );
    }

    #[test]
    fn commands_format_back_to_wire_form() {
        assert_eq!(Command::RETR("a b".into()).to_string(), "RETR a b");
        assert_eq!(Command::OPTS(OptsCommand::Md5Sum).to_string(), "OPTS MD5SUM");
        assert_eq!(Command::LIST(String::new()).to_string(), "LIST");
    }

    #[test]
    fn unknown_verb_is_kept() {
        assert_eq!(parse_command("XYZZY 1"), Command::UNKNOWN("XYZZY".into()));
    }
}
