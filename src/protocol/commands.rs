//! Module `commands`
//!
//! FTP commands as exchanged on the control connection, the vendor `OPTS`
//! sub-commands, and the result type the server handlers return.

use std::fmt;

/// Represents an FTP command.
///
/// Commands that take an argument keep it verbatim; handlers decide
/// whether an empty argument is a parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Command {
    USER(String),
    PASS(String),
    QUIT,
    ABOR,
    FEAT,
    SYST,
    TYPE(String),
    ALIAS(String),
    DOMAIN(String),
    PWD,
    CWD(String),
    CDUP,
    MKD(String),
    RMD(String),
    DELE(String),
    RNFR(String),
    RNTO(String),
    SIZE(String),
    MDTM(String),
    NOOP,
    REST(String),
    PASV,
    EPSV,
    PORT(String),
    EPRT(String),
    RETR(String),
    STOR(String),
    APPE(String),
    LIST(String),
    NLST(String),
    SITE(String),
    OPTS(OptsCommand),
    /// Verb not understood, kept for the error reply.
    UNKNOWN(String),
}

impl Command {
    /// Upper-case verb as sent on the wire.
    pub fn verb(&self) -> &str {
        match self {
            Command::USER(_) => "USER",
            Command::PASS(_) => "PASS",
            Command::QUIT => "QUIT",
            Command::ABOR => "ABOR",
            Command::FEAT => "FEAT",
            Command::SYST => "SYST",
            Command::TYPE(_) => "TYPE",
            Command::ALIAS(_) => "ALIAS",
            Command::DOMAIN(_) => "DOMAIN",
            Command::PWD => "PWD",
            Command::CWD(_) => "CWD",
            Command::CDUP => "CDUP",
            Command::MKD(_) => "MKD",
            Command::RMD(_) => "RMD",
            Command::DELE(_) => "DELE",
            Command::RNFR(_) => "RNFR",
            Command::RNTO(_) => "RNTO",
            Command::SIZE(_) => "SIZE",
            Command::MDTM(_) => "MDTM",
            Command::NOOP => "NOOP",
            Command::REST(_) => "REST",
            Command::PASV => "PASV",
            Command::EPSV => "EPSV",
            Command::PORT(_) => "PORT",
            Command::EPRT(_) => "EPRT",
            Command::RETR(_) => "RETR",
            Command::STOR(_) => "STOR",
            Command::APPE(_) => "APPE",
            Command::LIST(_) => "LIST",
            Command::NLST(_) => "NLST",
            Command::SITE(_) => "SITE",
            Command::OPTS(_) => "OPTS",
            Command::UNKNOWN(verb) => verb,
        }
    }

    /// Commands accepted before the user has logged in.
    pub fn allowed_before_login(&self) -> bool {
        matches!(
            self,
            Command::USER(_)
                | Command::PASS(_)
                | Command::FEAT
                | Command::SYST
                | Command::ALIAS(_)
                | Command::TYPE(_)
                | Command::QUIT
                | Command::ABOR
        )
    }

    fn argument(&self) -> Option<String> {
        match self {
            Command::USER(a)
            | Command::PASS(a)
            | Command::TYPE(a)
            | Command::ALIAS(a)
            | Command::DOMAIN(a)
            | Command::CWD(a)
            | Command::MKD(a)
            | Command::RMD(a)
            | Command::DELE(a)
            | Command::RNFR(a)
            | Command::RNTO(a)
            | Command::SIZE(a)
            | Command::MDTM(a)
            | Command::REST(a)
            | Command::PORT(a)
            | Command::EPRT(a)
            | Command::RETR(a)
            | Command::STOR(a)
            | Command::APPE(a)
            | Command::LIST(a)
            | Command::NLST(a)
            | Command::SITE(a) => Some(a.clone()),
            Command::OPTS(opts) => Some(opts.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.argument() {
            Some(arg) if !arg.is_empty() => write!(f, "{} {}", self.verb(), arg),
            _ => write!(f, "{}", self.verb()),
        }
    }
}

/// Vendor extensions carried by `OPTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptsCommand {
    /// Digest every following transfer.
    Md5Sum,
    /// Checksum the client expects for the next `MD5DUMP`.
    Md5Set(String),
    /// Record and report the checksum of a file.
    Md5Dump(String),
    /// Compression filters applied to uploads (`RCOMP`).
    InputFilters(String),
    /// Compression filters applied to downloads (`SCOMP`).
    OutputFilters(String),
    /// Number of parallel streams for the next data channels.
    Ptcp(String),
    PShared,
    DataAlive,
    /// Create or truncate a file without a transfer.
    Empty(String),
    Mkdirs,
    Utf8(String),
    Unknown(String),
}

impl OptsCommand {
    pub fn parse(arg: &str) -> Self {
        let mut parts = arg.trim().splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or("").to_ascii_uppercase();
        let value = parts.next().unwrap_or("").trim().to_string();

        match name.as_str() {
            "MD5SUM" => OptsCommand::Md5Sum,
            "MD5SET" => OptsCommand::Md5Set(value),
            "MD5DUMP" => OptsCommand::Md5Dump(value),
            "RCOMP" => OptsCommand::InputFilters(value),
            "SCOMP" => OptsCommand::OutputFilters(value),
            "PTCP" => OptsCommand::Ptcp(value),
            "PSHARED" => OptsCommand::PShared,
            "DATAALIVE" => OptsCommand::DataAlive,
            "EMPTY" => OptsCommand::Empty(value),
            "MKDIRS" => OptsCommand::Mkdirs,
            "UTF8" => OptsCommand::Utf8(value),
            _ => OptsCommand::Unknown(arg.trim().to_string()),
        }
    }
}

impl fmt::Display for OptsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptsCommand::Md5Sum => write!(f, "MD5SUM"),
            OptsCommand::Md5Set(v) => write!(f, "MD5SET {}", v),
            OptsCommand::Md5Dump(v) => write!(f, "MD5DUMP {}", v),
            OptsCommand::InputFilters(v) => write!(f, "RCOMP {}", v),
            OptsCommand::OutputFilters(v) => write!(f, "SCOMP {}", v),
            OptsCommand::Ptcp(v) => write!(f, "PTCP {}", v),
            OptsCommand::PShared => write!(f, "PSHARED"),
            OptsCommand::DataAlive => write!(f, "DATAALIVE"),
            OptsCommand::Empty(v) => write!(f, "EMPTY {}", v),
            OptsCommand::Mkdirs => write!(f, "MKDIRS"),
            OptsCommand::Utf8(v) => write!(f, "UTF8 {}", v),
            OptsCommand::Unknown(v) => write!(f, "{}", v),
        }
    }
}

/// Represents the outcome status of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failure(String),
    CloseConnection,
}

/// Result of a command: its status and the final reply to send, if any.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub message: Option<String>,
}

impl CommandResult {
    pub fn success(message: String) -> Self {
        Self {
            status: CommandStatus::Success,
            message: Some(message),
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            status: CommandStatus::Failure(message.trim_end().to_string()),
            message: Some(message),
        }
    }

    pub fn close(message: String) -> Self {
        Self {
            status: CommandStatus::CloseConnection,
            message: Some(message),
        }
    }
}
