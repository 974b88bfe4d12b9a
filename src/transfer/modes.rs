//! FTP Transfer modes
//!
//! Transfer type (TYPE A/I) and the data channel modes a session can be in.

use std::fmt;

/// Representation type selected with `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

impl TransferType {
    /// Parses the `TYPE` parameter; `A`, `I` and `L 8` are supported.
    pub fn from_param(param: &str) -> Option<Self> {
        let mut parts = param.split_whitespace();
        let kind = parts.next()?.to_ascii_uppercase();
        let arg = parts.next();
        match (kind.as_str(), arg) {
            ("A", None) | ("A", Some("N")) | ("A", Some("n")) => Some(TransferType::Ascii),
            ("I", None) => Some(TransferType::Binary),
            ("L", Some("8")) => Some(TransferType::Binary),
            _ => None,
        }
    }

    /// Line ending used for listings sent in this type.
    pub fn line_ending(&self) -> &'static str {
        match self {
            TransferType::Ascii => "\r\n",
            TransferType::Binary => "\n",
        }
    }

    pub fn code(&self) -> char {
        match self {
            TransferType::Ascii => 'A',
            TransferType::Binary => 'I',
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Ascii => write!(f, "ASCII"),
            TransferType::Binary => write!(f, "Binary"),
        }
    }
}

/// How a session's pending data channel was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Active,
    Passive,
    ExtendedActive,
    ExtendedPassive,
}

impl TransferMode {
    pub fn is_passive(&self) -> bool {
        matches!(self, TransferMode::Passive | TransferMode::ExtendedPassive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_parameter_variants() {
        assert_eq!(TransferType::from_param("A"), Some(TransferType::Ascii));
        assert_eq!(TransferType::from_param("a N"), Some(TransferType::Ascii));
        assert_eq!(TransferType::from_param("I"), Some(TransferType::Binary));
        assert_eq!(TransferType::from_param("L 8"), Some(TransferType::Binary));
        assert_eq!(TransferType::from_param("E"), None);
        assert_eq!(TransferType::from_param(""), None);
    }
}
