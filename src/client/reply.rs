//! Server reply parsing and classification
//!
//! A reply is one or more lines. The first three characters of a line are
//! the code; a `-` in the fourth position opens a continuation that only a
//! line with the same code and no `-` closes.

use std::io;

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::error::FtpError;

/// One complete reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Raw lines without their terminator, in arrival order.
    pub lines: Vec<String>,
}

impl Reply {
    /// `1xx`: the final reply is still to come.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Every line joined with a space.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reply text with the code prefixes removed.
    pub fn message(&self) -> String {
        let code = self.code.to_string();
        self.lines
            .iter()
            .map(|line| {
                let line = line.trim();
                match line.strip_prefix(code.as_str()) {
                    Some(rest) if rest.starts_with(['-', ' ']) || rest.is_empty() => rest
                        .get(1..)
                        .unwrap_or("")
                        .trim(),
                    _ => line,
                }
            })
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Line-at-a-time reply state machine.
#[derive(Debug, Default)]
pub struct ReplyParser {
    continuing: Option<u16>,
    lines: Vec<String>,
}

fn line_code(line: &str) -> Option<u16> {
    let prefix = line.get(..3)?;
    if prefix.bytes().all(|b| b.is_ascii_digit()) {
        prefix.parse().ok()
    } else {
        None
    }
}

fn continues(line: &str) -> bool {
    line.as_bytes().get(3) == Some(&b'-')
}

impl ReplyParser {
    /// Feeds one line. Returns the reply once its terminating line is seen.
    pub fn push(&mut self, line: &str) -> Option<Reply> {
        if line.len() < 3 {
            debug!("Skipping short reply line {:?}", line);
            return None;
        }
        let code = line_code(line);

        match self.continuing {
            Some(open) => {
                self.lines.push(line.to_string());
                if code == Some(open) && !continues(line) {
                    self.continuing = None;
                    return Some(Reply {
                        code: open,
                        lines: std::mem::take(&mut self.lines),
                    });
                }
                None
            }
            None => {
                let Some(code) = code else {
                    warn!("Skipping non-numeric reply line {:?}", line);
                    return None;
                };
                self.lines.push(line.to_string());
                if continues(line) {
                    self.continuing = Some(code);
                    return None;
                }
                Some(Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                })
            }
        }
    }
}

/// Reads one line byte by byte. `\r\n` ends the line; a `\r` followed by
/// anything else is kept. Returns `None` at end of stream with nothing read.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(64);
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            Err(e) => return Err(e),
        };

        if byte == b'\r' {
            match reader.read_u8().await {
                Ok(b'\n') => break,
                Ok(next) => {
                    buf.push(b'\r');
                    buf.push(next);
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    buf.push(b'\r');
                    break;
                }
                Err(e) => return Err(e),
            }
            continue;
        }
        if byte == b'\n' {
            break;
        }
        buf.push(byte);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Reads lines until a complete reply has been parsed.
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Reply> {
    let mut parser = ReplyParser::default();
    loop {
        let Some(line) = read_line(reader).await? else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed by server",
            ));
        };
        debug!("< {}", line);
        if let Some(reply) = parser.push(&line) {
            return Ok(reply);
        }
    }
}

/// What the engine does with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    Success,
    /// Resend the same command.
    TryAgain,
    Error,
}

/// Inputs to [`classify`] besides the reply itself.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub logged_in: bool,
    pub last_command: &'a str,
    pub retry_codes: &'a [u16],
}

/// Classifies a reply. `530` before login and `550` are raised as errors.
pub fn classify(reply: &Reply, ctx: &ClassifyContext<'_>) -> Result<ReplyClass, FtpError> {
    let code = reply.code;
    if ctx.retry_codes.contains(&code) {
        return Ok(ReplyClass::TryAgain);
    }

    match code / 100 {
        1..=3 => Ok(ReplyClass::Success),
        5 if code == 530 => {
            if ctx.logged_in {
                Ok(ReplyClass::Error)
            } else {
                Err(FtpError::Login("Not logged in".into()))
            }
        }
        5 if code == 550 => {
            if ctx.last_command.starts_with("PASS") {
                return Err(FtpError::Login("Wrong password".into()));
            }
            let message = reply.message();
            let message = if message.is_empty() {
                format!("No reply from server (FTP code: {code})")
            } else {
                message
            };
            Err(FtpError::Io(io::Error::other(message)))
        }
        _ => Ok(ReplyClass::Error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(lines: &[&str]) -> Option<Reply> {
        let mut parser = ReplyParser::default();
        lines.iter().find_map(|line| parser.push(line))
    }

    fn ctx(last_command: &str) -> ClassifyContext<'_> {
        ClassifyContext {
            logged_in: true,
            last_command,
            retry_codes: &[],
        }
    }

    #[test]
    fn continuation_ends_on_same_code_without_dash() {
        let reply = parse_all(&["150-Opening", "150-connection", "150 done"]).unwrap();
        assert_eq!(reply.code, 150);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.message(), "Opening connection done");
    }

    #[test]
    fn other_codes_inside_continuation_are_collected() {
        let reply = parse_all(&["211-Features", " SIZE", "200 nope", "211 End"]).unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.lines, vec!["211-Features", " SIZE", "200 nope", "211 End"]);
    }

    #[test]
    fn short_and_garbage_lines_are_skipped() {
        let reply = parse_all(&["", "ok", "hello world", "220 ready"]).unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["220 ready"]);
    }

    #[test]
    fn preliminary_is_success() {
        let reply = parse_all(&["150 go"]).unwrap();
        assert!(reply.is_preliminary());
        assert_eq!(classify(&reply, &ctx("RETR x")).unwrap(), ReplyClass::Success);
    }

    #[test]
    fn not_logged_in_depends_on_state() {
        let reply = parse_all(&["530 Not logged in"]).unwrap();
        assert_eq!(classify(&reply, &ctx("CWD /")).unwrap(), ReplyClass::Error);

        let anonymous = ClassifyContext {
            logged_in: false,
            ..ctx("CWD /")
        };
        assert!(matches!(classify(&reply, &anonymous), Err(FtpError::Login(_))));
    }

    #[test]
    fn file_not_found_after_retr_is_io() {
        let reply = parse_all(&["550 File not found"]).unwrap();
        match classify(&reply, &ctx("RETR x")) {
            Err(FtpError::Io(e)) => assert_eq!(e.to_string(), "File not found"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            classify(&reply, &ctx("PASS secret")),
            Err(FtpError::Login(m)) if m == "Wrong password"
        ));
    }

    #[test]
    fn retry_codes_take_precedence() {
        let reply = parse_all(&["421 busy"]).unwrap();
        let retry = ClassifyContext {
            retry_codes: &[421],
            ..ctx("STOR x")
        };
        assert_eq!(classify(&reply, &retry).unwrap(), ReplyClass::TryAgain);
        assert_eq!(classify(&reply, &ctx("STOR x")).unwrap(), ReplyClass::Error);
    }

    #[tokio::test]
    async fn lone_carriage_return_is_kept() {
        let data: &[u8] = b"220 a\rb\r\n221 x\n";
        let mut reader = tokio::io::BufReader::new(data);
        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), "220 a\rb");
        assert_eq!(read_line(&mut reader).await.unwrap().unwrap(), "221 x");
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }
}
