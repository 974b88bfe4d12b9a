//! Module `file_ops`
//!
//! Moves file contents and listings over a data socket. Byte counts are
//! checked against what was announced: a short transfer is a failure even
//! when no I/O error was raised.

use log::{info, warn};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{StorageError, TransferError};
use crate::storage::{FileReader, FileWriter};
use crate::transfer::framing::{DataSocket, PACKET_MODE};
use crate::transfer::modes::TransferType;

/// Knobs for a single transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub buffer_size: usize,
    /// Compute an MD5 digest of the file bytes.
    pub checksum: bool,
    /// Upload limit in bytes.
    pub max_size: Option<u64>,
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// File bytes read (download) or written (upload).
    pub bytes: u64,
    pub digest: Option<String>,
}

/// Converts local line endings to the network form: CR dropped, LF sent
/// as CRLF.
pub fn to_network_ascii(input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        match b {
            b'\r' => {}
            b'\n' => out.extend_from_slice(b"\r\n"),
            other => out.push(other),
        }
    }
}

/// Converts received ASCII data back to local form by dropping CR.
pub fn from_network_ascii(input: &[u8], out: &mut Vec<u8>) {
    out.extend(input.iter().copied().filter(|&b| b != b'\r'));
}

/// Sends `source` to the peer. `expected` is the number of file bytes
/// left after the resume offset; a framed binary transfer announces it as
/// a raw size, everything else is sent as packets.
pub async fn send_file(
    socket: &mut DataSocket,
    mut source: FileReader,
    transfer_type: TransferType,
    expected: u64,
    options: &TransferOptions,
) -> Result<TransferReport, TransferError> {
    let announced = match transfer_type {
        TransferType::Binary => i64::try_from(expected).unwrap_or(PACKET_MODE),
        TransferType::Ascii => PACKET_MODE,
    };
    let mut writer = socket.writer(announced).await?;
    let mut buffer = vec![0u8; options.buffer_size];
    let mut converted = Vec::with_capacity(options.buffer_size * 2);
    let mut digest = options.checksum.then(Md5::new);
    let mut sent = 0u64;

    loop {
        let n = source.read(&mut buffer).await.map_err(StorageError::from)?;
        if n == 0 {
            break;
        }
        if let Some(digest) = digest.as_mut() {
            digest.update(&buffer[..n]);
        }
        match transfer_type {
            TransferType::Binary => writer.write_all(&buffer[..n]).await?,
            TransferType::Ascii => {
                converted.clear();
                to_network_ascii(&buffer[..n], &mut converted);
                writer.write_all(&converted).await?;
            }
        }
        sent += n as u64;
    }
    writer.close().await?;

    if sent != expected {
        warn!("Sent {} bytes but {} were expected", sent, expected);
        return Err(TransferError::SizeMismatch {
            expected,
            actual: sent,
        });
    }

    info!("Sent {} bytes ({} mode)", sent, transfer_type);
    Ok(TransferReport {
        bytes: sent,
        digest: digest.map(|d| hex::encode(d.finalize())),
    })
}

/// Receives a file from the peer into `sink`.
pub async fn receive_file(
    socket: &mut DataSocket,
    mut sink: FileWriter,
    transfer_type: TransferType,
    options: &TransferOptions,
) -> Result<TransferReport, TransferError> {
    let mut reader = socket.reader().await?;
    let mut buffer = vec![0u8; options.buffer_size];
    let mut converted = Vec::with_capacity(options.buffer_size);
    let mut digest = options.checksum.then(Md5::new);
    let mut received = 0u64;
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        received += n as u64;
        if let Some(max) = options.max_size {
            if received > max {
                warn!("Upload exceeds the {} byte limit", max);
                return Err(TransferError::FileTooLarge(max));
            }
        }

        let chunk: &[u8] = match transfer_type {
            TransferType::Binary => &buffer[..n],
            TransferType::Ascii => {
                converted.clear();
                from_network_ascii(&buffer[..n], &mut converted);
                &converted
            }
        };
        if let Some(digest) = digest.as_mut() {
            digest.update(chunk);
        }
        sink.write_all(chunk).await.map_err(StorageError::from)?;
        written += chunk.len() as u64;
    }

    let owed = reader.remaining().unwrap_or(0);
    reader.close().await?;
    sink.flush().await.map_err(StorageError::from)?;
    sink.shutdown().await.map_err(StorageError::from)?;

    if owed > 0 {
        warn!("Peer closed the data channel with {} bytes still announced", owed);
        return Err(TransferError::SizeMismatch {
            expected: received + owed,
            actual: received,
        });
    }

    info!("Received {} bytes ({} mode)", received, transfer_type);
    Ok(TransferReport {
        bytes: written,
        digest: digest.map(|d| hex::encode(d.finalize())),
    })
}

/// Sends listing lines terminated by `line_ending`.
pub async fn send_listing(
    socket: &mut DataSocket,
    lines: &[String],
    line_ending: &str,
) -> Result<u64, TransferError> {
    let mut writer = socket.writer(PACKET_MODE).await?;
    let mut sent = 0u64;
    for line in lines {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(line_ending.as_bytes()).await?;
        sent += (line.len() + line_ending.len()) as u64;
    }
    writer.close().await?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::replies::transfer_reply;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Backing file whose every read and write fails.
    struct BrokenFile;

    impl AsyncRead for BrokenFile {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk failure")))
        }
    }

    impl AsyncWrite for BrokenFile {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("disk full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn options() -> TransferOptions {
        TransferOptions {
            buffer_size: 1024,
            checksum: false,
            max_size: None,
        }
    }

    #[tokio::test]
    async fn disk_write_failure_is_a_local_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"uploaded bytes").await.unwrap();
        drop(client);
        let mut socket = DataSocket::new(server, false);

        let err = receive_file(&mut socket, Box::new(BrokenFile), TransferType::Binary, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Storage(_)));
        assert!(transfer_reply(&err, "f").starts_with("451 "));
    }

    #[tokio::test]
    async fn disk_read_failure_is_a_local_error() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut socket = DataSocket::new(client, false);

        let err = send_file(&mut socket, Box::new(BrokenFile), TransferType::Binary, 10, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Storage(_)));
        assert!(transfer_reply(&err, "f").starts_with("451 "));
    }

    #[test]
    fn ascii_out_normalises_line_endings() {
        let mut out = Vec::new();
        to_network_ascii(b"a\nb\r\nc", &mut out);
        assert_eq!(out, b"a\r\nb\r\nc");
    }

    #[test]
    fn ascii_in_drops_carriage_returns() {
        let mut out = Vec::new();
        from_network_ascii(b"a\r\nb\r\n", &mut out);
        assert_eq!(out, b"a\nb\n");
    }
}
