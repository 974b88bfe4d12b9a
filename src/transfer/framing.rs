//! Module `framing`
//!
//! Length-aware wrappers around a data socket.
//!
//! When the data channel is negotiated as persistent ("data-alive"), every
//! transfer starts with a big-endian `i64` control value written by the
//! sender. A value `>= 0` announces a raw transfer of exactly that many
//! bytes. A negative value announces a packet stream made of
//! `(i32 length, payload)` frames, terminated by a frame whose length is
//! `<= 0`. Without data-alive, bytes pass through unframed and the end of
//! the transfer is the peer closing the socket.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// Frames are flushed once this many bytes are buffered.
pub const PACKET_SIZE: usize = 64 * 1024;

/// Control value announcing packet framing.
pub const PACKET_MODE: i64 = -1;

async fn timed<T>(
    limit: Option<Duration>,
    operation: impl Future<Output = io::Result<T>>,
) -> Result<T, FramingError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, operation).await {
            Ok(result) => result.map_err(FramingError::from),
            Err(_) => Err(FramingError::TimedOut),
        },
        None => operation.await.map_err(FramingError::from),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    inner: &mut W,
    frame: &[u8],
    limit: Option<Duration>,
) -> Result<(), FramingError> {
    timed(limit, inner.write_i32(frame.len() as i32)).await?;
    timed(limit, inner.write_all(frame)).await
}

enum ReadMode {
    Unframed { eof: bool },
    Raw { remaining: u64 },
    Packet { buffer: BytesMut, eof: bool },
}

/// Read side of a data channel.
pub struct FramedReader<R> {
    inner: R,
    mode: ReadMode,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    fn with_mode(inner: R, mode: ReadMode) -> Self {
        Self {
            inner,
            mode,
            timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Pass-through reader, ends when the peer closes the socket.
    pub fn unframed(inner: R) -> Self {
        Self::with_mode(inner, ReadMode::Unframed { eof: false })
    }

    /// Reader for exactly `size` bytes.
    pub fn raw(inner: R, size: u64) -> Self {
        Self::with_mode(inner, ReadMode::Raw { remaining: size })
    }

    /// Reader for a packet stream.
    pub fn packet(inner: R) -> Self {
        Self::with_mode(
            inner,
            ReadMode::Packet {
                buffer: BytesMut::new(),
                eof: false,
            },
        )
    }

    /// Reads the control value sent by the peer and returns a reader in
    /// the mode it announces.
    pub async fn open(mut inner: R, timeout: Option<Duration>) -> Result<Self, FramingError> {
        let size = timed(timeout, inner.read_i64()).await?;
        let reader = if size >= 0 {
            debug!("Opening raw data channel for {} bytes", size);
            Self::raw(inner, size as u64)
        } else {
            debug!("Opening packet data channel");
            Self::packet(inner)
        };
        Ok(reader.with_timeout(timeout))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_packet(&self) -> bool {
        matches!(self.mode, ReadMode::Packet { .. })
    }

    /// Bytes still owed by the peer in raw mode.
    pub fn remaining(&self) -> Option<u64> {
        match self.mode {
            ReadMode::Raw { remaining } => Some(remaining),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        match &self.mode {
            ReadMode::Unframed { eof } => *eof,
            ReadMode::Raw { remaining } => *remaining == 0,
            ReadMode::Packet { buffer, eof } => *eof && buffer.is_empty(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reads into `buf`, returning `0` once the stream is exhausted.
    ///
    /// In packet mode a new frame is only pulled from the wire while the
    /// request is larger than what is already buffered.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FramingError> {
        if self.is_closed() {
            return Err(FramingError::Closed("FramedReader"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        match &mut self.mode {
            ReadMode::Unframed { eof } => {
                if *eof {
                    return Ok(0);
                }
                let n = timed(self.timeout, self.inner.read(buf)).await?;
                if n == 0 {
                    *eof = true;
                }
                Ok(n)
            }
            ReadMode::Raw { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let len = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = timed(self.timeout, self.inner.read(&mut buf[..len])).await?;
                *remaining -= n as u64;
                Ok(n)
            }
            ReadMode::Packet { buffer, eof } => {
                while !*eof && buffer.len() < buf.len() {
                    let size = timed(self.timeout, self.inner.read_i32()).await?;
                    if size <= 0 {
                        *eof = true;
                        break;
                    }
                    let start = buffer.len();
                    buffer.resize(start + size as usize, 0);
                    timed(self.timeout, self.inner.read_exact(&mut buffer[start..])).await?;
                }
                let n = buf.len().min(buffer.len());
                buffer.copy_to_slice(&mut buf[..n]);
                Ok(n)
            }
        }
    }

    /// Reads everything left in the stream into `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<u64, FramingError> {
        let mut chunk = vec![0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n as u64;
        }
    }

    /// Closes the reader. A raw reader closed early only warns; a packet
    /// reader closed before its terminator drains the remaining frames so
    /// the socket stays aligned for the next transfer.
    pub async fn close(&mut self) -> Result<(), FramingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("FramedReader already closed");
            return Ok(());
        }

        match &mut self.mode {
            ReadMode::Unframed { .. } => {}
            ReadMode::Raw { remaining } => {
                if *remaining > 0 {
                    warn!(
                        "Raw data channel closed with {} bytes not received",
                        remaining
                    );
                }
            }
            ReadMode::Packet { buffer, eof } => {
                if !*eof {
                    let mut discarded = buffer.len() as u64;
                    buffer.clear();
                    loop {
                        let size = timed(self.timeout, self.inner.read_i32()).await?;
                        if size <= 0 {
                            break;
                        }
                        let mut frame = (&mut self.inner).take(size as u64);
                        let skipped =
                            timed(self.timeout, tokio::io::copy(&mut frame, &mut tokio::io::sink()))
                                .await?;
                        if skipped < size as u64 {
                            return Err(FramingError::Io(io::Error::from(
                                io::ErrorKind::UnexpectedEof,
                            )));
                        }
                        discarded += skipped;
                    }
                    *eof = true;
                    warn!(
                        "Packet data channel closed before its final frame ({} bytes discarded)",
                        discarded
                    );
                }
            }
        }
        Ok(())
    }
}

enum WriteMode {
    Unframed,
    Raw { remaining: u64 },
    Packet { buffer: BytesMut },
}

/// Write side of a data channel.
pub struct FramedWriter<W> {
    inner: W,
    mode: WriteMode,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    fn with_mode(inner: W, mode: WriteMode) -> Self {
        Self {
            inner,
            mode,
            timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Pass-through writer, the transfer ends when the socket is shut down.
    pub fn unframed(inner: W) -> Self {
        Self::with_mode(inner, WriteMode::Unframed)
    }

    /// Announces `size` to the peer, then returns a raw writer for
    /// `size >= 0` or a packet writer for a negative size.
    pub async fn open(mut inner: W, size: i64, timeout: Option<Duration>) -> Result<Self, FramingError> {
        timed(timeout, inner.write_i64(size)).await?;
        let mode = if size >= 0 {
            debug!("Opening raw data channel for {} bytes", size);
            WriteMode::Raw {
                remaining: size as u64,
            }
        } else {
            debug!("Opening packet data channel");
            WriteMode::Packet {
                buffer: BytesMut::with_capacity(PACKET_SIZE),
            }
        };
        Ok(Self::with_mode(inner, mode).with_timeout(timeout))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_packet(&self) -> bool {
        matches!(self.mode, WriteMode::Packet { .. })
    }

    /// Bytes still to be sent in raw mode.
    pub fn remaining(&self) -> Option<u64> {
        match self.mode {
            WriteMode::Raw { remaining } => Some(remaining),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes up to `buf.len()` bytes and returns how many were accepted.
    ///
    /// A raw writer accepts at most the announced size; writing past it is
    /// an error. A packet writer buffers and emits full frames only.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, FramingError> {
        if self.is_closed() {
            return Err(FramingError::Closed("FramedWriter"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        match &mut self.mode {
            WriteMode::Unframed => {
                timed(self.timeout, self.inner.write_all(buf)).await?;
                Ok(buf.len())
            }
            WriteMode::Raw { remaining } => {
                if *remaining == 0 {
                    return Err(FramingError::EndOfStream);
                }
                let len = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                timed(self.timeout, self.inner.write_all(&buf[..len])).await?;
                *remaining -= len as u64;
                Ok(len)
            }
            WriteMode::Packet { buffer } => {
                buffer.extend_from_slice(buf);
                while buffer.len() >= PACKET_SIZE {
                    let frame = buffer.split_to(PACKET_SIZE);
                    write_frame(&mut self.inner, &frame, self.timeout).await?;
                }
                Ok(buf.len())
            }
        }
    }

    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), FramingError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Sends whatever is buffered, even below the frame threshold.
    pub async fn flush(&mut self) -> Result<(), FramingError> {
        if self.is_closed() {
            return Err(FramingError::Closed("FramedWriter"));
        }
        if let WriteMode::Packet { buffer } = &mut self.mode {
            if !buffer.is_empty() {
                let frame = buffer.split();
                write_frame(&mut self.inner, &frame, self.timeout).await?;
            }
        }
        timed(self.timeout, self.inner.flush()).await
    }

    /// Finishes the transfer: the last partial frame and the terminator in
    /// packet mode, a flush in raw mode, a write shutdown when unframed.
    pub async fn close(&mut self) -> Result<(), FramingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("FramedWriter already closed");
            return Ok(());
        }

        match &mut self.mode {
            WriteMode::Unframed => {
                timed(self.timeout, self.inner.flush()).await?;
                timed(self.timeout, self.inner.shutdown()).await
            }
            WriteMode::Raw { remaining } => {
                if *remaining > 0 {
                    warn!("Raw data channel closed with {} bytes not sent", remaining);
                }
                timed(self.timeout, self.inner.flush()).await
            }
            WriteMode::Packet { buffer } => {
                if !buffer.is_empty() {
                    let frame = buffer.split();
                    write_frame(&mut self.inner, &frame, self.timeout).await?;
                }
                timed(self.timeout, self.inner.write_i32(0)).await?;
                timed(self.timeout, self.inner.flush()).await
            }
        }
    }
}

/// Anything a data channel can run over: a TCP stream, an in-memory pipe,
/// or a multi-stream transport presented as one socket.
pub trait DataStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DataStream for T {}

pub type ChannelReader<'a> = FramedReader<&'a mut Box<dyn DataStream>>;
pub type ChannelWriter<'a> = FramedWriter<&'a mut Box<dyn DataStream>>;

/// A connected data socket, owned for as long as the channel lives.
///
/// With data-alive the socket outlives a single transfer and every
/// transfer is framed; otherwise it carries one unframed transfer.
pub struct DataSocket {
    stream: Box<dyn DataStream>,
    data_alive: bool,
    timeout: Option<Duration>,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl DataSocket {
    pub fn new<S: DataStream + 'static>(stream: S, data_alive: bool) -> Self {
        Self {
            stream: Box::new(stream),
            data_alive,
            timeout: None,
            peer: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_data_alive(&self) -> bool {
        self.data_alive
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Reader for the next incoming transfer. A framed socket whose header
    /// cannot be read is marked closed.
    pub async fn reader(&mut self) -> Result<ChannelReader<'_>, FramingError> {
        if !self.is_open() {
            return Err(FramingError::Closed("DataSocket"));
        }
        if self.data_alive {
            let opened = FramedReader::open(&mut self.stream, self.timeout).await;
            if opened.is_err() {
                // The frame boundary is lost
                self.closed.store(true, Ordering::Release);
            }
            opened
        } else {
            Ok(FramedReader::unframed(&mut self.stream).with_timeout(self.timeout))
        }
    }

    /// Writer for the next outgoing transfer; `size` is only announced
    /// when the socket is framed (`-1` for packet mode).
    pub async fn writer(&mut self, size: i64) -> Result<ChannelWriter<'_>, FramingError> {
        if !self.is_open() {
            return Err(FramingError::Closed("DataSocket"));
        }
        if self.data_alive {
            let opened = FramedWriter::open(&mut self.stream, size, self.timeout).await;
            if opened.is_err() {
                self.closed.store(true, Ordering::Release);
            }
            opened
        } else {
            Ok(FramedWriter::unframed(&mut self.stream).with_timeout(self.timeout))
        }
    }

    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("DataSocket already closed");
            return;
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Data socket shutdown: {}", e);
        }
    }
}
