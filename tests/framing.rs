use std::time::Duration;

use dissftp::error::FramingError;
use dissftp::transfer::{DataSocket, FramedReader, FramedWriter, PACKET_MODE, PACKET_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn send_framed(size: i64, data: Vec<u8>) -> Vec<u8> {
    let (client, server) = duplex(8 * 1024);
    let writer = tokio::spawn(async move {
        let mut client = client;
        let mut writer = FramedWriter::open(&mut client, size, None).await.unwrap();
        writer.write_all(&data).await.unwrap();
        writer.close().await.unwrap();
    });

    let mut server = server;
    let mut reader = FramedReader::open(&mut server, None).await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert!(reader.is_eof());
    reader.close().await.unwrap();
    writer.await.unwrap();
    out
}

#[tokio::test]
async fn raw_mode_delivers_exactly_the_announced_bytes() {
    let data = payload(100_000);
    let out = send_framed(data.len() as i64, data.clone()).await;
    assert_eq!(out, data);
}

#[tokio::test]
async fn packet_mode_spans_several_frames() {
    let data = payload(PACKET_SIZE * 2 + 17);
    let out = send_framed(PACKET_MODE, data.clone()).await;
    assert_eq!(out, data);
}

#[tokio::test]
async fn empty_transfers_end_immediately() {
    assert!(send_framed(0, Vec::new()).await.is_empty());
    assert!(send_framed(PACKET_MODE, Vec::new()).await.is_empty());
}

#[tokio::test]
async fn packet_reader_returns_zero_after_terminator() {
    let (mut client, mut server) = duplex(1024);
    let mut writer = FramedWriter::open(&mut client, PACKET_MODE, None).await.unwrap();
    writer.write_all(b"hello").await.unwrap();
    writer.close().await.unwrap();

    let mut reader = FramedReader::open(&mut server, None).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn flush_emits_a_partial_frame() {
    let (mut client, mut server) = duplex(1024);
    let mut writer = FramedWriter::open(&mut client, PACKET_MODE, None).await.unwrap();
    writer.write_all(b"abc").await.unwrap();
    writer.flush().await.unwrap();

    assert_eq!(server.read_i64().await.unwrap(), -1);
    assert_eq!(server.read_i32().await.unwrap(), 3);
    let mut frame = [0u8; 3];
    server.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame, b"abc");
}

#[tokio::test]
async fn raw_writer_refuses_bytes_past_the_announced_size() {
    let (mut client, _server) = duplex(1024);
    let mut writer = FramedWriter::open(&mut client, 4, None).await.unwrap();
    let result = writer.write_all(b"too long").await;
    assert!(matches!(result, Err(FramingError::EndOfStream)));
    assert_eq!(writer.remaining(), Some(0));
}

#[tokio::test]
async fn raw_reader_reports_missing_bytes() {
    let (mut client, mut server) = duplex(1024);
    client.write_i64(10).await.unwrap();
    client.write_all(b"1234").await.unwrap();
    drop(client);

    let mut reader = FramedReader::open(&mut server, None).await.unwrap();
    let mut out = Vec::new();
    let read = reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(read, 4);
    assert_eq!(reader.remaining(), Some(6));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (mut client, _server) = duplex(1024);
    let mut writer = FramedWriter::open(&mut client, PACKET_MODE, None).await.unwrap();
    writer.close().await.unwrap();
    writer.close().await.unwrap();
    assert!(writer.is_closed());
    assert!(matches!(writer.write(b"x").await, Err(FramingError::Closed(_))));
}

#[tokio::test]
async fn packet_reader_close_drains_unread_frames() {
    let (client, server) = duplex(PACKET_SIZE * 4);
    let mut client_socket = DataSocket::new(client, true);
    let mut server_socket = DataSocket::new(server, true);

    {
        let mut writer = client_socket.writer(PACKET_MODE).await.unwrap();
        writer.write_all(&payload(PACKET_SIZE + 10)).await.unwrap();
        writer.close().await.unwrap();
        let mut writer = client_socket.writer(3).await.unwrap();
        writer.write_all(b"end").await.unwrap();
        writer.close().await.unwrap();
    }

    {
        let mut reader = server_socket.reader().await.unwrap();
        let mut buf = [0u8; 10];
        reader.read(&mut buf).await.unwrap();
        reader.close().await.unwrap();
    }
    let mut reader = server_socket.reader().await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"end");
}

#[tokio::test]
async fn data_socket_close_is_idempotent() {
    let (client, _server) = duplex(64);
    let mut socket = DataSocket::new(client, false);
    socket.close().await;
    socket.close().await;
    assert!(!socket.is_open());
    assert!(matches!(socket.reader().await, Err(FramingError::Closed(_))));
}

#[tokio::test]
async fn reads_time_out() {
    let (_client, mut server) = duplex(64);
    let result = FramedReader::open(&mut server, Some(Duration::from_millis(20))).await;
    assert!(matches!(result, Err(FramingError::TimedOut)));
}

#[tokio::test]
async fn exactly_one_full_packet_then_the_terminator() {
    let (client, mut server) = duplex(PACKET_SIZE * 2);
    let data = payload(PACKET_SIZE);
    {
        let mut client = client;
        let mut writer = FramedWriter::open(&mut client, PACKET_MODE, None).await.unwrap();
        writer.write_all(&data).await.unwrap();
        writer.close().await.unwrap();
    }

    assert_eq!(server.read_i64().await.unwrap(), PACKET_MODE);
    assert_eq!(server.read_i32().await.unwrap(), PACKET_SIZE as i32);
    let mut frame = vec![0u8; PACKET_SIZE];
    server.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, data);
    assert_eq!(server.read_i32().await.unwrap(), 0);

    // No empty frame ahead of the terminator, nothing after it
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn unreadable_frame_header_closes_a_data_alive_socket() {
    let (client, server) = duplex(64);
    drop(client);
    let mut socket = DataSocket::new(server, true);

    assert!(socket.reader().await.is_err());
    assert!(!socket.is_open());
    assert!(matches!(socket.reader().await, Err(FramingError::Closed(_))));
}
