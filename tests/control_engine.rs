use std::time::Duration;

use dissftp::client::control::ControlConnection;
use dissftp::client::reply::ReplyClass;
use dissftp::error::FtpError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::task::JoinHandle;

/// Plays a fixed conversation: for every expected command the listed
/// reply is written back. Returns the commands actually received.
fn scripted_server(
    stream: DuplexStream,
    greeting: &'static str,
    script: Vec<(&'static str, &'static str)>,
) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        write_half.write_all(greeting.as_bytes()).await.unwrap();

        let mut received = Vec::new();
        for (expected, reply) in script {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            assert_eq!(line, expected);
            received.push(line);
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
        received
    })
}

async fn connect(
    greeting: &'static str,
    script: Vec<(&'static str, &'static str)>,
    retry_codes: Vec<u16>,
) -> (ControlConnection, JoinHandle<Vec<String>>) {
    let (client, server) = duplex(4096);
    let handle = scripted_server(server, greeting, script);
    let control = ControlConnection::open(client, Duration::from_secs(5), retry_codes, 2)
        .await
        .unwrap();
    (control, handle)
}

#[tokio::test]
async fn multi_line_preliminary_reply_leaves_a_pending_reply() {
    let (mut control, server) = connect(
        "220 ready\r\n",
        vec![
            ("RETR a", "150-Opening\r\n150-connection\r\n150 done\r\n226 Transfer complete\r\n"),
            ("NOOP", "200 ok\r\n"),
        ],
        Vec::new(),
    )
    .await;

    assert_eq!(control.issue_command("RETR a").await.unwrap(), ReplyClass::Success);
    assert!(control.is_pending());
    assert_eq!(control.last_reply().unwrap().lines.len(), 3);

    // The 226 is drained before NOOP goes out
    assert_eq!(control.issue_command("NOOP").await.unwrap(), ReplyClass::Success);
    assert_eq!(control.last_code(), Some(200));
    assert!(!control.is_pending());
    assert_eq!(server.await.unwrap(), vec!["RETR a", "NOOP"]);
}

#[tokio::test]
async fn check_pending_reply_reads_the_final_reply() {
    let (mut control, _server) = connect(
        "220 ready\r\n",
        vec![("STOR x", "150 go\r\n226 done\r\n")],
        Vec::new(),
    )
    .await;

    control.issue_command_check("STOR x", true).await.unwrap();
    assert_eq!(control.check_pending_reply().await.unwrap(), Some(226));
    assert_eq!(control.check_pending_reply().await.unwrap(), None);
}

#[tokio::test]
async fn wrong_password_is_a_login_error() {
    let (mut control, _server) = connect(
        "220 ready\r\n",
        vec![("USER bob", "331 need password\r\n"), ("PASS nope", "550 denied\r\n")],
        Vec::new(),
    )
    .await;

    control.issue_command_check("USER bob", true).await.unwrap();
    match control.issue_command("PASS nope").await {
        Err(FtpError::Login(message)) => assert_eq!(message, "Wrong password"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn missing_file_is_an_io_error() {
    let (mut control, _server) = connect(
        "220 ready\r\n",
        vec![("RETR gone", "550 gone: No such file or directory\r\n")],
        Vec::new(),
    )
    .await;
    control.set_logged_in(true);

    match control.issue_command("RETR gone").await {
        Err(FtpError::Io(e)) => assert_eq!(e.to_string(), "gone: No such file or directory"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn retry_codes_resend_the_command() {
    let (mut control, server) = connect(
        "220 ready\r\n",
        vec![("MKD d", "450 busy\r\n"), ("MKD d", "450 busy\r\n"), ("MKD d", "257 created\r\n")],
        vec![450],
    )
    .await;
    control.set_logged_in(true);

    assert_eq!(control.issue_command("MKD d").await.unwrap(), ReplyClass::Success);
    assert_eq!(server.await.unwrap().len(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let (mut control, _server) = connect(
        "220 ready\r\n",
        vec![("MKD d", "450 busy\r\n"), ("MKD d", "450 busy\r\n"), ("MKD d", "450 busy\r\n")],
        vec![450],
    )
    .await;
    control.set_logged_in(true);

    assert_eq!(control.issue_command("MKD d").await.unwrap(), ReplyClass::Error);
    let err = control.issue_command_check("MKD e", false).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn refused_greeting_fails_to_open() {
    let (client, server) = duplex(1024);
    let _server = scripted_server(server, "421 Too many users\r\n", Vec::new());
    let result = ControlConnection::open(client, Duration::from_secs(5), Vec::new(), 0).await;
    match result {
        Err(FtpError::Protocol(message)) => assert!(message.contains("Too many users")),
        Err(other) => panic!("unexpected {other:?}"),
        Ok(_) => panic!("greeting should have been refused"),
    }
}

#[tokio::test]
async fn commands_fail_once_the_connection_is_gone() {
    let (mut control, server) = connect("220 ready\r\n", Vec::new(), Vec::new()).await;
    server.await.unwrap();

    assert!(control.issue_command("NOOP").await.is_err());
    assert!(!control.is_open());
    match control.issue_command("NOOP").await {
        Err(FtpError::Login(message)) => assert!(message.starts_with("Not connected to host")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn response_string_prefers_the_failure_line() {
    let (mut control, _server) = connect(
        "220 ready\r\n",
        vec![("OPTS PTCP 4", "504 Parallel streams not available\r\n")],
        Vec::new(),
    )
    .await;
    control.set_logged_in(true);

    let result = control.diss_command_check("OPTS PTCP 4").await;
    assert!(matches!(result, Err(FtpError::Protocol(m)) if m.starts_with("Not a DissFTP server?")));
    assert_eq!(control.response_string(), "504 Parallel streams not available");
}
