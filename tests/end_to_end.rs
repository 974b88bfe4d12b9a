use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dissftp::config::{ClientConfig, ServerConfig, UserEntry};
use dissftp::error::FtpError;
use dissftp::keepalive::KeepAliveService;
use dissftp::protocol::address::parse_pasv_reply;
use dissftp::{FtpClient, Server};
use md5::{Digest, Md5};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const USER: &str = "alice";
const PASSWORD: &str = "alice123";

struct TestServer {
    addr: SocketAddr,
    root: TempDir,
    _task: tokio::task::JoinHandle<()>,
}

async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::default();
    config.startup.control_port = 0;
    config.startup.server_root = root.path().to_string_lossy().into_owned();
    config.startup.active_port_binding = false;
    config.startup.users = vec![UserEntry {
        name: USER.into(),
        password: PASSWORD.into(),
        domain: None,
    }];
    configure(&mut config);

    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(server.start());
    TestServer {
        addr,
        root,
        _task: task,
    }
}

async fn client(server: &TestServer, config: ClientConfig) -> FtpClient {
    let mut client = FtpClient::connect("127.0.0.1", server.addr.port(), config)
        .await
        .unwrap();
    client.login(USER, Some(PASSWORD)).await.unwrap();
    client.binary().await.unwrap();
    client
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

async fn retrieve(client: &mut FtpClient, path: &str, offset: u64) -> Vec<u8> {
    let mut out = Vec::new();
    client.retrieve(path, offset, &mut out).await.unwrap();
    out
}

/// Hand-driven control connection for checking replies verbatim.
struct RawControl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawControl {
    async fn connect(server: &TestServer) -> Self {
        let stream = TcpStream::connect(server.addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut control = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        assert!(control.reply().await.starts_with("220"));
        control
    }

    async fn login(server: &TestServer) -> Self {
        let mut control = Self::connect(server).await;
        assert!(control.command(&format!("USER {USER}")).await.starts_with("331"));
        assert!(control.command(&format!("PASS {PASSWORD}")).await.starts_with("230"));
        control
    }

    /// Final line of the next reply, or an empty string once the server
    /// has hung up.
    async fn reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await.unwrap() == 0 {
                return String::new();
            }
            if line.as_bytes().get(3) != Some(&b'-') {
                return line.trim_end().to_string();
            }
        }
    }

    async fn command(&mut self, cmd: &str) -> String {
        self.writer.write_all(format!("{cmd}\r\n").as_bytes()).await.unwrap();
        self.reply().await
    }
}

#[tokio::test]
async fn commands_are_refused_before_login() {
    let server = start_server(|_| {}).await;
    let mut client = FtpClient::connect("127.0.0.1", server.addr.port(), ClientConfig::default())
        .await
        .unwrap();

    assert!(matches!(client.cd("/").await, Err(FtpError::Login(_))));
    assert!(matches!(
        client.login(USER, Some("wrong")).await,
        Err(FtpError::Login(_))
    ));
    client.login(USER, Some(PASSWORD)).await.unwrap();
    assert!(client.is_logged_in());
    client.close(true).await;
    client.close(true).await;
}

#[tokio::test]
async fn directory_commands() {
    let server = start_server(|_| {}).await;
    let mut client = client(&server, ClientConfig::default()).await;

    assert_eq!(client.pwd().await.unwrap(), "/");
    client.mkdir("docs").await.unwrap();
    client.cd("docs").await.unwrap();
    assert_eq!(client.pwd().await.unwrap(), "/docs");
    client.cdup().await.unwrap();
    assert_eq!(client.pwd().await.unwrap(), "/");

    assert!(client.cd("do*").await.is_err());
    assert!(client.syst().await.unwrap().contains("UNIX"));

    client.rmdir("docs").await.unwrap();
    assert!(!server.root.path().join("docs").exists());
    client.close(true).await;
}

#[tokio::test]
async fn passive_store_and_retrieve_with_restart() {
    let server = start_server(|_| {}).await;
    let mut client = client(&server, ClientConfig::default()).await;
    let data = payload(200_000);

    let stored = client
        .store("a.bin", &mut data.as_slice(), Some(data.len() as u64), false)
        .await
        .unwrap();
    assert_eq!(stored, data.len() as u64);
    assert_eq!(client.size("a.bin").await.unwrap(), data.len() as u64);

    assert_eq!(retrieve(&mut client, "a.bin", 0).await, data);
    assert_eq!(retrieve(&mut client, "a.bin", 100).await, data[100..]);
    // The restart offset only applies to one transfer
    assert_eq!(retrieve(&mut client, "a.bin", 0).await, data);

    client.close(true).await;
}

#[tokio::test]
async fn rename_delete_and_timestamps() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("old.txt"), b"hello").unwrap();
    let mut client = client(&server, ClientConfig::default()).await;

    client.rename("old.txt", "new.txt").await.unwrap();
    assert_eq!(client.size("new.txt").await.unwrap(), 5);
    let stamp = client.mdtm("new.txt").await.unwrap();
    assert_eq!(stamp.len(), 14);
    assert!(stamp.bytes().all(|b| b.is_ascii_digit()));

    client.delete("new.txt").await.unwrap();
    assert!(matches!(client.size("new.txt").await, Err(FtpError::Io(_))));
    client.close(true).await;
}

#[tokio::test]
async fn listings() {
    let server = start_server(|_| {}).await;
    std::fs::write(server.root.path().join("one.txt"), b"1").unwrap();
    std::fs::write(server.root.path().join("two.txt"), b"22").unwrap();
    let mut client = client(&server, ClientConfig::default()).await;

    let mut names = client.nlist(None).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["one.txt", "two.txt"]);

    let long = client.list(Some("-l")).await.unwrap();
    assert_eq!(long.len(), 2);
    assert!(long.iter().any(|line| line.ends_with("two.txt")));
    client.close(true).await;
}

#[tokio::test]
async fn data_alive_reuses_one_framed_socket() {
    let server = start_server(|_| {}).await;
    let config = ClientConfig {
        data_alive: true,
        ..ClientConfig::default()
    };
    let mut client = client(&server, config).await;
    let first = payload(70_000);
    let second = payload(10);

    client
        .store("first", &mut first.as_slice(), Some(first.len() as u64), false)
        .await
        .unwrap();
    client.store("second", &mut second.as_slice(), None, false).await.unwrap();
    assert_eq!(retrieve(&mut client, "first", 0).await, first);
    assert_eq!(retrieve(&mut client, "second", 4).await, second[4..]);

    let mut names = client.nlist(None).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["first", "second"]);
    assert_eq!(retrieve(&mut client, "second", 0).await, second);

    assert_eq!(std::fs::read(server.root.path().join("first")).unwrap(), first);
    client.close(true).await;
}

#[tokio::test]
async fn active_mode_when_passive_is_disabled() {
    let server = start_server(|_| {}).await;
    let config = ClientConfig {
        passive: false,
        ..ClientConfig::default()
    };
    let mut client = client(&server, config).await;
    let data = payload(5_000);

    client.store("active.bin", &mut data.as_slice(), None, false).await.unwrap();
    assert_eq!(retrieve(&mut client, "active.bin", 0).await, data);
    client.close(true).await;
}

#[tokio::test]
async fn extended_active_mode() {
    let server = start_server(|_| {}).await;
    let config = ClientConfig {
        passive: false,
        extended: true,
        ..ClientConfig::default()
    };
    let mut client = client(&server, config).await;

    client.store("eprt.bin", &mut &b"eprt"[..], None, false).await.unwrap();
    assert_eq!(retrieve(&mut client, "eprt.bin", 0).await, b"eprt");
    client.close(true).await;
}

#[tokio::test]
async fn refused_stream_request_falls_back_to_active_mode() {
    let server = start_server(|_| {}).await;
    let config = ClientConfig {
        streams: 4,
        ..ClientConfig::default()
    };
    let mut client = client(&server, config).await;

    client.store("ptcp.bin", &mut &b"parallel"[..], None, false).await.unwrap();
    assert_eq!(retrieve(&mut client, "ptcp.bin", 0).await, b"parallel");
    client.close(true).await;
}

#[tokio::test]
async fn extensions() {
    let server = start_server(|_| {}).await;
    let mut client = client(&server, ClientConfig::default()).await;
    let data = payload(1_234);

    client.delegate_checksum().await.unwrap();
    client.store("sum.bin", &mut data.as_slice(), None, false).await.unwrap();
    let digest = client.dump_checksum(None, "sum.bin").await.unwrap();
    assert_eq!(digest, hex::encode(Md5::digest(&data)));

    let claimed = "00112233445566778899aabbccddeeff";
    assert_eq!(client.dump_checksum(Some(claimed), "sum.bin").await.unwrap(), claimed);

    client.empty("sum.bin").await.unwrap();
    assert_eq!(client.size("sum.bin").await.unwrap(), 0);

    client.set_output_filters("none").await.unwrap();
    assert!(client.set_input_filters("gzip").await.is_err());
    client.close(true).await;
}

#[tokio::test]
async fn mkdirs_creates_parent_directories() {
    let server = start_server(|_| {}).await;
    let config = ClientConfig {
        mkdirs: true,
        ..ClientConfig::default()
    };
    let mut client = client(&server, config).await;

    client.store("a/b/c.txt", &mut &b"deep"[..], None, false).await.unwrap();
    assert_eq!(std::fs::read(server.root.path().join("a/b/c.txt")).unwrap(), b"deep");
    client.close(true).await;
}

#[tokio::test]
async fn connection_limit_is_enforced() {
    let server = start_server(|config| config.runtime.max_clients = 1).await;
    let mut first = client(&server, ClientConfig::default()).await;

    let second = FtpClient::connect("127.0.0.1", server.addr.port(), ClientConfig::default()).await;
    assert!(second.is_err());
    assert!(first.is_alive().await);
    first.close(true).await;
}

#[tokio::test]
async fn keep_alive_bytes_are_ignored_by_the_server() {
    let server = start_server(|_| {}).await;
    let mut client = client(&server, ClientConfig::default()).await;
    let service = Arc::new(KeepAliveService::new(Duration::from_secs(3600)));

    client.keep_control_connection_alive(&service, true);
    assert_eq!(service.len(), 1);
    service.probe_now().await;
    service.probe_now().await;
    assert!(client.is_alive().await);
    assert_eq!(client.pwd().await.unwrap(), "/");

    client.keep_control_connection_alive(&service, false);
    assert!(service.is_empty());
    client.close(true).await;
}

#[tokio::test]
async fn keep_alive_bytes_hold_an_idle_session_open() {
    let server = start_server(|config| config.startup.control_timeout_ms = 400).await;
    let mut client = client(&server, ClientConfig::default()).await;
    let service = KeepAliveService::new(Duration::from_millis(100));
    service.start();
    client.keep_control_connection_alive(&service, true);

    // Well past the server's idle timeout, with only NULs on the wire
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(client.is_alive().await);
    assert_eq!(client.pwd().await.unwrap(), "/");

    client.keep_control_connection_alive(&service, false);
    service.stop().await;
    client.close(true).await;
}

#[tokio::test]
async fn failed_data_alive_transfer_renegotiates_the_data_socket() {
    let server = start_server(|config| config.runtime.max_file_size_mb = 1).await;
    let config = ClientConfig {
        data_alive: true,
        ..ClientConfig::default()
    };
    let mut client = client(&server, config).await;
    let oversized = payload(8 * 1024 * 1024);

    let result = client
        .store("big.bin", &mut oversized.as_slice(), Some(oversized.len() as u64), false)
        .await;
    assert!(result.is_err());

    let small = payload(1_000);
    client.store("small.bin", &mut small.as_slice(), None, false).await.unwrap();
    assert_eq!(retrieve(&mut client, "small.bin", 0).await, small);
    assert!(client.is_alive().await);
    client.close(true).await;
}

#[tokio::test]
async fn third_failed_password_ends_the_session() {
    let server = start_server(|_| {}).await;
    let mut control = RawControl::connect(&server).await;

    for _ in 0..3 {
        assert!(control.command(&format!("USER {USER}")).await.starts_with("331"));
        assert!(control.command("PASS wrong").await.starts_with("530"));
    }
    assert!(control.reply().await.starts_with("221"));
    assert_eq!(control.reply().await, "");
}

#[tokio::test]
async fn two_failed_passwords_still_allow_a_login() {
    let server = start_server(|_| {}).await;
    let mut control = RawControl::connect(&server).await;

    for _ in 0..2 {
        assert!(control.command(&format!("USER {USER}")).await.starts_with("331"));
        assert!(control.command("PASS wrong").await.starts_with("530"));
    }
    assert!(control.command(&format!("USER {USER}")).await.starts_with("331"));
    assert!(control.command(&format!("PASS {PASSWORD}")).await.starts_with("230"));
}

#[tokio::test]
async fn restart_offset_is_consumed_by_an_upload() {
    let server = start_server(|_| {}).await;
    let mut client = client(&server, ClientConfig::default()).await;
    let original = payload(10);
    client.store("r.bin", &mut original.as_slice(), None, false).await.unwrap();

    {
        let mut writer = client.put("r.bin", 4, 6, false).await.unwrap();
        writer.write_all(b"ABCDEF").await.unwrap();
        writer.close().await.unwrap();
    }
    client.complete_transfer().await.unwrap();
    let mut expected = original[..4].to_vec();
    expected.extend_from_slice(b"ABCDEF");
    assert_eq!(std::fs::read(server.root.path().join("r.bin")).unwrap(), expected);

    // A second upload starts from the beginning again
    client.store("fresh.bin", &mut &b"fresh"[..], None, false).await.unwrap();
    assert_eq!(std::fs::read(server.root.path().join("fresh.bin")).unwrap(), b"fresh");
    client.close(true).await;
}

#[tokio::test]
async fn short_framed_upload_is_aborted_with_426() {
    let server = start_server(|_| {}).await;
    let mut control = RawControl::login(&server).await;
    assert!(control.command("TYPE I").await.starts_with("200"));
    assert!(control.command("OPTS DATAALIVE").await.starts_with("200"));

    let pasv = control.command("PASV").await;
    assert!(pasv.starts_with("227"), "{pasv}");
    let target = parse_pasv_reply(&pasv).unwrap().socket_addr();
    let mut data = TcpStream::connect(target).await.unwrap();

    assert!(control.command("STOR short.bin").await.starts_with("150"));
    data.write_i64(100).await.unwrap();
    data.write_all(&[7u8; 90]).await.unwrap();
    drop(data);

    let reply = control.reply().await;
    assert!(reply.starts_with("426"), "{reply}");
    // The session survives the failed transfer
    assert!(control.command("NOOP").await.starts_with("200"));
}
