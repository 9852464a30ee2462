//! End-to-end scenarios for the anonymous FTP core, driven over real
//! loopback sockets against a real temporary directory -- no mocks, in the
//! same spirit as `tokio-rs-mio`'s own `tests/tcp.rs`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use pollftpd::server::Server;

/// Binds a loopback listener, starts a `Server` around it with a fresh
/// temp-dir root, and returns both so the caller can connect clients and
/// inspect the served directory. The server is stopped when the returned
/// guard is dropped.
struct TestServer {
    server: Arc<Server>,
    addr: std::net::SocketAddr,
    root: tempfile::TempDir,
}

impl TestServer {
    fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let root = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(listener, root.path().to_path_buf(), 4).unwrap());
        server.start();
        TestServer { server, addr, root }
    }

    fn connect(&self) -> Client {
        let stream = StdTcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Client { stream, reader }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
    }
}

struct Client {
    stream: StdTcpStream,
    reader: BufReader<StdTcpStream>,
}

impl Client {
    fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\r\n").unwrap();
    }

    /// Reads a single `\r\n`-terminated reply line, with the terminator
    /// stripped.
    fn reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    fn authenticate(&mut self) {
        assert_eq!(self.reply(), "220 Hello!");
        self.send("USER anonymous");
        assert_eq!(self.reply(), "230 Log in successful");
    }
}

/// Parses a `227 Entering passive mode (h1,h2,h3,h4,p1,p2)` reply into the
/// port it names.
fn pasv_port(reply: &str) -> u16 {
    let open = reply.find('(').unwrap();
    let close = reply.find(')').unwrap();
    let nums: Vec<u16> = reply[open + 1..close]
        .split(',')
        .map(|s| s.parse().unwrap())
        .collect();
    nums[4] * 256 + nums[5]
}

#[test]
fn greeting_login_and_quit() {
    let server = TestServer::start();
    let mut client = server.connect();
    assert_eq!(client.reply(), "220 Hello!");
    client.send("USER anonymous");
    assert_eq!(client.reply(), "230 Log in successful");
    client.send("QUIT");
    assert_eq!(client.reply(), "221 Bye!");
}

#[test]
fn pwd_after_auth_reports_root() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("PWD");
    assert_eq!(client.reply(), "257 /");
}

#[test]
fn pwd_before_auth_is_rejected() {
    let server = TestServer::start();
    let mut client = server.connect();
    assert_eq!(client.reply(), "220 Hello!");
    client.send("PWD");
    assert_eq!(client.reply(), "530 Not logged in");
}

#[test]
fn type_a_n_is_accepted_others_are_not_implemented() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("TYPE A N");
    assert_eq!(client.reply(), "200 Type changed");
    client.send("TYPE I");
    assert_eq!(client.reply(), "504 Command not implemented for specified value");
}

#[test]
fn unknown_username_is_rejected_and_resets_auth() {
    let server = TestServer::start();
    let mut client = server.connect();
    assert_eq!(client.reply(), "220 Hello!");
    client.send("USER root");
    assert_eq!(client.reply(), "501 Incorrect user name");
    client.send("PWD");
    assert_eq!(client.reply(), "530 Not logged in");
}

#[test]
fn empty_user_before_auth_gets_its_own_reply_not_530() {
    let server = TestServer::start();
    let mut client = server.connect();
    assert_eq!(client.reply(), "220 Hello!");
    client.send("USER");
    assert_eq!(client.reply(), "501 Please, specify a username");
}

#[test]
fn list_with_an_explicit_argument_is_always_denied() {
    let server = TestServer::start();
    std::fs::create_dir(server.root.path().join("sub")).unwrap();

    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let _ = client.reply();
    client.send("LIST sub");
    assert_eq!(client.reply(), "534 Request denied");
}

#[test]
fn retr_rejects_traversal_outside_root() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("RETR ../etc/passwd");
    assert_eq!(client.reply(), "501 Invalid path");
}

#[test]
fn pasv_reports_loopback_address_and_a_working_port() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let reply = client.reply();
    assert!(reply.starts_with("227 Entering passive mode (127,0,0,1,"));
    let port = pasv_port(&reply);
    assert_ne!(port, 0);
}

#[test]
fn retr_transfers_a_file_translating_line_endings() {
    let server = TestServer::start();
    std::fs::write(server.root.path().join("hello.txt"), b"hi\n").unwrap();

    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let reply = client.reply();
    let port = pasv_port(&reply);

    client.send("RETR hello.txt");
    assert_eq!(client.reply(), "150 Opening data connection");

    let mut data = TcpStream::connect(("127.0.0.1", port)).unwrap();
    data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut received = Vec::new();
    data.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"hi\r\n");

    assert_eq!(client.reply(), "250 Transfer complete");
}

#[test]
fn retr_of_an_empty_file_still_completes() {
    let server = TestServer::start();
    std::fs::write(server.root.path().join("empty.txt"), b"").unwrap();

    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let port = pasv_port(&client.reply());

    client.send("RETR empty.txt");
    assert_eq!(client.reply(), "150 Opening data connection");

    let mut data = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut received = Vec::new();
    data.read_to_end(&mut received).unwrap();
    assert!(received.is_empty());

    assert_eq!(client.reply(), "250 Transfer complete");
}

#[test]
fn retr_of_a_missing_file_is_denied() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let _ = client.reply();

    client.send("RETR does-not-exist.txt");
    assert_eq!(client.reply(), "534 Request denied");
}

#[test]
fn stor_writes_a_file_translating_line_endings() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let port = pasv_port(&client.reply());

    client.send("STOR up.txt");
    assert_eq!(client.reply(), "150 Opening data connection");

    let mut data = TcpStream::connect(("127.0.0.1", port)).unwrap();
    data.write_all(b"A\r\nB\r\n").unwrap();
    data.shutdown(std::net::Shutdown::Write).unwrap();

    assert_eq!(client.reply(), "250 Transfer complete");

    let contents = std::fs::read(server.root.path().join("up.txt")).unwrap();
    assert_eq!(contents, b"A\nB\n");
}

#[test]
fn stor_can_create_a_file_that_did_not_exist_before() {
    // Open Question 2 in DESIGN.md: the original requires the target to
    // already exist, which would make this scenario fail with `534`. This
    // crate removes that existence check.
    let server = TestServer::start();
    assert!(!server.root.path().join("new.txt").exists());

    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let port = pasv_port(&client.reply());

    client.send("STOR new.txt");
    assert_eq!(client.reply(), "150 Opening data connection");

    let mut data = TcpStream::connect(("127.0.0.1", port)).unwrap();
    data.write_all(b"fresh\r\n").unwrap();
    drop(data);

    assert_eq!(client.reply(), "250 Transfer complete");
    assert_eq!(
        std::fs::read(server.root.path().join("new.txt")).unwrap(),
        b"fresh\n"
    );
}

#[test]
fn list_with_no_argument_lists_the_root_directory() {
    let server = TestServer::start();
    std::fs::write(server.root.path().join("a.txt"), b"x").unwrap();

    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let port = pasv_port(&client.reply());

    client.send("LIST");
    assert_eq!(client.reply(), "150 Opening data connection");

    let mut data = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut received = Vec::new();
    data.read_to_end(&mut received).unwrap();
    let listing = String::from_utf8(received).unwrap();
    assert!(listing.contains("a.txt"));

    assert_eq!(client.reply(), "250 Transfer complete");
}

#[test]
fn unknown_command_is_reported() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("FROBNICATE");
    assert_eq!(client.reply(), "500 Unknown command");
}

#[test]
fn pasv_listener_is_reused_across_transfers_on_the_same_connection() {
    let server = TestServer::start();
    std::fs::write(server.root.path().join("one.txt"), b"1").unwrap();
    std::fs::write(server.root.path().join("two.txt"), b"2").unwrap();

    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let first_port = pasv_port(&client.reply());

    client.send("RETR one.txt");
    assert_eq!(client.reply(), "150 Opening data connection");
    let mut data = TcpStream::connect(("127.0.0.1", first_port)).unwrap();
    let mut buf = Vec::new();
    data.read_to_end(&mut buf).unwrap();
    assert_eq!(client.reply(), "250 Transfer complete");

    client.send("PASV");
    let second_port = pasv_port(&client.reply());
    assert_eq!(first_port, second_port);

    client.send("RETR two.txt");
    assert_eq!(client.reply(), "150 Opening data connection");
    let mut data = TcpStream::connect(("127.0.0.1", second_port)).unwrap();
    let mut buf = Vec::new();
    data.read_to_end(&mut buf).unwrap();
    assert_eq!(client.reply(), "250 Transfer complete");
}

#[test]
fn stop_closes_the_data_channel_of_an_in_flight_transfer() {
    // A connection mid-STOR when the server stops must have its data
    // socket (and open file) actually closed, not left dangling inside the
    // reactor's pending-wait set.
    let server = TestServer::start();
    let mut client = server.connect();
    client.authenticate();
    client.send("PASV");
    let port = pasv_port(&client.reply());

    client.send("STOR stuck.txt");
    assert_eq!(client.reply(), "150 Opening data connection");

    let mut data = TcpStream::connect(("127.0.0.1", port)).unwrap();
    data.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    // Nothing sent and nothing closed: the transfer is parked waiting for
    // more bytes (or EOF) when shutdown happens.

    server.server.stop();

    // The server closing its end must be observable as EOF (or a reset) on
    // the client's side of the data socket.
    let mut buf = [0u8; 1];
    let n = data.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
}
