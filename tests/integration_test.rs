//! End-to-end tests driving a live server over real sockets. Each test
//! starts its own server on an ephemeral port with its own document root,
//! and stops it through the shutdown handle (the SIGTERM path).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use minnow::config::Config;
use minnow::server::{Server, Shared, ShutdownHandle};
use minnow::ServerResult;

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    shared: Arc<Shared>,
    join: Option<thread::JoinHandle<ServerResult<()>>>,
    doc_root: PathBuf,
}

impl TestServer {
    fn start(tag: &str, tweak: impl FnOnce(&mut Config), seed: impl FnOnce(&Server)) -> TestServer {
        let doc_root =
            std::env::temp_dir().join(format!("minnow-it-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&doc_root).unwrap();

        let mut cfg = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            doc_root: doc_root.clone(),
            workers: 2,
            queue_capacity: 64,
            max_fd: 1024,
            max_connections: 1024,
            timeslot_secs: 1,
            credentials_file: None,
        };
        tweak(&mut cfg);

        let server = Server::new(cfg).expect("failed to start test server");
        seed(&server);
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let shared = server.shared();
        let join = thread::spawn(move || server.run());

        TestServer {
            addr,
            handle,
            shared,
            join: Some(join),
            doc_root,
        }
    }

    fn file(&self, name: &str, contents: &[u8]) {
        use std::os::unix::fs::PermissionsExt;
        let p = self.doc_root.join(name);
        std::fs::write(&p, contents).unwrap();
        let mut perm = std::fs::metadata(&p).unwrap().permissions();
        perm.set_mode(0o644);
        std::fs::set_permissions(&p, perm).unwrap();
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    fn active_conns(&self) -> usize {
        self.shared.metrics.active_conns()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            join.join().unwrap().unwrap();
        }
        let _ = std::fs::remove_dir_all(&self.doc_root);
    }
}

/// Send one raw request and read until the server closes the connection.
fn send_and_read_all(server: &TestServer, raw: &str) -> String {
    let mut stream = server.connect();
    stream.write_all(raw.as_bytes()).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}

/// Read one framed response (headers plus Content-Length bytes of body)
/// without expecting the connection to close.
fn read_response(stream: &mut TcpStream) -> String {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = headers
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&tmp[..n]);
    }
    String::from_utf8_lossy(&buf[..header_end + content_length]).to_string()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn simple_get_serves_file() {
    let server = TestServer::start("simple-get", |_| {}, |_| {});
    server.file("index.html", &vec![b'a'; 123]);

    let response = send_and_read_all(&server, "GET /index.html HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("Content-Length: 123\r\n"));
    assert!(response.contains("Content-Type: text/html\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    let body = &response[response.len() - 123..];
    assert!(body.bytes().all(|b| b == b'a'));
}

#[test]
fn keep_alive_serves_two_requests_on_one_socket() {
    let server = TestServer::start("keep-alive", |_| {}, |_| {});
    server.file("page.html", b"page body");

    let mut stream = server.connect();
    let req = "GET /page.html HTTP/1.1\r\nConnection: keep-alive\r\nHost: h\r\n\r\n";

    stream.write_all(req.as_bytes()).unwrap();
    let r1 = read_response(&mut stream);
    assert!(r1.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(r1.contains("Connection: keep-alive\r\n"));
    assert!(r1.ends_with("page body"));
    assert!(wait_until(Duration::from_secs(2), || server.active_conns() == 1));

    stream.write_all(req.as_bytes()).unwrap();
    let r2 = read_response(&mut stream);
    assert!(r2.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(r2.ends_with("page body"));
    assert_eq!(server.active_conns(), 1, "same connection served both");
}

#[test]
fn missing_file_gets_404_and_close() {
    let server = TestServer::start("missing", |_| {}, |_| {});
    let response = send_and_read_all(&server, "GET /nope HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", response);
    assert!(response.contains("was not found on this server"));
}

#[test]
fn bare_lf_gets_400() {
    let server = TestServer::start("bare-lf", |_| {}, |_| {});
    let response = send_and_read_all(&server, "GET /x HTTP/1.1\nHost: h\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
}

#[test]
fn traversal_gets_403() {
    let server = TestServer::start("traversal", |_| {}, |_| {});
    let response = send_and_read_all(&server, "GET /../secret HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);
}

#[test]
fn idle_connection_is_evicted_by_timer() {
    let server = TestServer::start("idle", |_| {}, |_| {});
    let mut stream = server.connect();
    assert!(wait_until(Duration::from_secs(2), || server.active_conns() == 1));

    // Send nothing; the idle timeout is three one-second ticks.
    let started = Instant::now();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "server should close the idle connection");
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "closed suspiciously early: {:?}",
        started.elapsed()
    );
    assert!(wait_until(Duration::from_secs(2), || server.active_conns() == 0));
}

#[test]
fn over_capacity_accept_gets_busy_reply() {
    let server = TestServer::start("busy", |cfg| cfg.max_connections = 1, |_| {});
    let _held = server.connect();
    assert!(wait_until(Duration::from_secs(2), || server.active_conns() == 1));

    let mut second = server.connect();
    let mut out = String::new();
    second.read_to_string(&mut out).unwrap();
    assert!(out.contains("Internal server busy"), "{:?}", out);
    assert_eq!(server.active_conns(), 1);
}

#[test]
fn post_login_serves_welcome_or_error_page() {
    let server = TestServer::start(
        "login",
        |_| {},
        |server| server.credentials().seed_plain("alice", "sesame").unwrap(),
    );
    server.file("welcome.html", b"welcome!");
    server.file("login_error.html", b"bad credentials");

    let body = "user=alice&password=sesame";
    let req = format!(
        "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_and_read_all(&server, &req);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("welcome!"));

    let body = "user=alice&password=nope";
    let req = format!(
        "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_and_read_all(&server, &req);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("bad credentials"));
}

#[test]
fn post_register_creates_user_once() {
    let server = TestServer::start("register", |_| {}, |_| {});
    server.file("login.html", b"now log in");
    server.file("register_error.html", b"name taken");

    let body = "user=bob&password=pw";
    let req = format!(
        "POST /register HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );

    let response = send_and_read_all(&server, &req);
    assert!(response.ends_with("now log in"), "{}", response);
    assert!(server.shared.creds.verify("bob", "pw"));

    let response = send_and_read_all(&server, &req);
    assert!(response.ends_with("name taken"), "{}", response);
}

#[test]
fn shutdown_closes_live_connections() {
    let server = TestServer::start("shutdown", |_| {}, |_| {});
    let _stream = server.connect();
    assert!(wait_until(Duration::from_secs(2), || server.active_conns() == 1));
    // Drop stops the server through the shutdown handle and unwraps the
    // reactor's exit status; a hung or failed teardown fails the test.
    drop(server);
}
