// src/conn.rs
//
// Per-connection state: the input-side parser machine walking the read
// buffer, and the output-side responder staging headers into the write
// buffer with the mapped file as a second scatter-gather segment. Workers
// drive the parse side; the reactor drives the send side.

use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::creds::CredStore;
use crate::http::{error_body, status_title, Method, Verdict, EMPTY_FILE_BODY};
use crate::parser::{self, HeaderLine, LineStatus};
use crate::syscalls::{self, FileMap};
use crate::timer::TimerHandle;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Content,
}

/// Outcome of one nonblocking read off the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// New bytes landed in the buffer (or it was already full).
    Data,
    /// EAGAIN: nothing to read yet, stay registered.
    NoData,
    /// Peer closed its end.
    Closed,
    /// Transport error.
    Failed,
}

/// Outcome of the reactor's vectored-send loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Kernel buffer filled; re-arm for write readiness.
    Partial { sent: usize },
    /// Whole response on the wire.
    Complete { keep_alive: bool, sent: usize },
    /// Transport error; the connection is done.
    Error { sent: usize },
}

pub struct HttpConn {
    pub(crate) fd: i32,
    pub(crate) generation: u64,
    pub(crate) peer: Option<SocketAddr>,

    read_buf: [u8; READ_BUFFER_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,

    write_buf: [u8; WRITE_BUFFER_SIZE],
    write_idx: usize,

    state: ParseState,
    method: Method,
    url: (usize, usize),
    host: (usize, usize),
    content_length: usize,
    body_start: usize,
    keep_alive: bool,
    cgi: bool,

    file_path: PathBuf,
    file_len: usize,
    file_map: Option<FileMap>,

    bytes_sent: usize,
    bytes_to_send: usize,

    /// Reactor-owned handle into the timer list.
    pub(crate) timer: Option<TimerHandle>,
}

impl HttpConn {
    pub fn new() -> Self {
        Self {
            fd: -1,
            generation: 0,
            peer: None,
            read_buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
            state: ParseState::RequestLine,
            method: Method::Unknown,
            url: (0, 0),
            host: (0, 0),
            content_length: 0,
            body_start: 0,
            keep_alive: false,
            cgi: false,
            file_path: PathBuf::new(),
            file_len: 0,
            file_map: None,
            bytes_sent: 0,
            bytes_to_send: 0,
            timer: None,
        }
    }

    /// Take over the slot for a freshly accepted socket. Returns the new
    /// generation, which stale timers and work items are checked against.
    pub fn init(&mut self, fd: i32, peer: SocketAddr) -> u64 {
        self.reset_for_next_request();
        self.fd = fd;
        self.peer = Some(peer);
        self.generation = self.generation.wrapping_add(1);
        self.timer = None;
        self.generation
    }

    /// Clear the slot. Idempotent; the raw fd is closed by the caller.
    pub fn release(&mut self) {
        self.fd = -1;
        self.peer = None;
        self.timer = None;
        self.unmap();
    }

    pub fn is_live(&self) -> bool {
        self.fd >= 0
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Value of the Host header, when one was seen.
    pub fn host_header(&self) -> Option<&str> {
        let (hs, hl) = self.host;
        if hl == 0 {
            return None;
        }
        std::str::from_utf8(&self.read_buf[hs..hs + hl]).ok()
    }

    /// The resolved target of the current request, empty until do_request.
    pub fn target_path(&self) -> &Path {
        &self.file_path
    }

    /// Reset the request/response machinery between keep-alive requests.
    pub fn reset_for_next_request(&mut self) {
        self.read_buf[..self.read_idx].fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.write_idx = 0;
        self.state = ParseState::RequestLine;
        self.method = Method::Unknown;
        self.url = (0, 0);
        self.host = (0, 0);
        self.content_length = 0;
        self.body_start = 0;
        self.keep_alive = false;
        self.cgi = false;
        self.file_path = PathBuf::new();
        self.file_len = 0;
        self.unmap();
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
    }

    fn unmap(&mut self) {
        self.file_map = None;
    }

    // ---- input side ----

    /// One nonblocking read into the free tail of the buffer.
    pub fn read_from_socket(&mut self) -> ReadOutcome {
        if self.read_idx >= READ_BUFFER_SIZE {
            // Full buffer: let the parser rule on what is there.
            return ReadOutcome::Data;
        }
        match syscalls::read(self.fd, &mut self.read_buf[self.read_idx..]) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                self.read_idx += n;
                ReadOutcome::Data
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::NoData,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ReadOutcome::NoData,
            Err(_) => ReadOutcome::Failed,
        }
    }

    /// Advance the parser over everything buffered so far. On a complete
    /// request the file resolution runs and its verdict comes back.
    pub fn process_read(&mut self, doc_root: &Path, creds: &CredStore) -> Verdict {
        loop {
            debug_assert!(
                self.start_line <= self.checked_idx
                    && self.checked_idx <= self.read_idx
                    && self.read_idx <= READ_BUFFER_SIZE
            );

            if self.state == ParseState::Content {
                if self.read_idx - self.checked_idx >= self.content_length {
                    self.body_start = self.checked_idx;
                    self.checked_idx += self.content_length;
                    self.start_line = self.checked_idx;
                    return self.do_request(doc_root, creds);
                }
                return if self.read_idx >= READ_BUFFER_SIZE {
                    Verdict::BadRequest
                } else {
                    Verdict::NoRequest
                };
            }

            match parser::parse_line(&self.read_buf, self.checked_idx, self.read_idx) {
                LineStatus::Open => {
                    // A line that cannot terminate within the buffer is fatal.
                    return if self.read_idx >= READ_BUFFER_SIZE {
                        Verdict::BadRequest
                    } else {
                        Verdict::NoRequest
                    };
                }
                LineStatus::Bad => return Verdict::BadRequest,
                LineStatus::Ok { end, next } => {
                    let line_start = self.start_line;
                    self.checked_idx = next;
                    self.start_line = next;

                    let verdict = if self.state == ParseState::RequestLine {
                        self.handle_request_line(line_start, end)
                    } else {
                        self.handle_header_line(line_start, end)
                    };
                    match verdict {
                        Verdict::NoRequest => continue,
                        Verdict::GetRequest => return self.do_request(doc_root, creds),
                        other => return other,
                    }
                }
            }
        }
    }

    fn handle_request_line(&mut self, line_start: usize, line_end: usize) -> Verdict {
        let line = &self.read_buf[line_start..line_end];
        let rl = match parser::parse_request_line(line) {
            Some(rl) => rl,
            None => return Verdict::BadRequest,
        };
        match rl.method {
            Method::Get => {}
            Method::Post => self.cgi = true,
            _ => return Verdict::BadRequest,
        }
        self.method = rl.method;
        self.url = (line_start + rl.url_start, rl.url_len);
        self.state = ParseState::Headers;
        Verdict::NoRequest
    }

    fn handle_header_line(&mut self, line_start: usize, line_end: usize) -> Verdict {
        let line = &self.read_buf[line_start..line_end];
        match parser::parse_header_line(line) {
            HeaderLine::End => {
                if self.content_length > 0 {
                    // The body must fit in what is left of the buffer.
                    if self.checked_idx + self.content_length > READ_BUFFER_SIZE {
                        return Verdict::BadRequest;
                    }
                    self.state = ParseState::Content;
                    Verdict::NoRequest
                } else {
                    Verdict::GetRequest
                }
            }
            HeaderLine::Connection { keep_alive } => {
                self.keep_alive = keep_alive;
                Verdict::NoRequest
            }
            HeaderLine::ContentLength(n) => {
                self.content_length = n;
                Verdict::NoRequest
            }
            HeaderLine::Host { start, len } => {
                self.host = (line_start + start, len);
                Verdict::NoRequest
            }
            HeaderLine::Malformed => Verdict::BadRequest,
            HeaderLine::Other => {
                tracing::debug!(
                    header = %String::from_utf8_lossy(line),
                    "ignoring unrecognized header"
                );
                Verdict::NoRequest
            }
        }
    }

    /// Resolve the target under the document root and map it for sending.
    fn do_request(&mut self, doc_root: &Path, creds: &CredStore) -> Verdict {
        let (us, ul) = self.url;
        let url: String = match std::str::from_utf8(&self.read_buf[us..us + ul]) {
            Ok(u) => u.to_owned(),
            Err(_) => return Verdict::BadRequest,
        };

        let target: String = if self.method == Method::Post && self.cgi {
            let body = &self.read_buf[self.body_start..self.body_start + self.content_length];
            match route_post(&url, body, creds) {
                PostRoute::Rewritten(page) => page.to_string(),
                PostRoute::NotAnEndpoint => url,
                PostRoute::Malformed => return Verdict::BadRequest,
            }
        } else {
            url
        };

        if target.split('/').any(|seg| seg == "..") {
            return Verdict::Forbidden;
        }
        let path = doc_root.join(target.trim_start_matches('/'));

        let info = match syscalls::stat_path(&path) {
            Ok(info) => info,
            Err(_) => return Verdict::NoResource,
        };
        if !info.world_readable {
            return Verdict::Forbidden;
        }
        if info.is_dir {
            return Verdict::BadRequest;
        }

        self.file_len = info.size;
        if info.size > 0 {
            match syscalls::map_file(&path, info.size) {
                Ok(map) => self.file_map = Some(map),
                Err(_) => return Verdict::InternalError,
            }
        }
        self.file_path = path;
        Verdict::FileRequest
    }

    // ---- output side ----

    /// Stage the response for `verdict` into the write buffer. Returns false
    /// when framing fails, in which case the connection is torn down.
    pub fn process_write(&mut self, verdict: Verdict) -> bool {
        let ok = match verdict {
            Verdict::FileRequest => {
                if self.file_len > 0 {
                    self.add_status_line(200) && self.add_headers(self.file_len)
                } else {
                    self.add_status_line(200)
                        && self.add_headers(EMPTY_FILE_BODY.len())
                        && self.add_content(EMPTY_FILE_BODY)
                }
            }
            Verdict::BadRequest => self.stage_error(400),
            Verdict::Forbidden => self.stage_error(403),
            Verdict::NoResource => self.stage_error(404),
            Verdict::InternalError => self.stage_error(500),
            _ => false,
        };
        if !ok {
            return false;
        }
        self.bytes_sent = 0;
        self.bytes_to_send =
            self.write_idx + self.file_map.as_ref().map_or(0, |m| m.len());
        true
    }

    fn stage_error(&mut self, code: u16) -> bool {
        // Error responses never carry the file and always close.
        self.unmap();
        self.write_idx = 0;
        self.keep_alive = false;
        let body = error_body(code);
        self.add_status_line(code) && self.add_headers(body.len()) && self.add_content(body)
    }

    fn add_status_line(&mut self, code: u16) -> bool {
        self.append(format_args!("HTTP/1.1 {} {}\r\n", code, status_title(code)))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        let linger = if self.keep_alive { "keep-alive" } else { "close" };
        self.append(format_args!(
            "Content-Length: {}\r\nContent-Type: text/html\r\nConnection: {}\r\n\r\n",
            content_len, linger
        ))
    }

    fn add_content(&mut self, body: &str) -> bool {
        self.append(format_args!("{}", body))
    }

    fn append(&mut self, args: fmt::Arguments<'_>) -> bool {
        let Self {
            write_buf,
            write_idx,
            ..
        } = self;
        let mut cursor = WriteCursor {
            buf: write_buf,
            idx: write_idx,
        };
        cursor.write_fmt(args).is_ok()
    }

    /// Drain the staged response: headers first, then the mapped file, via
    /// writev while both segments are pending.
    pub fn flush(&mut self) -> WriteOutcome {
        let fd = self.fd;
        let mut sent = 0usize;
        loop {
            let result = if self.bytes_sent < self.write_idx {
                match &self.file_map {
                    Some(map) => syscalls::writev(
                        fd,
                        &[&self.write_buf[self.bytes_sent..self.write_idx], map.as_slice()],
                    ),
                    None => syscalls::write(fd, &self.write_buf[self.bytes_sent..self.write_idx]),
                }
            } else {
                match &self.file_map {
                    Some(map) => {
                        let off = self.bytes_sent - self.write_idx;
                        syscalls::write(fd, &map.as_slice()[off..])
                    }
                    None => Ok(0),
                }
            };

            match result {
                Ok(n) => {
                    self.bytes_sent += n;
                    sent += n;
                    if self.bytes_sent >= self.bytes_to_send {
                        self.unmap();
                        return WriteOutcome::Complete {
                            keep_alive: self.keep_alive,
                            sent,
                        };
                    }
                    if n == 0 {
                        return WriteOutcome::Partial { sent };
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return WriteOutcome::Partial { sent };
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.unmap();
                    return WriteOutcome::Error { sent };
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn staged_response(&self) -> &[u8] {
        &self.write_buf[..self.write_idx]
    }

    #[cfg(test)]
    pub(crate) fn push_bytes(&mut self, data: &[u8]) {
        self.read_buf[self.read_idx..self.read_idx + data.len()].copy_from_slice(data);
        self.read_idx += data.len();
    }
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

struct WriteCursor<'a> {
    buf: &'a mut [u8; WRITE_BUFFER_SIZE],
    idx: &'a mut usize,
}

impl fmt::Write for WriteCursor<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = *self.idx + bytes.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[*self.idx..end].copy_from_slice(bytes);
        *self.idx = end;
        Ok(())
    }
}

enum PostRoute {
    Rewritten(&'static str),
    NotAnEndpoint,
    Malformed,
}

/// Map a POST to the login/register endpoints onto the page to serve.
fn route_post(url: &str, body: &[u8], creds: &CredStore) -> PostRoute {
    if url != "/login" && url != "/register" {
        return PostRoute::NotAnEndpoint;
    }
    let body = match std::str::from_utf8(body) {
        Ok(b) => b,
        Err(_) => return PostRoute::Malformed,
    };

    let mut user = None;
    let mut password = None;
    for pair in body.split('&') {
        match pair.split_once('=') {
            Some(("user", v)) => user = Some(v),
            Some(("password", v)) => password = Some(v),
            _ => {}
        }
    }
    let (user, password) = match (user, password) {
        (Some(u), Some(p)) => (u, p),
        _ => return PostRoute::Malformed,
    };

    let page = if url == "/login" {
        if creds.verify(user, password) {
            "/welcome.html"
        } else {
            "/login_error.html"
        }
    } else if creds.register(user, password) {
        "/login.html"
    } else {
        "/register_error.html"
    };
    PostRoute::Rewritten(page)
}
