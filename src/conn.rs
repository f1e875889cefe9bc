// src/conn.rs
//
// Per-connection HTTP/1.1 state machine. One instance owns a socket's
// read/write buffers, parser cursors, and the resolved file resources.
// The reactor drains reads and performs writes; a pool worker runs
// `process()`. Exactly one thread touches a connection at a time, enforced
// by one-shot readiness re-arming rather than by contention on the slot
// lock.
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddrV4;
use std::ops::Range;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::Mmap;
use tracing::{debug, trace, warn};

use crate::config::{MAX_PATH_LEN, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
use crate::error::PetrelResult;
use crate::http::{
    CheckState, LineStatus, Method, RequestOutcome, EMPTY_FILE_BODY, ERROR_400_BODY,
    ERROR_400_TITLE, ERROR_403_BODY, ERROR_403_TITLE, ERROR_404_BODY, ERROR_404_TITLE,
    ERROR_500_BODY, ERROR_500_TITLE, OK_200_TITLE,
};
use crate::pool::Work;
use crate::server::Shared;
use crate::syscalls::{self, READABLE, WRITABLE};

pub struct Conn {
    shared: Arc<Shared>,
    fd: i32,
    peer: Option<SocketAddrV4>,

    read_buf: [u8; READ_BUFFER_SIZE],
    /// End of data received so far.
    read_pos: usize,
    /// End of data already scanned for line terminators.
    checked_pos: usize,
    /// Start of the line currently being interpreted.
    line_start: usize,

    state: CheckState,
    method: Method,
    target: String,
    host: String,
    keep_alive: bool,
    content_length: usize,

    /// Size of the resolved file, valid between resolution and completion.
    file_size: usize,
    /// Read-only mapping of the resolved file, released exactly once per
    /// resolution via `release_mapping`.
    mapped: Option<Mmap>,

    write_buf: [u8; WRITE_BUFFER_SIZE],
    write_len: usize,
    bytes_to_send: usize,
    bytes_sent: usize,
}

impl Conn {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            fd: -1,
            peer: None,
            read_buf: [0; READ_BUFFER_SIZE],
            read_pos: 0,
            checked_pos: 0,
            line_start: 0,
            state: CheckState::RequestLine,
            method: Method::Unknown,
            target: String::new(),
            host: String::new(),
            keep_alive: false,
            content_length: 0,
            file_size: 0,
            mapped: None,
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_len: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Take over a freshly accepted socket: set SO_REUSEPORT, register
    /// one-shot for read readiness, and count it live. On registration
    /// failure the descriptor is closed here.
    pub fn open(&mut self, fd: i32, peer: SocketAddrV4) -> PetrelResult<()> {
        self.reset();
        self.fd = fd;
        self.peer = Some(peer);
        if let Err(e) = syscalls::set_reuseport(fd) {
            debug!(fd, error = %e, "SO_REUSEPORT not applied");
        }
        if let Err(e) = self.shared.epoll.register(fd, fd as u64, READABLE, true) {
            unsafe { libc::close(fd) };
            self.fd = -1;
            self.peer = None;
            return Err(e);
        }
        self.shared.live.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Tear the connection down: remove from epoll, close the descriptor,
    /// decrement the live counter, drop any mapping. Idempotent.
    pub fn close(&mut self) {
        if self.fd == -1 {
            return;
        }
        trace!(fd = self.fd, peer = ?self.peer, "closing connection");
        if let Err(e) = self.shared.epoll.unregister(self.fd) {
            debug!(fd = self.fd, error = %e, "unregister failed");
        }
        self.shared.live.fetch_sub(1, Ordering::Relaxed);
        self.fd = -1;
        self.peer = None;
        self.reset();
    }

    /// Return to the initial empty state, keeping the descriptor. Used
    /// between keep-alive requests and as part of teardown.
    fn reset(&mut self) {
        self.release_mapping();
        self.read_pos = 0;
        self.checked_pos = 0;
        self.line_start = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Unknown;
        self.target.clear();
        self.host.clear();
        self.keep_alive = false;
        self.content_length = 0;
        self.file_size = 0;
        self.write_len = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    /// Unmap the response file. Dropping the Mmap performs the munmap;
    /// `take` keeps repeated calls harmless.
    fn release_mapping(&mut self) {
        self.mapped.take();
    }

    // ---- read side -------------------------------------------------

    /// Drain the socket into the read buffer from `read_pos`. Returns
    /// false on EOF or a transport error (caller tears down). A full
    /// buffer stops the drain and leaves the rest for a later pass.
    pub fn on_readable(&mut self) -> bool {
        if self.read_pos >= READ_BUFFER_SIZE {
            // Already full and still no complete request: it never fits.
            return false;
        }
        loop {
            if self.read_pos >= READ_BUFFER_SIZE {
                return true;
            }
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_pos..]) {
                Ok(Some(0)) => return false,
                Ok(Some(n)) => self.read_pos += n,
                Ok(None) => return true,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    /// Scan from `checked_pos` for the next line terminator. On success
    /// the returned span excludes the terminator and the cursors advance
    /// past it; `Open` leaves the cursors so a later read can resume.
    fn parse_line(&mut self) -> LineStatus {
        while self.checked_pos < self.read_pos {
            match self.read_buf[self.checked_pos] {
                b'\r' => {
                    if self.checked_pos + 1 == self.read_pos {
                        return LineStatus::Open;
                    }
                    if self.read_buf[self.checked_pos + 1] == b'\n' {
                        let line = self.line_start..self.checked_pos;
                        self.checked_pos += 2;
                        self.line_start = self.checked_pos;
                        return LineStatus::Ok(line);
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked_pos > 1 && self.read_buf[self.checked_pos - 1] == b'\r' {
                        let line = self.line_start..self.checked_pos - 1;
                        self.checked_pos += 1;
                        self.line_start = self.checked_pos;
                        return LineStatus::Ok(line);
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_pos += 1,
            }
        }
        LineStatus::Open
    }

    /// GET <target> HTTP/1.1, whitespace-separated. Absolute-form targets
    /// are stripped down to the path from the first slash after the host.
    fn parse_request_line(&mut self, line: Range<usize>) -> RequestOutcome {
        let Ok(text) = std::str::from_utf8(&self.read_buf[line]) else {
            return RequestOutcome::BadRequest;
        };
        let mut parts = text.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return RequestOutcome::BadRequest;
        };

        if Method::from_bytes(method.as_bytes()) != Method::Get {
            return RequestOutcome::BadRequest;
        }
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return RequestOutcome::BadRequest;
        }

        let mut target = target;
        if target.len() >= 7 && target.as_bytes()[..7].eq_ignore_ascii_case(b"http://") {
            match target[7..].find('/') {
                Some(i) => target = &target[7 + i..],
                None => return RequestOutcome::BadRequest,
            }
        }
        if !target.starts_with('/') {
            return RequestOutcome::BadRequest;
        }

        self.method = Method::Get;
        self.target.clear();
        self.target.push_str(target);
        self.state = CheckState::Headers;
        RequestOutcome::Incomplete
    }

    /// One header line. A blank line ends the header section; recognized
    /// headers are matched by case-insensitive prefix, everything else is
    /// ignored.
    fn parse_header(&mut self, line: Range<usize>) -> RequestOutcome {
        if line.is_empty() {
            if self.content_length != 0 {
                self.state = CheckState::Body;
                return RequestOutcome::Incomplete;
            }
            return RequestOutcome::Complete;
        }

        let Ok(text) = std::str::from_utf8(&self.read_buf[line]) else {
            // Headers we cannot even decode are treated like unknown ones.
            return RequestOutcome::Incomplete;
        };

        if let Some(value) = strip_prefix_ci(text, "Connection:") {
            if value.trim().eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            }
        } else if let Some(value) = strip_prefix_ci(text, "Content-Length:") {
            self.content_length = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = strip_prefix_ci(text, "Host:") {
            self.host.clear();
            self.host.push_str(value.trim());
        } else {
            debug!(header = text, "ignoring unrecognized header");
        }
        RequestOutcome::Incomplete
    }

    /// Drive the state machine over whatever bytes have arrived. Stops at
    /// the first bad line, at request completion (which triggers resource
    /// resolution), or when no complete line remains.
    pub fn process_read(&mut self) -> RequestOutcome {
        loop {
            if self.state == CheckState::Body {
                // The body is not parsed, only counted: complete once
                // everything after the header terminator has arrived.
                if self.read_pos >= self.checked_pos + self.content_length {
                    return self.do_request();
                }
                return RequestOutcome::Incomplete;
            }

            let line = match self.parse_line() {
                LineStatus::Open => return RequestOutcome::Incomplete,
                LineStatus::Bad => return RequestOutcome::BadRequest,
                LineStatus::Ok(line) => line,
            };

            let outcome = match self.state {
                CheckState::RequestLine => self.parse_request_line(line),
                CheckState::Headers => self.parse_header(line),
                CheckState::Body => return RequestOutcome::InternalError,
            };
            match outcome {
                RequestOutcome::Incomplete => continue,
                RequestOutcome::Complete => return self.do_request(),
                other => return other,
            }
        }
    }

    /// Resolve the target against the document root: stat it, check it is
    /// a world-readable regular file, and map it read-only. The mapping is
    /// held until the response completes or the connection dies.
    fn do_request(&mut self) -> RequestOutcome {
        let path = format!("{}{}", self.shared.doc_root.display(), self.target);
        if path.len() > MAX_PATH_LEN {
            return RequestOutcome::BadRequest;
        }

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return RequestOutcome::NoResource,
        };
        if meta.mode() & 0o004 == 0 {
            return RequestOutcome::Forbidden;
        }
        if meta.is_dir() {
            return RequestOutcome::BadRequest;
        }

        self.file_size = meta.len() as usize;
        if self.file_size > 0 {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path, error = %e, "open failed after stat");
                    return RequestOutcome::InternalError;
                }
            };
            match unsafe { Mmap::map(&file) } {
                Ok(map) => self.mapped = Some(map),
                Err(e) => {
                    warn!(path = %path, error = %e, "mmap failed");
                    return RequestOutcome::InternalError;
                }
            }
        }
        trace!(
            fd = self.fd,
            method = ?self.method,
            host = %self.host,
            path = %path,
            size = self.file_size,
            "resolved request"
        );
        RequestOutcome::FileRequest
    }

    // ---- write side ------------------------------------------------

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut cursor = io::Cursor::new(&mut self.write_buf[self.write_len..]);
        if cursor.write_fmt(args).is_err() {
            return false;
        }
        self.write_len += cursor.position() as usize;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {status} {title}\r\n"))
    }

    fn add_headers(&mut self, content_length: usize) -> bool {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Content-Length: {content_length}\r\n"))
            && self.add_response(format_args!("Connection: {connection}\r\n"))
            && self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{content}"))
    }

    /// Build the response for the given outcome into the write buffer and
    /// set up the send segments. Returns false when the buffer overflows
    /// or the outcome cannot be answered (caller tears down).
    pub fn process_write(&mut self, outcome: RequestOutcome) -> bool {
        let ok = match outcome {
            RequestOutcome::InternalError => {
                self.add_status_line(500, ERROR_500_TITLE)
                    && self.add_headers(ERROR_500_BODY.len())
                    && self.add_content(ERROR_500_BODY)
            }
            RequestOutcome::BadRequest => {
                self.add_status_line(400, ERROR_400_TITLE)
                    && self.add_headers(ERROR_400_BODY.len())
                    && self.add_content(ERROR_400_BODY)
            }
            RequestOutcome::NoResource => {
                self.add_status_line(404, ERROR_404_TITLE)
                    && self.add_headers(ERROR_404_BODY.len())
                    && self.add_content(ERROR_404_BODY)
            }
            RequestOutcome::Forbidden => {
                self.add_status_line(403, ERROR_403_TITLE)
                    && self.add_headers(ERROR_403_BODY.len())
                    && self.add_content(ERROR_403_BODY)
            }
            RequestOutcome::FileRequest => {
                if !self.add_status_line(200, OK_200_TITLE) {
                    return false;
                }
                if self.file_size != 0 {
                    if !self.add_headers(self.file_size) {
                        return false;
                    }
                    // Second segment is the mapping itself: zero copy.
                    self.bytes_to_send = self.write_len + self.file_size;
                    self.bytes_sent = 0;
                    return true;
                }
                self.add_headers(EMPTY_FILE_BODY.len()) && self.add_content(EMPTY_FILE_BODY)
            }
            RequestOutcome::Incomplete | RequestOutcome::Complete => false,
        };

        if !ok {
            return false;
        }
        self.bytes_to_send = self.write_len;
        self.bytes_sent = 0;
        true
    }

    /// Reactor-driven non-blocking write over the header segment and the
    /// mapped file. Returns false when the connection should be torn down;
    /// true means it stays registered (pending write or keep-alive reset).
    pub fn on_writable(&mut self) -> bool {
        if self.bytes_to_send == 0 {
            // Nothing pending: go back to waiting for the next request.
            if self
                .shared
                .epoll
                .rearm(self.fd, self.fd as u64, READABLE)
                .is_err()
            {
                return false;
            }
            self.reset();
            return true;
        }

        loop {
            let header = &self.write_buf[..self.write_len];
            let sent = self.bytes_sent;
            let written = match self.mapped.as_ref() {
                Some(map) => {
                    if sent < header.len() {
                        syscalls::writev_nonblocking(
                            self.fd,
                            &[&header[sent..], &map[..self.file_size]],
                        )
                    } else {
                        syscalls::writev_nonblocking(
                            self.fd,
                            &[&map[sent - header.len()..self.file_size]],
                        )
                    }
                }
                None => syscalls::writev_nonblocking(self.fd, &[&header[sent..]]),
            };

            match written {
                Ok(Some(n)) => {
                    self.bytes_sent += n;
                    self.bytes_to_send -= n;
                }
                Ok(None) => {
                    // Kernel buffer full; finish on the next writable event.
                    return self
                        .shared
                        .epoll
                        .rearm(self.fd, self.fd as u64, WRITABLE)
                        .is_ok();
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.release_mapping();
                    return false;
                }
            }

            if self.bytes_to_send == 0 {
                self.release_mapping();
                if self
                    .shared
                    .epoll
                    .rearm(self.fd, self.fd as u64, READABLE)
                    .is_err()
                {
                    return false;
                }
                if self.keep_alive {
                    self.reset();
                    return true;
                }
                return false;
            }
        }
    }

    /// Pool entry point: parse whatever has arrived, then either re-arm
    /// for more reads (incomplete), build a response and re-arm for write
    /// readiness, or tear down on unanswerable states.
    pub fn process(&mut self) {
        let outcome = self.process_read();
        if outcome == RequestOutcome::Incomplete {
            if self
                .shared
                .epoll
                .rearm(self.fd, self.fd as u64, READABLE)
                .is_err()
            {
                self.close();
            }
            return;
        }

        if !self.process_write(outcome) {
            self.close();
            return;
        }
        if self
            .shared
            .epoll
            .rearm(self.fd, self.fd as u64, WRITABLE)
            .is_err()
        {
            self.close();
        }
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// One slot of the connection table. The mutex is uncontended under the
/// one-shot protocol; it exists so exclusive access is checked by the
/// compiler and so the pool can call `process` through `&self`.
pub struct ConnSlot {
    inner: Mutex<Conn>,
}

impl ConnSlot {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            inner: Mutex::new(Conn::new(shared)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Conn> {
        self.inner.lock().expect("connection lock poisoned")
    }
}

impl Work for ConnSlot {
    fn process(&self) {
        self.lock().process();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ERROR_404_BODY;
    use crate::syscalls::Epoll;
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const FILE_BODY: &[u8] = b"The quick brown fox jumps.\n"; // 27 bytes

    fn test_shared(root: &TempDir) -> Arc<Shared> {
        Arc::new(Shared {
            epoll: Epoll::new().unwrap(),
            live: AtomicUsize::new(0),
            doc_root: root.path().to_path_buf(),
        })
    }

    fn make_root() -> TempDir {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("hello.html"), FILE_BODY).unwrap();
        root
    }

    fn push(conn: &mut Conn, bytes: &[u8]) {
        conn.read_buf[conn.read_pos..conn.read_pos + bytes.len()].copy_from_slice(bytes);
        conn.read_pos += bytes.len();
    }

    fn header_text(conn: &Conn) -> &str {
        std::str::from_utf8(&conn.write_buf[..conn.write_len]).unwrap()
    }

    #[test]
    fn parses_complete_get_request() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(
            &mut conn,
            b"GET /hello.html HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
        );

        assert_eq!(conn.process_read(), RequestOutcome::FileRequest);
        assert_eq!(conn.method, Method::Get);
        assert_eq!(conn.target, "/hello.html");
        assert_eq!(conn.host, "h");
        assert!(!conn.keep_alive);
        assert_eq!(conn.file_size, FILE_BODY.len());
        assert!(conn.mapped.is_some());
        assert_eq!(&conn.mapped.as_ref().unwrap()[..], FILE_BODY);

        assert!(conn.process_write(RequestOutcome::FileRequest));
        let headers = header_text(&conn);
        assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(headers.contains("Content-Length: 27\r\n"));
        assert!(headers.contains("Connection: close\r\n"));
        assert_eq!(conn.bytes_to_send, conn.write_len + FILE_BODY.len());
    }

    #[test]
    fn parsing_is_chunk_boundary_independent() {
        let root = make_root();
        let request: &[u8] =
            b"GET /hello.html HTTP/1.1\r\nHost: example\r\nConnection: keep-alive\r\n\r\n";

        for split in 1..request.len() - 1 {
            let mut conn = Conn::new(test_shared(&root));
            push(&mut conn, &request[..split]);
            assert_eq!(
                conn.process_read(),
                RequestOutcome::Incomplete,
                "split at {split}"
            );
            push(&mut conn, &request[split..]);
            assert_eq!(
                conn.process_read(),
                RequestOutcome::FileRequest,
                "split at {split}"
            );
            assert_eq!(conn.target, "/hello.html");
            assert_eq!(conn.host, "example");
            assert!(conn.keep_alive);
        }
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET /missing HTTP/1.1\r\n\r\n");

        assert_eq!(conn.process_read(), RequestOutcome::NoResource);
        assert!(conn.process_write(RequestOutcome::NoResource));
        let text = header_text(&conn);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with(ERROR_404_BODY));
    }

    #[test]
    fn unreadable_file_maps_to_forbidden() {
        let root = make_root();
        let secret = root.path().join("secret.txt");
        std::fs::write(&secret, b"hidden").unwrap();
        std::fs::set_permissions(&secret, std::fs::Permissions::from_mode(0o600)).unwrap();

        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET /secret.txt HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process_read(), RequestOutcome::Forbidden);
    }

    #[test]
    fn directory_target_maps_to_bad_request() {
        let root = make_root();
        std::fs::create_dir(root.path().join("subdir")).unwrap();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET /subdir HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process_read(), RequestOutcome::BadRequest);
    }

    #[test]
    fn non_get_methods_are_rejected() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"POST /x HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process_read(), RequestOutcome::BadRequest);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET /hello.html HTTP/1.0\r\n\r\n");
        assert_eq!(conn.process_read(), RequestOutcome::BadRequest);
    }

    #[test]
    fn absolute_uri_target_is_rewritten() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(
            &mut conn,
            b"GET http://example.com/hello.html HTTP/1.1\r\n\r\n",
        );
        assert_eq!(conn.process_read(), RequestOutcome::FileRequest);
        assert_eq!(conn.target, "/hello.html");
    }

    #[test]
    fn bare_newline_is_a_bad_line() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET / HTTP/1.1\n");
        assert_eq!(conn.process_read(), RequestOutcome::BadRequest);
    }

    #[test]
    fn carriage_return_without_newline_is_bad() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET / HTTP/1.1\rX");
        assert_eq!(conn.process_read(), RequestOutcome::BadRequest);
    }

    #[test]
    fn trailing_carriage_return_waits_for_more() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(&mut conn, b"GET /hello.html HTTP/1.1\r");
        assert_eq!(conn.process_read(), RequestOutcome::Incomplete);
        push(&mut conn, b"\n\r\n");
        assert_eq!(conn.process_read(), RequestOutcome::FileRequest);
    }

    #[test]
    fn body_completion_is_counted_not_parsed() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(
            &mut conn,
            b"GET /hello.html HTTP/1.1\r\nContent-Length: 5\r\n\r\nab",
        );
        assert_eq!(conn.process_read(), RequestOutcome::Incomplete);
        push(&mut conn, b"cde");
        assert_eq!(conn.process_read(), RequestOutcome::FileRequest);
    }

    #[test]
    fn reset_releases_mapping_and_clears_cursors() {
        let root = make_root();
        let mut conn = Conn::new(test_shared(&root));
        push(
            &mut conn,
            b"GET /hello.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        );
        assert_eq!(conn.process_read(), RequestOutcome::FileRequest);
        assert!(conn.mapped.is_some());
        assert!(conn.keep_alive);

        conn.reset();
        assert!(conn.mapped.is_none());
        assert_eq!(conn.read_pos, 0);
        assert_eq!(conn.checked_pos, 0);
        assert!(!conn.keep_alive);

        // Releasing again is harmless.
        conn.release_mapping();
        assert!(conn.mapped.is_none());

        // A second request parses independently of the first.
        push(&mut conn, b"GET /missing HTTP/1.1\r\nHost: h2\r\n\r\n");
        assert_eq!(conn.process_read(), RequestOutcome::NoResource);
        assert_eq!(conn.host, "h2");
        assert!(conn.mapped.is_none());
    }

    #[test]
    fn write_path_sends_header_and_mapped_body() {
        let root = make_root();
        let shared = test_shared(&root);

        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let (server_fd, client_fd) = (fds[0], fds[1]);

        let mut conn = Conn::new(Arc::clone(&shared));
        conn.open(server_fd, SocketAddrV4::new([127, 0, 0, 1].into(), 0))
            .unwrap();

        push(
            &mut conn,
            b"GET /hello.html HTTP/1.1\r\nConnection: close\r\n\r\n",
        );
        assert_eq!(conn.process_read(), RequestOutcome::FileRequest);
        assert!(conn.process_write(RequestOutcome::FileRequest));
        let header_len = conn.write_len;

        // Connection: close, so a completed write asks for teardown.
        assert!(!conn.on_writable());
        assert!(conn.mapped.is_none());
        conn.close();

        let mut response = vec![0u8; header_len + FILE_BODY.len()];
        let mut client = unsafe {
            use std::os::unix::io::FromRawFd;
            std::fs::File::from_raw_fd(client_fd)
        };
        client.read_exact(&mut response).unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 27\r\n"));
        assert!(text.ends_with("The quick brown fox jumps.\n"));
    }
}
