// src/http.rs
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get, Post, Head, Put, Delete, Patch, Options, Trace, Connect, Unknown,
}

impl Method {
    /// Case-insensitive method lookup, matching the tolerant parsing of
    /// the request line.
    pub fn from_bytes(b: &[u8]) -> Self {
        if b.eq_ignore_ascii_case(b"GET") {
            Method::Get
        } else if b.eq_ignore_ascii_case(b"POST") {
            Method::Post
        } else if b.eq_ignore_ascii_case(b"HEAD") {
            Method::Head
        } else if b.eq_ignore_ascii_case(b"PUT") {
            Method::Put
        } else if b.eq_ignore_ascii_case(b"DELETE") {
            Method::Delete
        } else if b.eq_ignore_ascii_case(b"PATCH") {
            Method::Patch
        } else if b.eq_ignore_ascii_case(b"OPTIONS") {
            Method::Options
        } else if b.eq_ignore_ascii_case(b"TRACE") {
            Method::Trace
        } else if b.eq_ignore_ascii_case(b"CONNECT") {
            Method::Connect
        } else {
            Method::Unknown
        }
    }
}

/// Primary parser state: which part of the request is being interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Body,
}

/// Result of one line-extraction pass over the read buffer. `Ok` carries
/// the span of the line without its terminator; the span stays valid until
/// the connection is reset because the buffer is never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    Ok(Range<usize>),
    Bad,
    Open,
}

/// Outcome of driving the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// More bytes are needed; cursors stay put for the next read.
    Incomplete,
    /// Structurally complete request, resolution not yet attempted.
    Complete,
    BadRequest,
    NoResource,
    Forbidden,
    /// Resolution succeeded; the file is mapped and ready to send.
    FileRequest,
    InternalError,
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_BODY: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_BODY: &str =
    "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_BODY: &str =
    "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_BODY: &str =
    "There was an unusual problem serving the requested file.\n";

/// Body used for zero-length files, which are never mapped.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";
