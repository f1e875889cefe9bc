// src/config.rs
use std::path::PathBuf;

use clap::Parser;

/// Read buffer capacity per connection. A request that does not fit is
/// left pending until the connection is torn down.
pub const READ_BUFFER_SIZE: usize = 2048;

/// Write buffer capacity per connection (headers and fixed bodies only;
/// file bodies are served from the mapping).
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Maximum length of a resolved filesystem path.
pub const MAX_PATH_LEN: usize = 200;

/// Size of the fd-indexed connection table; connections past this are
/// accepted and immediately closed.
pub const MAX_CONNECTIONS: usize = 65536;

/// Maximum events consumed per epoll_wait call.
pub const MAX_EVENTS: usize = 10000;

/// Server configuration from CLI arguments and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "petrel")]
#[command(about = "Edge-triggered static-file HTTP server")]
#[command(version)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "PETREL_PORT")]
    pub port: u16,

    /// IPv4 address to bind
    #[arg(long, default_value = "0.0.0.0", env = "PETREL_HOST")]
    pub host: String,

    /// Document root served to clients
    #[arg(long, default_value = "./public", env = "PETREL_DOC_ROOT")]
    pub doc_root: PathBuf,

    /// Worker threads processing requests off the reactor
    #[arg(long, default_value_t = num_cpus::get(), env = "PETREL_WORKERS")]
    pub workers: usize,

    /// Queued requests before submissions are rejected
    #[arg(long, default_value_t = 10_000, env = "PETREL_QUEUE_DEPTH")]
    pub queue_depth: usize,
}
