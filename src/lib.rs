// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod pool;
pub mod server;
pub mod sync;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use error::{PetrelError, PetrelResult};
pub use server::Server;
