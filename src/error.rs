//! Crate-wide error type for the fatal startup paths.
//!
//! Everything past startup (admission refusal, transient I/O, a single session's fatal I/O) is
//! handled as engine-internal control flow and never surfaces as a `Result` here — one session's
//! failure must never unwind or abort the process.

use std::net::SocketAddrV4;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("plugin directory {0:?} not found")]
    PluginDirMissing(PathBuf),

    #[error("failed to create poll instance: {0}")]
    Poll(#[source] std::io::Error),

    #[error("failed to bind listening socket on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register listening socket with the event loop: {0}")]
    Register(#[source] std::io::Error),
}
