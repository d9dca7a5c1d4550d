use std::{io, net::SocketAddr};

/// Failures that can occur while standing up a worker's listening sockets.
///
/// Per-connection I/O failures are not modeled here: those are folded into
/// [`crate::client::ConnState`]/[`crate::backend::ConnState`] by the frame
/// engines, matching how the rest of this stack treats recoverable
/// connection-level hiccups as plain state rather than `Err`.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to set socket option {name}: {source}")]
    SetOpt { name: &'static str, #[source] source: io::Error },

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, #[source] source: io::Error },

    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),

    #[error("only IPv4 addresses are supported, got {0}")]
    UnsupportedFamily(SocketAddr),

    #[error("failed to register with poll: {0}")]
    Register(#[source] io::Error),
}

/// Fatal errors that terminate a single worker.
///
/// A worker is its own failure domain: a `WorkerError` unwinds that worker's
/// thread but is caught and logged by the bootstrap loop, which leaves the
/// remaining workers running.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("poll wait failed: {0}")]
    PollWait(#[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}
