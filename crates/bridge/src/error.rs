//! Error types for the bridge host.

use thiserror::Error;

/// Why a bridge session ended.
///
/// `Auth` is deliberately its own variant: the supervisor's retry loop
/// matches on it and stops retrying, instead of string-matching messages.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The hub rejected our credentials (close code 4001, or 401/403 during
    /// the upgrade). Retrying would never succeed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// WebSocket connect or transfer failure.
    #[error("websocket error: {0}")]
    Socket(String),

    /// The remote closed the socket.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Could not spawn or talk to the provider child.
    #[error("provider process error: {0}")]
    Child(String),

    /// The provider exited (stdout/stderr end-of-stream, or nonzero exit).
    #[error("provider exited: {0}")]
    ChildExited(String),

    /// Provider spec problems detected at launch time.
    #[error(transparent)]
    Config(#[from] tether_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The reconciler asked this bridge to stop.
    #[error("cancelled")]
    Cancelled,
}
