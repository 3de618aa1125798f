//! Error types for the handoff protocol.

use thiserror::Error;

/// Errors raised on either side of a handoff.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The connection cannot expose an OS descriptor to pass along.
    #[error("connection has no transferable socket")]
    BadSocket,

    /// The channel (or backend listener) has been closed.
    #[error("handoff channel closed")]
    Closed,

    /// A handoff message carried the wrong number of descriptors.
    #[error("invalid number of file descriptors: {0}")]
    InvalidDescriptorCount(usize),

    /// A handoff announced a prefix longer than the proxy may ever send.
    #[error("invalid prefix length: {0}")]
    InvalidLength(usize),

    /// An inherited socket variable did not hold a descriptor number.
    #[error("invalid inherited socket {var}={value:?}")]
    InvalidInheritedSocket { var: &'static str, value: String },

    /// No inherited channel was found in the environment.
    #[error("no sockets setup")]
    NoSocket,

    /// The backend server is already serving.
    #[error("already running")]
    Running,

    /// The backend server was never started.
    #[error("not running")]
    NotRunning,

    /// The backend server has been closed.
    #[error("stopped")]
    Stopped,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),
}
