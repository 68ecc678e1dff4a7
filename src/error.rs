use thiserror::Error;

/// Errors surfaced by connection, queue, and RPC operations.
///
/// Transport-level faults (a lost connection, a rejected declaration) are
/// recovered inside the connection state machine and are generally *not*
/// returned from these variants; what reaches a caller is either misuse
/// (unknown connection name, correlation id reuse) or the failure of an
/// operation the caller explicitly awaited (an RPC reply, a teardown).
#[derive(Error, Debug)]
pub enum Error {
    /// Registry lookup failed: no connection registered under that name.
    #[error("there is no connection named \"{0}\"")]
    ConnectionNotFound(String),

    /// A connection with the same name is already registered.
    #[error("a connection named \"{0}\" is already registered")]
    DuplicateConnection(String),

    /// The operation needed a live broker connection and none exists.
    #[error("connection is not established")]
    NotConnected,

    /// RPC call timed out waiting for a reply.
    #[error("rpc call timed out waiting for a reply")]
    RpcTimeout,

    /// The supplied correlation id belongs to a call still in flight.
    #[error("correlation id \"{0}\" is already in flight")]
    CorrelationInUse(String),

    /// Error reported by the underlying transport.
    ///
    /// Carried as a string so transport backends stay out of the public
    /// error type.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;
