use meshlink_types::MemberId;
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// The closed set of failure modes this client can surface to a caller.
///
/// Mirrors the error taxonomy in §7 of the design: transport, protocol,
/// routing, timeout, lifecycle, and authentication failures each get their
/// own variant rather than a single opaque "it broke" error, so retry
/// policy (see `invocation::is_retryable`) can dispatch on the kind.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Wire(#[from] meshlink_wire::WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no connection available for target")]
    TargetDisconnected,

    #[error("client is offline: partition table not yet populated")]
    ClientOffline,

    #[error("operation timed out after {0:?}")]
    OperationTimeout(std::time::Duration),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("cluster rejected this client: {0}")]
    NotAllowedInCluster(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("partition count mismatch: expected {expected}, got {got}")]
    PartitionCountMismatch { expected: u32, got: u32 },

    #[error("unknown member {0}")]
    UnknownMember(MemberId),

    #[error("client is shutting down")]
    Shutdown,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::TargetDisconnected | ClientError::Io(_) | ClientError::ConnectionClosed
        )
    }
}
