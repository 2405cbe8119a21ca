use thiserror::Error;

use crate::pipe::registry::BackendCategory;

/// Failure reported through pipe and listener operations. It is `Clone` because a single
///  failure of a pipe is handed to every operation that is pending on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent something that does not follow the handshake or message protocol. This
    ///  usually indicates a version mismatch rather than network trouble.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Both peers are well-behaved, but their capabilities do not overlap
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no pending connection request with id {0}")]
    UnknownConnectionRequest(u64),

    /// The resource was closed intentionally
    #[error("closed")]
    Closed,

    #[error("no channel was negotiated for domain {0}")]
    DomainNotNegotiated(String),

    #[error("channel error: {0}")]
    Channel(String),

    /// The write was rejected, the pipe is still usable
    #[error("a buffer of {length} bytes exceeds the maximum of {max} bytes for domain {domain}")]
    BufferTooLarge {
        domain: String,
        length: usize,
        max: usize,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("no {category} backend named {name}")]
    NotFound {
        category: BackendCategory,
        name: String,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Handshake,
    Registry,
    Closed,
    DomainNotNegotiated,
    Channel,
    BufferTooLarge,
    Timeout,
    NotFound,
    InvalidUrl,
}

impl PipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipeError::Transport(_) => ErrorKind::Transport,
            PipeError::Protocol(_) => ErrorKind::Protocol,
            PipeError::Handshake(_) => ErrorKind::Handshake,
            PipeError::UnknownConnectionRequest(_) => ErrorKind::Registry,
            PipeError::Closed => ErrorKind::Closed,
            PipeError::DomainNotNegotiated(_) => ErrorKind::DomainNotNegotiated,
            PipeError::Channel(_) => ErrorKind::Channel,
            PipeError::BufferTooLarge { .. } => ErrorKind::BufferTooLarge,
            PipeError::Timeout(_) => ErrorKind::Timeout,
            PipeError::NotFound { .. } => ErrorKind::NotFound,
            PipeError::InvalidUrl(_) => ErrorKind::InvalidUrl,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }

    pub(crate) fn transport(e: anyhow::Error) -> PipeError {
        PipeError::Transport(format!("{:#}", e))
    }

    pub(crate) fn protocol(e: anyhow::Error) -> PipeError {
        PipeError::Protocol(format!("{:#}", e))
    }

    pub(crate) fn channel(e: anyhow::Error) -> PipeError {
        PipeError::Channel(format!("{:#}", e))
    }
}

pub type PipeResult<T> = Result<T, PipeError>;
