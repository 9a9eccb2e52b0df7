use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::NodeId;

pub type Result<T, E = SortError> = std::result::Result<T, E>;

/// Everything that can abort a node's run.
#[derive(Debug, Error)]
pub enum SortError {
    /// Bad topology, bad address, or the bootstrap budget ran out.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed record: declared length {0} is shorter than the 10-byte key")]
    MalformedRecord(u32),

    #[error("truncated stream: needed {expected} bytes but only {found} were available")]
    TruncatedStream { expected: usize, found: usize },

    #[error("failed to connect to node {node} at {addr}: {source}")]
    Connect {
        node: NodeId,
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to send batch {seq} to node {node}: {status}")]
    Transport {
        node: NodeId,
        seq: u64,
        status: Box<tonic::Status>,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A peer sent something the batch protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(#[from] tonic::transport::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<SortError> for tonic::Status {
    fn from(err: SortError) -> Self {
        match err {
            SortError::Protocol(msg) => tonic::Status::failed_precondition(msg),
            SortError::MalformedRecord(_) | SortError::TruncatedStream { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
