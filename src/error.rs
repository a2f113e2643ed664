use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access key file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("key file {path:?} is corrupt: {reason}")]
    CorruptKey { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("namespace mismatch: expected {expected:?}, got {actual:?}")]
    NamespaceMismatch { expected: String, actual: String },
    #[error("state file {path:?} is corrupt: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error("failed to access state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid record for {hostname:?}: {reason}")]
    InvalidRecord { hostname: String, reason: String },
    #[error("sync request came from this node itself")]
    SelfSync,
    #[error("state write task failed: {0}")]
    WriteTask(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
#[error("failed to export directory to {path:?}: {source}")]
pub struct ExportError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer {0} is unreachable: {1}")]
    PeerUnreachable(String, String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("peer {peer} rejected namespace {namespace:?}")]
    NamespaceMismatch { peer: String, namespace: String },
    #[error("peer {0} is this node under another address")]
    SelfPeer(String),
    #[error("protocol error talking to {0}: {1}")]
    Protocol(String, String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
