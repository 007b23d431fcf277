pub mod event;
pub mod value;

pub use event::{EventBuffer, EventCandidate, EventRecord};
pub use value::{ValueBuffer, ValueBufferPayload};

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the value and event buffers.
#[derive(Debug, Error)]
pub enum BufferError {
    /// `add_data_point` was called for an id that is already registered.
    #[error("data point {0:?} is already registered")]
    AlreadyRegistered(String),

    /// `remove_data_point` was called for an id that is not registered.
    #[error("data point {0:?} is not registered")]
    NotRegistered(String),

    /// The candidate window length does not match the buffer size.
    #[error("candidate window holds {got} entries, buffer size is {expected}")]
    InvalidWindowLength { expected: usize, got: usize },

    /// The backing row store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reading event snapshot {path}: {source}")]
    SnapshotRead {
        path: String,
        source: std::io::Error,
    },

    #[error("writing event snapshot {path}: {source}")]
    SnapshotWrite {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing event snapshot {path}: {source}")]
    SnapshotParse {
        path: String,
        source: serde_json::Error,
    },
}
