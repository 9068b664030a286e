use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, GraphError>;

/// Error taxonomy for the whole engine.
///
/// Storage-layer variants (`AlreadyInUse`, `InTrans`, `NilData`, ...) are
/// returned to the direct caller and never cross the graph-manager boundary
/// raw; the graph layer wraps them into [`GraphError::StorageComponent`].
/// Graph and query variants render with the `GraphError:` prefix expected by
/// the HTTP collaborators.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("unexpected end of transaction log")]
    UnexpectedEof,
    #[error("record {0} is already in use")]
    AlreadyInUse(u64),
    #[error("records are still in use")]
    RecordInUse,
    #[error("record {0} is not in use")]
    NotInUse(u64),
    #[error("record {0} is still part of an open transaction")]
    InTrans(u64),
    #[error("record {0} has no backing data buffer")]
    NilData(u64),
    #[error("transactions are disabled for this store")]
    TransDisabled,
    #[error("slot of {0} bytes exceeds the storage manager capacity")]
    SlotTooLarge(usize),
    #[error("slot {0:#x} is empty")]
    SlotEmpty(u64),
    #[error("GraphError: Write operation on a read-only graph")]
    ReadOnly,
    #[error("GraphError: Invalid data ({0})")]
    InvalidData(String),
    #[error("GraphError: Could not {action} graph storage component ({detail})")]
    StorageComponent {
        action: &'static str,
        detail: String,
    },
    #[error("GraphError: Invalid construct in line {line}, column {column} ({detail})")]
    QuerySyntax {
        detail: String,
        line: u32,
        column: u32,
    },
    #[error("GraphError: Runtime error in line {line}, column {column} ({detail})")]
    QueryRuntime {
        detail: String,
        line: u32,
        column: u32,
    },
}

impl GraphError {
    /// Wraps a lower-layer failure as a storage-component access error.
    pub(crate) fn storage(action: &'static str, err: GraphError) -> GraphError {
        match err {
            e @ (GraphError::InvalidData(_)
            | GraphError::ReadOnly
            | GraphError::StorageComponent { .. }) => e,
            other => GraphError::StorageComponent {
                action,
                detail: other.to_string(),
            },
        }
    }
}

pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("engine lock poisoned - fatal error");
        GraphError::Corruption("engine lock poisoned - fatal error".into())
    })
}
