//! Sync error types.

use crate::record::ObjectError;

/// Errors that can occur while syncing with the remote collection.
#[derive(Debug)]
pub enum SyncError {
    /// Persisted sync state has not finished loading yet
    NotLoaded,
    /// The authentication provider reports no active login
    NotLoggedIn,
    /// The request never produced a response (connection refused, timeout)
    RequestFailed(String),
    /// The server answered with a non-200 status
    TransportError { code: u16, detail: String },
    /// The response body was not valid JSON of the expected shape
    InvalidBody(String),
    /// The remote collection has been deleted
    CollectionDeleted,
    /// The remote collection was recreated under a new identity
    CollectionChanged,
    /// Repeated push attempts kept failing their `since` precondition
    ConflictNotResolved { attempts: usize },
    /// Outgoing records failed validation; nothing was sent
    InvalidObjects(Vec<ObjectError>),
    /// The push response carried no position markers
    NoObjectCounters,
    /// Metadata store failure
    Storage(String),
    /// Local record store failure
    LocalData(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotLoaded => {
                write!(f, "Sync state has not been loaded from the metadata store yet")
            }
            SyncError::NotLoggedIn => write!(f, "Not logged in"),
            SyncError::RequestFailed(e) => write!(f, "Request failed: {}", e),
            SyncError::TransportError { code, detail } => {
                write!(f, "Non-200 response code {}: {}", code, detail)
            }
            SyncError::InvalidBody(e) => write!(f, "Invalid response body: {}", e),
            SyncError::CollectionDeleted => write!(f, "The remote collection has been deleted"),
            SyncError::CollectionChanged => {
                write!(f, "The remote collection id changed; local sync state was reset")
            }
            SyncError::ConflictNotResolved { attempts } => {
                write!(f, "Push precondition kept failing after {} attempts", attempts)
            }
            SyncError::InvalidObjects(errors) => {
                write!(f, "{} outgoing record(s) failed validation", errors.len())
            }
            SyncError::NoObjectCounters => {
                write!(f, "No object_counters received from server")
            }
            SyncError::Storage(e) => write!(f, "Metadata storage error: {}", e),
            SyncError::LocalData(e) => write!(f, "Local record store error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}
