//! The local record store collaborator and sync status notifications.
//!
//! The engine does not own application data; it asks a [`LocalStore`] for
//! pending (dirty or deleted) records before a push and hands it records
//! arriving from the server. The store's `status` sink receives a
//! [`SyncStatus`] at every phase transition so a host application can
//! render sync progress.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::SyncError;
use crate::record::{ObjectError, SyncRecord};

/// One sync phase transition, stamped when it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub kind: StatusKind,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl SyncStatus {
    /// Stamps a status event with the current time.
    pub fn now(kind: StatusKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// What happened during the sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    /// Remote updates were fetched and applied
    SyncGet,
    /// A push of local records is starting
    SyncPut { count: usize },
    /// The push was accepted
    SyncPutComplete,
    /// The push was rejected; missed updates are being replayed
    SyncPutPreconditionFailed,
    /// All local sync state was cleared
    Reset,
    /// The remote collection was deliberately deleted
    DeleteCollection,
    /// A phase aborted
    Error { phase: &'static str, detail: String },
}

/// The application-data side of a sync session.
///
/// `objects_received` and `objects_saved` are called with records in
/// server order; implementations are expected to apply them atomically
/// enough that a later crash re-syncs rather than corrupts.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Returns every record with unsynced local changes, deletions
    /// included as tombstones.
    async fn get_pending_objects(&self) -> Result<Vec<SyncRecord>, SyncError>;

    /// Marks the given records as accepted by the server.
    async fn objects_saved(&self, records: Vec<SyncRecord>) -> Result<(), SyncError>;

    /// Applies records that arrived from the server.
    async fn objects_received(&self, records: Vec<SyncRecord>) -> Result<(), SyncError>;

    /// Marks every known record as pending again, so the next push
    /// re-sends the full local state.
    async fn reset_saved(&self) -> Result<(), SyncError>;

    /// Receives validation failures for records the store supplied.
    async fn report_object_errors(&self, _errors: Vec<ObjectError>) {}

    /// Receives a status event at each phase transition.
    fn status(&self, _status: SyncStatus) {}
}
