//! Sync records and outgoing-batch validation.
//!
//! A [`SyncRecord`] is the unit of data exchanged with the remote
//! collection. Records are identified by `(type, id)`; a record may carry
//! inline JSON `data`, an attached [`Blob`], or a `deleted` tombstone, but
//! never a tombstone together with a payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identity key of a record within a collection: `(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub record_type: Option<String>,
    pub id: String,
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.record_type {
            Some(t) => write!(f, "{}/{}", t, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Binary attachment carried by a record, either inline or by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Blob {
    pub content_type: String,
    /// Base64-encoded content, for blobs sent inline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Server-side location, for blobs already uploaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// A single application record as exchanged with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncRecord {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    pub id: String,
    /// Tombstone marker; may only ever be `true`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<Blob>,
}

impl SyncRecord {
    /// Returns the `(type, id)` identity key of this record.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            record_type: self.record_type.clone(),
            id: self.id.clone(),
        }
    }

    /// Returns true if this record is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted == Some(true)
    }
}

/// A validation failure for one record in an outgoing batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record has no id")]
    MissingId,
    #[error("deleted may only be set to true")]
    DeletedFlag,
    #[error("a deleted record cannot contain data")]
    DeletedWithData,
    #[error("a deleted record cannot contain a blob")]
    DeletedWithBlob,
    #[error("blob has no content_type")]
    MissingContentType,
    #[error("blob must carry exactly one of data or href")]
    BlobPayload,
    #[error("duplicate record for {0}")]
    DuplicateKey(String),
}

/// A record paired with the reason it was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectError {
    pub object: SyncRecord,
    pub error: RecordError,
}

/// Validates an outgoing batch, collecting every violation.
///
/// Checks each record against the model invariants and rejects batches
/// containing two records with the same `(type, id)` key. Returns all
/// errors found so the application can report them in one pass.
pub fn validate_batch(records: &[SyncRecord]) -> Result<(), Vec<ObjectError>> {
    let mut errors = Vec::new();
    let mut seen: HashMap<RecordKey, ()> = HashMap::new();
    for record in records {
        if record.id.is_empty() {
            errors.push(ObjectError {
                object: record.clone(),
                error: RecordError::MissingId,
            });
        }
        if let Some(flag) = record.deleted {
            if !flag {
                errors.push(ObjectError {
                    object: record.clone(),
                    error: RecordError::DeletedFlag,
                });
            }
        }
        if record.is_deleted() {
            if record.data.is_some() {
                errors.push(ObjectError {
                    object: record.clone(),
                    error: RecordError::DeletedWithData,
                });
            }
            if record.blob.is_some() {
                errors.push(ObjectError {
                    object: record.clone(),
                    error: RecordError::DeletedWithBlob,
                });
            }
        }
        if let Some(blob) = &record.blob {
            if blob.content_type.is_empty() {
                errors.push(ObjectError {
                    object: record.clone(),
                    error: RecordError::MissingContentType,
                });
            }
            if blob.data.is_some() == blob.href.is_some() {
                errors.push(ObjectError {
                    object: record.clone(),
                    error: RecordError::BlobPayload,
                });
            }
        }
        let key = record.key();
        if seen.insert(key.clone(), ()).is_some() {
            errors.push(ObjectError {
                object: record.clone(),
                error: RecordError::DuplicateKey(key.to_string()),
            });
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Deduplicates a fetched batch by `(type, id)`, keeping the last
/// occurrence of each key in arrival order.
///
/// The server appends to a log, so a later entry for the same key
/// supersedes an earlier one within the same batch.
pub fn dedup_keep_last(objects: Vec<(u64, SyncRecord)>) -> Vec<(u64, SyncRecord)> {
    let mut last_index: HashMap<RecordKey, usize> = HashMap::new();
    for (index, (_, record)) in objects.iter().enumerate() {
        last_index.insert(record.key(), index);
    }
    objects
        .into_iter()
        .enumerate()
        .filter(|(index, (_, record))| last_index[&record.key()] == *index)
        .map(|(_, entry)| entry)
        .collect()
}
