//! Wire types for the collection sync protocol.
//!
//! A pull (`GET ?since=N`) answers with a [`Delta`]; a push
//! (`POST ?since=N`) answers with a [`PushResponse`]. When a push fails
//! its `since` precondition the response embeds the missed delta, which
//! is why [`PushResponse`] carries the same `objects`/`incomplete`/`until`
//! fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::SyncRecord;

/// A batch of remote changes at positions after the requested cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Identity of the current collection incarnation
    pub collection_id: Option<String>,
    /// `(position, record)` pairs in remote arrival order
    #[serde(default)]
    pub objects: Vec<(u64, SyncRecord)>,
    /// More records exist beyond this batch
    #[serde(default)]
    pub incomplete: bool,
    /// Explicit upper bound covered by this batch, when the server sends one
    pub until: Option<u64>,
}

impl Delta {
    /// The cursor position this delta advances to: the explicit `until`
    /// bound if present, else the position of the last delivered record.
    pub fn upper_bound(&self) -> Option<u64> {
        self.until
            .or_else(|| self.objects.last().map(|(position, _)| *position))
    }
}

/// Server-side location of a blob uploaded in a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    pub id: String,
    pub href: String,
}

/// Response to a push of local records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushResponse {
    pub collection_id: Option<String>,
    /// Positions assigned to the accepted records, in batch order
    #[serde(default)]
    pub object_counters: Vec<u64>,
    /// Locations of blobs the server stored out of band
    #[serde(default)]
    pub blobs: Vec<BlobRef>,
    /// The push was rejected because remote data arrived after `since`
    #[serde(default)]
    pub since_invalid: bool,
    #[serde(default)]
    pub objects: Vec<(u64, SyncRecord)>,
    #[serde(default)]
    pub incomplete: bool,
    pub until: Option<u64>,
}

impl PushResponse {
    /// The delta embedded in a `since_invalid` rejection.
    pub fn embedded_delta(&self) -> Delta {
        Delta {
            collection_id: self.collection_id.clone(),
            objects: self.objects.clone(),
            incomplete: self.incomplete,
            until: self.until,
        }
    }
}

/// Reason attached to a deliberate collection deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReason {
    pub reason: String,
    pub client_id: String,
}

impl DeleteReason {
    /// Builds a reason with a freshly generated client id.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_parses_position_record_pairs() {
        let delta: Delta = serde_json::from_str(
            "{\"collection_id\":\"X\",\"objects\":[[1,{\"id\":\"aaa\",\"data\":1}],[2,{\"id\":\"bbb\",\"deleted\":true}]]}",
        )
        .unwrap();
        assert_eq!(delta.collection_id.as_deref(), Some("X"));
        assert_eq!(delta.objects.len(), 2);
        assert_eq!(delta.objects[0].0, 1);
        assert_eq!(delta.objects[0].1.id, "aaa");
        assert!(delta.objects[1].1.is_deleted());
        assert!(!delta.incomplete);
        assert_eq!(delta.until, None);
    }

    #[test]
    fn test_delta_upper_bound_prefers_until() {
        let delta: Delta = serde_json::from_str(
            "{\"objects\":[[3,{\"id\":\"aaa\"}]],\"incomplete\":true,\"until\":7}",
        )
        .unwrap();
        assert!(delta.incomplete);
        assert_eq!(delta.upper_bound(), Some(7));
    }

    #[test]
    fn test_delta_upper_bound_falls_back_to_last_position() {
        let delta: Delta =
            serde_json::from_str("{\"objects\":[[3,{\"id\":\"aaa\"}],[9,{\"id\":\"bbb\"}]]}")
                .unwrap();
        assert_eq!(delta.upper_bound(), Some(9));
    }

    #[test]
    fn test_empty_delta_has_no_upper_bound() {
        let delta: Delta = serde_json::from_str("{\"collection_id\":\"X\"}").unwrap();
        assert_eq!(delta.upper_bound(), None);
    }

    #[test]
    fn test_push_response_with_counters_and_blobs() {
        let response: PushResponse = serde_json::from_str(
            "{\"collection_id\":\"X\",\"object_counters\":[4,5],\"blobs\":[{\"id\":\"aaa\",\"href\":\"/blobs/aaa\"}]}",
        )
        .unwrap();
        assert_eq!(response.object_counters, vec![4, 5]);
        assert_eq!(response.blobs[0].href, "/blobs/aaa");
        assert!(!response.since_invalid);
    }

    #[test]
    fn test_push_response_embedded_delta() {
        let response: PushResponse = serde_json::from_str(
            "{\"collection_id\":\"X\",\"since_invalid\":true,\"objects\":[[6,{\"id\":\"ccc\"}]]}",
        )
        .unwrap();
        assert!(response.since_invalid);
        let delta = response.embedded_delta();
        assert_eq!(delta.collection_id.as_deref(), Some("X"));
        assert_eq!(delta.upper_bound(), Some(6));
    }

    #[test]
    fn test_delete_reason_carries_client_id() {
        let reason = DeleteReason::new("user requested");
        assert_eq!(reason.reason, "user requested");
        assert!(!reason.client_id.is_empty());
    }
}
