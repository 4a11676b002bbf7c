//! Firehose message decoding.
//!
//! Frames arrive as JSON objects shaped like Jetstream events:
//!
//! ```json
//! {"did": "did:plc:abc", "time_us": 1725911162329308, "kind": "commit",
//!  "commit": {"rev": "3l3q", "operation": "create",
//!             "collection": "social.brewline.brew", "rkey": "3l3qo2",
//!             "record": {"createdAt": "..."}, "cid": "bafyrei..."}}
//! ```
//!
//! Descriptive field names (`actorId`, `eventTimeUs`, `recordType`,
//! `recordKey`, `payload`, `contentHash`, `revision`) are accepted as aliases.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::ingest::RecordMutation;
use crate::records::{IndexedRecord, RecordType};

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(alias = "actorId")]
    did: String,
    #[serde(alias = "eventTimeUs")]
    time_us: i64,
    kind: String,
    #[serde(default)]
    commit: Option<WireCommit>,
}

#[derive(Debug, Deserialize)]
struct WireCommit {
    #[serde(default, alias = "revision")]
    rev: Option<String>,
    operation: String,
    #[serde(alias = "recordType")]
    collection: String,
    #[serde(alias = "recordKey")]
    rkey: String,
    #[serde(default, alias = "payload")]
    record: Option<Value>,
    #[serde(default, alias = "contentHash")]
    cid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    /// Any kind this index does not know; advances the cursor only.
    Other,
}

impl EventKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "commit" => Self::Commit,
            "identity" => Self::Identity,
            "account" => Self::Account,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

impl CommitOperation {
    fn parse(operation: &str) -> Result<Self, DecodeError> {
        match operation {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(DecodeError::UnknownOperation(other.to_string())),
        }
    }
}

/// A repository write carried by a commit event.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub revision: Option<String>,
    pub operation: CommitOperation,
    /// Collection NSID as sent; may be outside the known set.
    pub collection: String,
    pub record_key: String,
    pub payload: Option<Value>,
    pub content_hash: Option<String>,
}

/// One decoded firehose event.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub actor_id: String,
    pub time_us: i64,
    pub kind: EventKind,
    pub commit: Option<CommitInfo>,
}

impl StreamEvent {
    /// Known record type of the commit, if this is a commit for one.
    #[must_use]
    pub fn record_type(&self) -> Option<RecordType> {
        self.commit
            .as_ref()
            .and_then(|commit| RecordType::from_nsid(&commit.collection))
    }

    /// Turn the event into an index mutation.
    ///
    /// `Ok(None)` for non-commit events and for record types outside
    /// `relevant`. `indexed_at` stamps the record's local arrival time.
    pub fn into_mutation(
        self,
        relevant: &HashSet<RecordType>,
        indexed_at: i64,
    ) -> Result<Option<RecordMutation>, DecodeError> {
        let Some(record_type) = self.record_type().filter(|t| relevant.contains(t)) else {
            return Ok(None);
        };
        let Some(commit) = self.commit else {
            return Ok(None);
        };

        match commit.operation {
            CommitOperation::Create | CommitOperation::Update => {
                let payload = commit
                    .payload
                    .filter(Value::is_object)
                    .ok_or(DecodeError::MissingField("record"))?;
                Ok(Some(RecordMutation::Upsert(IndexedRecord::new(
                    self.actor_id,
                    record_type,
                    commit.record_key,
                    payload,
                    commit.content_hash,
                    indexed_at,
                ))))
            }
            CommitOperation::Delete => Ok(Some(RecordMutation::Delete {
                actor_id: self.actor_id,
                record_type,
                record_key: commit.record_key,
            })),
        }
    }
}

/// Decode one (already inflated) frame.
pub fn decode_event(bytes: &[u8]) -> Result<StreamEvent, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let wire: WireEvent = serde_json::from_str(text)?;

    if wire.did.is_empty() {
        return Err(DecodeError::MissingField("did"));
    }
    let kind = EventKind::parse(&wire.kind);

    let commit = match (kind, wire.commit) {
        (EventKind::Commit, None) => return Err(DecodeError::MissingField("commit")),
        (EventKind::Commit, Some(commit)) => {
            if commit.collection.is_empty() {
                return Err(DecodeError::MissingField("collection"));
            }
            if commit.rkey.is_empty() {
                return Err(DecodeError::MissingField("rkey"));
            }
            Some(CommitInfo {
                revision: commit.rev,
                operation: CommitOperation::parse(&commit.operation)?,
                collection: commit.collection,
                record_key: commit.rkey,
                payload: commit.record,
                content_hash: commit.cid,
            })
        }
        (_, _) => None,
    };

    Ok(StreamEvent {
        actor_id: wire.did,
        time_us: wire.time_us,
        kind,
        commit,
    })
}
