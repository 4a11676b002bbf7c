//! Record model shared by every component.
//!
//! A record is identified by an AT-style resource identifier
//! `at://{actor}/{record type}/{record key}`. Only the fixed set of
//! [`RecordType`]s below is ever indexed.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const URI_SCHEME: &str = "at://";

/// The record types this index understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Roaster,
    Bean,
    Grinder,
    Brewer,
    Brew,
    Like,
    Comment,
}

impl RecordType {
    pub const ALL: [Self; 7] = [
        Self::Roaster,
        Self::Bean,
        Self::Grinder,
        Self::Brewer,
        Self::Brew,
        Self::Like,
        Self::Comment,
    ];

    /// Namespaced identifier used on the wire and in resource identifiers.
    #[must_use]
    pub const fn nsid(self) -> &'static str {
        match self {
            Self::Roaster => "social.brewline.roaster",
            Self::Bean => "social.brewline.bean",
            Self::Grinder => "social.brewline.grinder",
            Self::Brewer => "social.brewline.brewer",
            Self::Brew => "social.brewline.brew",
            Self::Like => "social.brewline.like",
            Self::Comment => "social.brewline.comment",
        }
    }

    /// Short name accepted by filters and the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Roaster => "roaster",
            Self::Bean => "bean",
            Self::Grinder => "grinder",
            Self::Brewer => "brewer",
            Self::Brew => "brew",
            Self::Like => "like",
            Self::Comment => "comment",
        }
    }

    #[must_use]
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.nsid() == nsid)
    }

    /// Likes and comments only feed aggregates; everything else shows up in feeds.
    #[must_use]
    pub const fn is_display_eligible(self) -> bool {
        !matches!(self, Self::Like | Self::Comment)
    }

    /// Payload fields holding references to other records, with the type
    /// each one is expected to point at.
    #[must_use]
    pub const fn reference_fields(self) -> &'static [(&'static str, RecordType)] {
        match self {
            Self::Bean => &[("roasterRef", Self::Roaster)],
            Self::Brew => &[
                ("beanRef", Self::Bean),
                ("grinderRef", Self::Grinder),
                ("brewerRef", Self::Brewer),
            ],
            Self::Roaster | Self::Grinder | Self::Brewer | Self::Like | Self::Comment => &[],
        }
    }

    /// Every display-eligible type.
    pub fn display_types() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(|t| t.is_display_eligible())
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nsid())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_nsid(s)
            .or_else(|| Self::ALL.into_iter().find(|t| t.as_str() == s))
            .ok_or_else(|| Error::InvalidUri(format!("unknown record type: {s}")))
    }
}

/// Parsed `at://actor/type/key` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub actor: String,
    pub collection: String,
    pub record_key: String,
}

impl AtUri {
    #[must_use]
    pub fn new(
        actor: impl Into<String>,
        collection: impl Into<String>,
        record_key: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            collection: collection.into(),
            record_key: record_key.into(),
        }
    }

    #[must_use]
    pub fn for_record(actor: &str, record_type: RecordType, record_key: &str) -> Self {
        Self::new(actor, record_type.nsid(), record_key)
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(actor), Some(collection), Some(key))
                if !actor.is_empty() && !collection.is_empty() && !key.is_empty() =>
            {
                Ok(Self::new(actor, collection, key))
            }
            _ => Err(Error::InvalidUri(uri.to_string())),
        }
    }

    /// Known record type of the collection segment, if any.
    #[must_use]
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_nsid(&self.collection)
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{URI_SCHEME}{}/{}/{}",
            self.actor, self.collection, self.record_key
        )
    }
}

/// Owning actor of a resource identifier (its authority component).
///
/// Cheaper than a full parse; used on the notification path.
#[must_use]
pub fn uri_owner(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix(URI_SCHEME)?;
    let owner = rest.split('/').next()?;
    (!owner.is_empty()).then_some(owner)
}

/// A record as held by the local index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub uri: String,
    pub actor_id: String,
    pub record_type: RecordType,
    pub record_key: String,
    pub payload: Value,
    pub content_hash: String,
    /// Local arrival time, microseconds since the epoch.
    pub indexed_at: i64,
    /// Authoritative creation time from the payload, microseconds since the epoch.
    pub created_at: i64,
}

impl IndexedRecord {
    /// Build a record from stream or backfill data.
    ///
    /// `created_at` comes from the payload's `createdAt`; records without a
    /// parseable timestamp sort by arrival time instead.
    #[must_use]
    pub fn new(
        actor_id: impl Into<String>,
        record_type: RecordType,
        record_key: impl Into<String>,
        payload: Value,
        content_hash: Option<String>,
        indexed_at: i64,
    ) -> Self {
        let actor_id = actor_id.into();
        let record_key = record_key.into();
        let uri = AtUri::for_record(&actor_id, record_type, &record_key).to_string();
        let created_at = payload_created_at(&payload).unwrap_or(indexed_at);
        let content_hash = content_hash.unwrap_or_else(|| content_hash_of(&payload));
        Self {
            uri,
            actor_id,
            record_type,
            record_key,
            payload,
            content_hash,
            indexed_at,
            created_at,
        }
    }

    /// URI stored in a reference field of this record's payload.
    #[must_use]
    pub fn reference(&self, field: &str) -> Option<&str> {
        reference_uri(&self.payload, field)
    }
}

/// Read a reference field that is either a bare URI or a `{ "uri": ... }` object.
#[must_use]
pub fn reference_uri<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    match payload.get(field)? {
        Value::String(uri) => Some(uri.as_str()),
        Value::Object(map) => map.get("uri").and_then(Value::as_str),
        _ => None,
    }
}

/// Parse the payload's `createdAt` into epoch microseconds.
#[must_use]
pub fn payload_created_at(payload: &Value) -> Option<i64> {
    payload
        .get("createdAt")
        .and_then(Value::as_str)
        .and_then(parse_timestamp_micros)
}

/// Parse an RFC 3339 timestamp into epoch microseconds.
#[must_use]
pub fn parse_timestamp_micros(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_micros())
}

/// Hex SHA-256 of the payload, used when the stream omits a content hash.
#[must_use]
pub fn content_hash_of(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("sha256:{}", hex::encode(digest))
}

/// Current wall-clock time in epoch microseconds.
#[must_use]
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uri_round_trips_through_display() {
        let uri = AtUri::parse("at://did:plc:abc/social.brewline.brew/3k2").unwrap();
        assert_eq!(uri.actor, "did:plc:abc");
        assert_eq!(uri.record_type(), Some(RecordType::Brew));
        assert_eq!(uri.to_string(), "at://did:plc:abc/social.brewline.brew/3k2");
    }

    #[test]
    fn malformed_uris_are_rejected() {
        for bad in ["", "https://x/y/z", "at://did:plc:abc", "at://did:plc:abc/coll/", "at:///a/b"] {
            assert!(AtUri::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn owner_is_the_authority_component() {
        assert_eq!(
            uri_owner("at://did:plc:owner/social.brewline.brew/1"),
            Some("did:plc:owner")
        );
        assert_eq!(uri_owner("did:plc:owner"), None);
    }

    #[test]
    fn record_type_parses_nsid_and_short_name() {
        assert_eq!("social.brewline.bean".parse::<RecordType>().unwrap(), RecordType::Bean);
        assert_eq!("grinder".parse::<RecordType>().unwrap(), RecordType::Grinder);
        assert!("app.bsky.feed.post".parse::<RecordType>().is_err());
        assert!(!RecordType::Like.is_display_eligible());
        assert_eq!(RecordType::display_types().count(), 5);
    }

    #[test]
    fn created_at_comes_from_payload() {
        let payload = json!({"createdAt": "2024-05-01T12:00:00.000Z"});
        let rec = IndexedRecord::new("did:plc:a", RecordType::Brew, "k1", payload, None, 7);
        assert_eq!(rec.created_at, 1_714_564_800_000_000);
        assert_eq!(rec.indexed_at, 7);
        assert!(rec.content_hash.starts_with("sha256:"));
    }

    #[test]
    fn missing_created_at_falls_back_to_arrival() {
        let rec = IndexedRecord::new(
            "did:plc:a",
            RecordType::Roaster,
            "k1",
            json!({"createdAt": "yesterday"}),
            Some("bafy".into()),
            42,
        );
        assert_eq!(rec.created_at, 42);
        assert_eq!(rec.content_hash, "bafy");
    }

    #[test]
    fn references_accept_strings_and_strong_refs() {
        let payload = json!({
            "beanRef": "at://did:plc:a/social.brewline.bean/1",
            "subject": {"uri": "at://did:plc:b/social.brewline.brew/2", "cid": "bafy"},
            "grinderRef": 12
        });
        assert_eq!(
            reference_uri(&payload, "beanRef"),
            Some("at://did:plc:a/social.brewline.bean/1")
        );
        assert_eq!(
            reference_uri(&payload, "subject"),
            Some("at://did:plc:b/social.brewline.brew/2")
        );
        assert_eq!(reference_uri(&payload, "grinderRef"), None);
        assert_eq!(reference_uri(&payload, "missing"), None);
    }
}
