//! The single apply path shared by live events and backfill.
//!
//! A mutation writes or removes one record and keeps every aggregate derived
//! from it in step. Applying the same mutation twice leaves the index as it
//! was after the first application.

use rusqlite::Connection;
use serde::Serialize;
use tracing::warn;

use crate::aggregation;
use crate::error::{Error, Result};
use crate::records::{AtUri, IndexedRecord, RecordType};
use crate::storage::{self, IndexStore};

/// A change to apply to the index.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordMutation {
    Upsert(IndexedRecord),
    Delete {
        actor_id: String,
        record_type: RecordType,
        record_key: String,
    },
}

impl RecordMutation {
    #[must_use]
    pub fn actor_id(&self) -> &str {
        match self {
            Self::Upsert(record) => &record.actor_id,
            Self::Delete { actor_id, .. } => actor_id,
        }
    }
}

/// What a mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Same content already indexed (a replay).
    Unchanged,
    Deleted,
    /// Delete for a record that was never indexed.
    Missing,
}

/// Tally of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub missing: u64,
    pub failed: u64,
}

impl BatchSummary {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Missing => self.missing += 1,
        }
    }

    #[must_use]
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated + self.unchanged + self.deleted + self.missing
    }
}

/// Apply one mutation on a connection that is already inside a transaction.
pub(crate) fn apply_mutation(conn: &Connection, mutation: &RecordMutation) -> Result<ApplyOutcome> {
    match mutation {
        RecordMutation::Upsert(record) => {
            let previous = storage::get_record(conn, &record.uri)?;
            match previous {
                Some(prev)
                    if prev.content_hash == record.content_hash
                        && prev.created_at == record.created_at =>
                {
                    storage::register_actor(conn, &record.actor_id, record.indexed_at)?;
                    Ok(ApplyOutcome::Unchanged)
                }
                Some(_) => {
                    aggregation::on_removed(
                        conn,
                        &record.actor_id,
                        record.record_type,
                        &record.record_key,
                    )?;
                    storage::upsert_record(conn, record)?;
                    aggregation::on_written(conn, record)?;
                    Ok(ApplyOutcome::Updated)
                }
                None => {
                    storage::upsert_record(conn, record)?;
                    aggregation::on_written(conn, record)?;
                    Ok(ApplyOutcome::Inserted)
                }
            }
        }
        RecordMutation::Delete {
            actor_id,
            record_type,
            record_key,
        } => {
            let uri = AtUri::for_record(actor_id, *record_type, record_key).to_string();
            let removed = storage::delete_record(conn, &uri)?;
            // Edges and nodes are keyed by (actor, key), so this also clears
            // anything left behind by an earlier partial state
            aggregation::on_removed(conn, actor_id, *record_type, record_key)?;
            Ok(if removed.is_some() {
                ApplyOutcome::Deleted
            } else {
                ApplyOutcome::Missing
            })
        }
    }
}

/// Apply a batch in one transaction. A mutation that fails is rolled back on
/// its own and counted; the rest of the batch still commits.
pub(crate) fn apply_batch(conn: &Connection, mutations: &[RecordMutation]) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();
    for mutation in mutations {
        conn.execute_batch("SAVEPOINT apply_one")?;
        match apply_mutation(conn, mutation) {
            Ok(outcome) => {
                conn.execute_batch("RELEASE apply_one")?;
                summary.record(outcome);
            }
            Err(err) => {
                conn.execute_batch("ROLLBACK TO apply_one; RELEASE apply_one")?;
                warn!(actor = mutation.actor_id(), error = %err, "mutation failed, skipped");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

impl IndexStore {
    /// Apply one mutation atomically.
    pub fn apply(&self, mutation: &RecordMutation) -> Result<ApplyOutcome> {
        self.write(|conn| apply_mutation(conn, mutation))
    }

    /// Apply many mutations in a single transaction.
    pub fn apply_all(&self, mutations: &[RecordMutation]) -> Result<BatchSummary> {
        self.write(|conn| apply_batch(conn, mutations))
    }

    /// Remove the record at `uri` together with everything derived from it.
    pub fn remove(&self, uri: &str) -> Result<ApplyOutcome> {
        let parsed = AtUri::parse(uri)?;
        let record_type = parsed
            .record_type()
            .ok_or_else(|| Error::InvalidUri(format!("unknown record type in {uri}")))?;
        self.apply(&RecordMutation::Delete {
            actor_id: parsed.actor,
            record_type,
            record_key: parsed.record_key,
        })
    }
}
