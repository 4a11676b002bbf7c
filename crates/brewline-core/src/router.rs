//! Event routing: decoded frames to index mutations.
//!
//! The router is synchronous and runs on a blocking thread. It decodes a
//! batch of frames, applies every relevant mutation in one transaction and
//! hands actors that still need history to the backfill coordinator.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backfill::BackfillCoordinator;
use crate::error::Result;
use crate::events::decode_event;
use crate::ingest::{self, RecordMutation};
use crate::records::{RecordType, now_micros};
use crate::storage::{self, IndexStore};

/// Outcome of routing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Highest event time seen in the batch, including skipped events.
    pub max_time_us: Option<i64>,
    /// Frames decoded (relevant or not).
    pub events: u64,
    pub applied: u64,
    /// Valid events outside the relevant set.
    pub skipped: u64,
    /// Malformed frames plus mutations that failed to apply.
    pub failed: u64,
    /// Actors handed to backfill.
    pub backfill_triggered: Vec<String>,
}

#[derive(Debug, Default)]
struct RouterCounters {
    events: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Cumulative router counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub events: u64,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct EventRouter {
    store: Arc<IndexStore>,
    relevant: HashSet<RecordType>,
    backfill: Option<Arc<BackfillCoordinator>>,
    counters: RouterCounters,
}

impl EventRouter {
    #[must_use]
    pub fn new(store: Arc<IndexStore>, relevant: impl IntoIterator<Item = RecordType>) -> Self {
        Self {
            store,
            relevant: relevant.into_iter().collect(),
            backfill: None,
            counters: RouterCounters::default(),
        }
    }

    /// Trigger history fetches for actors that are not yet backfilled.
    #[must_use]
    pub fn with_backfill(mut self, coordinator: Arc<BackfillCoordinator>) -> Self {
        self.backfill = Some(coordinator);
        self
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events: self.counters.events.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Route a batch of raw frames.
    ///
    /// Malformed frames are logged and skipped. Only a storage failure of the
    /// batch transaction itself is returned as an error.
    pub fn route_batch(&self, frames: &[Vec<u8>]) -> Result<RouteReport> {
        let mut report = RouteReport::default();
        let mut mutations = Vec::with_capacity(frames.len());
        let now = now_micros();

        for frame in frames {
            let event = match decode_event(frame) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, bytes = frame.len(), "malformed firehose message skipped");
                    report.failed += 1;
                    continue;
                }
            };
            report.events += 1;
            report.max_time_us = report.max_time_us.max(Some(event.time_us));

            let actor = event.actor_id.clone();
            match event.into_mutation(&self.relevant, now) {
                Ok(Some(mutation)) => mutations.push(mutation),
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(actor = %actor, error = %err, "malformed commit skipped");
                    report.failed += 1;
                }
            }
        }

        if !mutations.is_empty() {
            let (summary, pending) = self.store.write(|conn| {
                let summary = ingest::apply_batch(conn, &mutations)?;
                let pending = match &self.backfill {
                    Some(_) => actors_needing_backfill(conn, &mutations)?,
                    None => Vec::new(),
                };
                Ok((summary, pending))
            })?;
            report.applied = summary.applied();
            report.failed += summary.failed;

            if let Some(coordinator) = &self.backfill {
                for actor in pending {
                    if coordinator.trigger(&actor) {
                        report.backfill_triggered.push(actor);
                    }
                }
            }
        }

        self.counters.events.fetch_add(report.events, Ordering::Relaxed);
        self.counters.applied.fetch_add(report.applied, Ordering::Relaxed);
        self.counters.skipped.fetch_add(report.skipped, Ordering::Relaxed);
        self.counters.failed.fetch_add(report.failed, Ordering::Relaxed);

        debug!(
            events = report.events,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            cursor = ?report.max_time_us,
            "batch routed"
        );
        Ok(report)
    }
}

fn actors_needing_backfill(
    conn: &rusqlite::Connection,
    mutations: &[RecordMutation],
) -> Result<Vec<String>> {
    let actors: BTreeSet<&str> = mutations.iter().map(RecordMutation::actor_id).collect();
    let mut pending = Vec::new();
    for actor in actors {
        if !storage::is_backfilled(conn, actor)? {
            pending.push(actor.to_string());
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Arc<IndexStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::open(dir.path().join("router.db")).unwrap());
        (dir, store)
    }

    fn commit(actor: &str, time_us: i64, op: &str, collection: &str, rkey: &str) -> Vec<u8> {
        let mut commit = json!({"operation": op, "collection": collection, "rkey": rkey});
        if op != "delete" {
            commit["record"] = json!({"createdAt": "2024-01-01T00:00:00Z"});
        }
        serde_json::to_vec(&json!({
            "did": actor, "time_us": time_us, "kind": "commit", "commit": commit
        }))
        .unwrap()
    }

    #[test]
    fn mixed_batch_applies_and_skips() {
        let (_dir, store) = store();
        let router = EventRouter::new(Arc::clone(&store), RecordType::ALL);

        let frames = vec![
            commit("did:plc:a", 10, "create", "social.brewline.brew", "b1"),
            b"garbage".to_vec(),
            commit("did:plc:a", 30, "create", "app.bsky.feed.post", "p1"),
            serde_json::to_vec(&json!({"did": "did:plc:a", "time_us": 40, "kind": "account"})).unwrap(),
            commit("did:plc:b", 20, "create", "social.brewline.bean", "x1"),
        ];
        let report = router.route_batch(&frames).unwrap();

        assert_eq!(report.events, 4);
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.max_time_us, Some(40));
        assert!(report.backfill_triggered.is_empty());

        assert!(store
            .get_record("at://did:plc:a/social.brewline.brew/b1")
            .unwrap()
            .is_some());
        assert_eq!(router.stats().failed, 1);
    }

    #[test]
    fn create_then_delete_in_one_batch() {
        let (_dir, store) = store();
        let router = EventRouter::new(Arc::clone(&store), RecordType::ALL);
        let frames = vec![
            commit("did:plc:a", 1, "create", "social.brewline.brew", "b1"),
            commit("did:plc:a", 2, "delete", "social.brewline.brew", "b1"),
        ];
        router.route_batch(&frames).unwrap();
        assert!(store
            .get_record("at://did:plc:a/social.brewline.brew/b1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn only_malformed_frames_still_report() {
        let (_dir, store) = store();
        let router = EventRouter::new(store, RecordType::ALL);
        let report = router.route_batch(&[b"{".to_vec(), vec![0xff]]).unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.max_time_us, None);
    }
}
