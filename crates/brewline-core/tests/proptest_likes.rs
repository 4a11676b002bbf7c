//! Property-based tests for like aggregation.
//!
//! Random interleavings of like creates, re-points and deletes must leave
//! every subject's count equal to the number of distinct actors holding at
//! least one live like record on it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use brewline_core::config::FeedConfig;
use brewline_core::ingest::RecordMutation;
use brewline_core::profiles::ProfileCache;
use brewline_core::storage::IndexStore;
use brewline_core::{FeedIndex, IndexedRecord, RecordType};

const ACTORS: [&str; 3] = ["did:plc:ana", "did:plc:bo", "did:plc:cy"];
const SUBJECTS: [&str; 2] = [
    "at://did:plc:owner/social.brewline.brew/morning",
    "at://did:plc:owner/social.brewline.bean/ethiopia",
];

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Like { actor: usize, key: usize, subject: usize },
    Unlike { actor: usize, key: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..ACTORS.len(), 0..4usize, 0..SUBJECTS.len())
            .prop_map(|(actor, key, subject)| Op::Like { actor, key, subject }),
        2 => (0..ACTORS.len(), 0..4usize).prop_map(|(actor, key)| Op::Unlike { actor, key }),
    ]
}

fn mutation(op: &Op, step: usize) -> RecordMutation {
    match *op {
        Op::Like { actor, key, subject } => RecordMutation::Upsert(IndexedRecord::new(
            ACTORS[actor],
            RecordType::Like,
            format!("l{key}"),
            json!({
                "subject": {"uri": SUBJECTS[subject], "cid": "bafy"},
                "createdAt": format!("2024-06-01T08:{:02}:00Z", step % 60),
            }),
            None,
            i64::try_from(step).unwrap_or(0),
        )),
        Op::Unlike { actor, key } => RecordMutation::Delete {
            actor_id: ACTORS[actor].to_string(),
            record_type: RecordType::Like,
            record_key: format!("l{key}"),
        },
    }
}

/// Expected distinct likers per subject under the live set.
fn expected_counts(live: &BTreeMap<(usize, usize), usize>) -> BTreeMap<usize, BTreeSet<usize>> {
    let mut likers: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (&(actor, _), &subject) in live {
        likers.entry(subject).or_default().insert(actor);
    }
    likers
}

fn index(dir: &tempfile::TempDir) -> FeedIndex {
    let store = Arc::new(IndexStore::open(dir.path().join("likes.db")).unwrap());
    let profiles = Arc::new(ProfileCache::new(Duration::from_secs(60)));
    FeedIndex::new(store, profiles, FeedConfig::default())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn like_count_tracks_distinct_live_likers(ops in prop::collection::vec(arb_op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let index = index(&dir);

        let mut live: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for (step, op) in ops.iter().enumerate() {
            index.store().apply(&mutation(op, step)).unwrap();
            match *op {
                Op::Like { actor, key, subject } => {
                    live.insert((actor, key), subject);
                }
                Op::Unlike { actor, key } => {
                    live.remove(&(actor, key));
                }
            }
        }

        let expected = expected_counts(&live);
        runtime.block_on(async {
            for (subject_idx, subject) in SUBJECTS.iter().enumerate() {
                let likers = expected.get(&subject_idx).cloned().unwrap_or_default();
                let count = index.like_count(subject).await.unwrap();
                prop_assert_eq!(count, likers.len() as u64, "subject {}", subject);

                for (actor_idx, actor) in ACTORS.iter().enumerate() {
                    let liked = index.has_actor_liked(actor, subject).await.unwrap();
                    prop_assert_eq!(liked, likers.contains(&actor_idx));

                    // The edge always points at a record that is still live
                    if let Some(key) = index.like_key(actor, subject).await.unwrap() {
                        let key_idx: usize = key.trim_start_matches('l').parse().unwrap();
                        prop_assert_eq!(live.get(&(actor_idx, key_idx)), Some(&subject_idx));
                    }
                }
            }
            Ok(())
        })?;

        let edges: usize = expected.values().map(BTreeSet::len).sum();
        let stats = index.store().stats().unwrap();
        prop_assert_eq!(stats.like_edges, edges as u64);
    }

    #[test]
    fn replayed_mutations_are_idempotent(ops in prop::collection::vec(arb_op(), 1..25)) {
        let dir = tempfile::tempdir().unwrap();
        let index = index(&dir);
        let mutations: Vec<RecordMutation> =
            ops.iter().enumerate().map(|(step, op)| mutation(op, step)).collect();

        index.store().apply_all(&mutations).unwrap();
        let once = index.store().stats().unwrap();
        // Replaying the tail again must not move any count
        if let Some(last) = mutations.last() {
            index.store().apply(last).unwrap();
        }
        let twice = index.store().stats().unwrap();
        prop_assert_eq!(once.like_edges, twice.like_edges);
        prop_assert_eq!(once.total_records, twice.total_records);
        prop_assert_eq!(once.notifications, twice.notifications);
    }
}
