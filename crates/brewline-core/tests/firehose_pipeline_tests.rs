//! End-to-end tests of the ingest path.
//!
//! Raw firehose frames go through the router into a temp index, and the
//! results are read back through the query facade.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use brewline_core::aggregation::notifications::NotificationKind;
use brewline_core::config::FeedConfig;
use brewline_core::feed::{FeedQuery, FeedSort};
use brewline_core::profiles::{Profile, ProfileCache};
use brewline_core::router::EventRouter;
use brewline_core::storage::IndexStore;
use brewline_core::{FeedIndex, RecordType};

const OWNER: &str = "did:plc:owner";
const FAN: &str = "did:plc:fan";

// =============================================================================
// Fixtures
// =============================================================================

struct Pipeline {
    _dir: tempfile::TempDir,
    router: EventRouter,
    index: FeedIndex,
    clock: i64,
}

impl Pipeline {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::open(dir.path().join("pipeline.db")).unwrap());
        let profiles = Arc::new(
            ProfileCache::with_store(Arc::clone(&store), Duration::from_secs(3600)).unwrap(),
        );
        let router = EventRouter::new(Arc::clone(&store), RecordType::ALL);
        let index = FeedIndex::new(store, profiles, FeedConfig::default());
        Self {
            _dir: dir,
            router,
            index,
            clock: 1_000,
        }
    }

    fn next_time(&mut self) -> i64 {
        self.clock += 1_000;
        self.clock
    }

    fn create(&mut self, actor: &str, record_type: RecordType, key: &str, record: Value) {
        let time_us = self.next_time();
        let frame = json!({
            "did": actor,
            "time_us": time_us,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": record_type.nsid(),
                "rkey": key,
                "record": record,
            }
        });
        self.route(vec![serde_json::to_vec(&frame).unwrap()]);
    }

    fn delete(&mut self, actor: &str, record_type: RecordType, key: &str) {
        let time_us = self.next_time();
        let frame = json!({
            "did": actor,
            "time_us": time_us,
            "kind": "commit",
            "commit": {"operation": "delete", "collection": record_type.nsid(), "rkey": key}
        });
        self.route(vec![serde_json::to_vec(&frame).unwrap()]);
    }

    fn route(&self, frames: Vec<Vec<u8>>) {
        let report = self.router.route_batch(&frames).unwrap();
        assert_eq!(report.failed, 0, "frames failed: {report:?}");
    }
}

fn uri(actor: &str, record_type: RecordType, key: &str) -> String {
    format!("at://{actor}/{}/{key}", record_type.nsid())
}

fn at(minute: u32) -> String {
    format!("2024-03-01T09:{minute:02}:00Z")
}

/// Roaster, bean and a brew that references the bean.
fn seed_brew_chain(pipeline: &mut Pipeline) -> String {
    pipeline.create(
        OWNER,
        RecordType::Roaster,
        "r1",
        json!({"name": "Tim Wendelboe", "location": "Oslo", "createdAt": at(0)}),
    );
    pipeline.create(
        OWNER,
        RecordType::Bean,
        "bean1",
        json!({
            "name": "Karogoto",
            "origin": "Kenya",
            "roasterRef": uri(OWNER, RecordType::Roaster, "r1"),
            "createdAt": at(1),
        }),
    );
    pipeline.create(
        OWNER,
        RecordType::Brew,
        "brew1",
        json!({
            "method": "V60",
            "beanRef": {"uri": uri(OWNER, RecordType::Bean, "bean1"), "cid": "bafyb"},
            "grinderRef": uri(OWNER, RecordType::Grinder, "missing"),
            "createdAt": at(2),
        }),
    );
    uri(OWNER, RecordType::Brew, "brew1")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn feed_item_carries_resolved_chain() {
    let mut pipeline = Pipeline::new();
    let brew = seed_brew_chain(&mut pipeline);

    let page = pipeline
        .index
        .feed_with_query(FeedQuery {
            record_type: Some(RecordType::Brew),
            ..FeedQuery::recent(10)
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let item = &page.items[0];
    assert_eq!(item.uri, brew);

    let bean_ref = item
        .references
        .iter()
        .find(|r| r.field == "beanRef")
        .expect("bean reference");
    let bean = bean_ref.target.as_ref().expect("bean resolved");
    assert_eq!(bean.record.payload["name"], "Karogoto");
    let roaster = bean.references[0].target.as_ref().expect("roaster resolved");
    assert_eq!(roaster.record.payload["location"], "Oslo");

    let grinder_ref = item
        .references
        .iter()
        .find(|r| r.field == "grinderRef")
        .expect("grinder reference");
    assert!(grinder_ref.target.is_none());
}

#[tokio::test]
async fn likes_and_comments_flow_into_counts_and_notifications() {
    let mut pipeline = Pipeline::new();
    let brew = seed_brew_chain(&mut pipeline);

    pipeline.create(
        FAN,
        RecordType::Like,
        "like1",
        json!({"subject": {"uri": brew, "cid": "bafy"}, "createdAt": at(5)}),
    );
    pipeline.create(
        FAN,
        RecordType::Comment,
        "c1",
        json!({"subject": {"uri": brew}, "text": "what grind size?", "createdAt": at(6)}),
    );
    let question = uri(FAN, RecordType::Comment, "c1");
    pipeline.create(
        OWNER,
        RecordType::Comment,
        "c2",
        json!({
            "subject": {"uri": brew},
            "parent": {"uri": question},
            "text": "medium fine",
            "createdAt": at(7),
        }),
    );

    let index = &pipeline.index;
    assert_eq!(index.like_count(&brew).await.unwrap(), 1);
    assert!(index.has_actor_liked(FAN, &brew).await.unwrap());
    assert_eq!(
        index.like_key(FAN, &brew).await.unwrap().as_deref(),
        Some("like1")
    );

    let thread = index.threaded_comments(&brew, 50, Some(OWNER)).await.unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0].comment.text, "what grind size?");
    assert_eq!(thread[0].depth, 0);
    assert!(!thread[0].is_mine);
    assert_eq!(thread[1].depth, 1);
    assert!(thread[1].is_mine);

    // Owner hears about the like and the comment; the fan hears about the reply
    let owner_page = index.notifications(OWNER, 20, None).await.unwrap();
    let kinds: Vec<NotificationKind> = owner_page.items.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NotificationKind::Comment, NotificationKind::Like]);
    let fan_page = index.notifications(FAN, 20, None).await.unwrap();
    assert_eq!(fan_page.items.len(), 1);
    assert_eq!(fan_page.items[0].kind, NotificationKind::Reply);
    assert_eq!(fan_page.items[0].actor_id, OWNER);

    assert_eq!(index.unread_count(OWNER).await.unwrap(), 2);
    index.mark_all_read(OWNER).await.unwrap();
    assert_eq!(index.unread_count(OWNER).await.unwrap(), 0);

    let feed = index.recent_feed(0).await.unwrap();
    let item = feed.items.iter().find(|i| i.uri == brew).expect("brew in feed");
    assert_eq!(item.like_count, 1);
    assert_eq!(item.comment_count, 2);
}

#[tokio::test]
async fn deletes_undo_aggregates() {
    let mut pipeline = Pipeline::new();
    let brew = seed_brew_chain(&mut pipeline);
    pipeline.create(
        FAN,
        RecordType::Like,
        "like1",
        json!({"subject": {"uri": brew}, "createdAt": at(5)}),
    );
    pipeline.create(
        FAN,
        RecordType::Comment,
        "c1",
        json!({"subject": {"uri": brew}, "text": "nice", "createdAt": at(6)}),
    );

    pipeline.delete(FAN, RecordType::Like, "like1");
    pipeline.delete(FAN, RecordType::Comment, "c1");
    // A second delete of the same record is a no-op
    pipeline.delete(FAN, RecordType::Comment, "c1");

    let index = &pipeline.index;
    assert_eq!(index.like_count(&brew).await.unwrap(), 0);
    assert!(!index.has_actor_liked(FAN, &brew).await.unwrap());
    assert!(index.comments_for_subject(&brew).await.unwrap().is_empty());
    assert_eq!(index.notifications(OWNER, 20, None).await.unwrap().items.len(), 0);

    pipeline.delete(OWNER, RecordType::Brew, "brew1");
    let index = &pipeline.index;
    assert!(index.record(&brew).await.unwrap().is_none());
    let stats = index.stats().await.unwrap();
    assert_eq!(stats.store.total_records, 2);
    assert_eq!(stats.store.like_edges, 0);
}

#[tokio::test]
async fn popular_sort_ranks_engagement() {
    let mut pipeline = Pipeline::new();
    for (key, minute) in [("quiet", 10), ("loved", 1), ("discussed", 2)] {
        pipeline.create(
            OWNER,
            RecordType::Brew,
            key,
            json!({"method": "aeropress", "createdAt": at(minute)}),
        );
    }
    let loved = uri(OWNER, RecordType::Brew, "loved");
    let discussed = uri(OWNER, RecordType::Brew, "discussed");
    for fan in ["did:plc:f1", "did:plc:f2"] {
        pipeline.create(
            fan,
            RecordType::Like,
            "l",
            json!({"subject": {"uri": loved}, "createdAt": at(20)}),
        );
    }
    pipeline.create(
        FAN,
        RecordType::Comment,
        "c",
        json!({"subject": {"uri": discussed}, "text": "recipe?", "createdAt": at(21)}),
    );

    let page = pipeline
        .index
        .feed_with_query(FeedQuery {
            record_type: Some(RecordType::Brew),
            sort: FeedSort::Popular,
            ..FeedQuery::recent(10)
        })
        .await
        .unwrap();
    let keys: Vec<&str> = page.items.iter().map(|i| i.record.record_key.as_str()).collect();
    assert_eq!(keys, vec!["loved", "discussed", "quiet"]);
}

#[tokio::test]
async fn feed_items_pick_up_cached_profiles() {
    let mut pipeline = Pipeline::new();
    seed_brew_chain(&mut pipeline);
    pipeline
        .index
        .profiles()
        .put(Profile {
            actor_id: OWNER.into(),
            handle: Some("owner.example".into()),
            display_name: Some("Owner".into()),
            avatar: None,
            description: None,
        })
        .unwrap();

    let page = pipeline.index.recent_feed(10).await.unwrap();
    assert_eq!(page.items.len(), 3);
    assert!(page.items.iter().all(|item| {
        item.author
            .as_ref()
            .and_then(|a| a.handle.as_deref())
            == Some("owner.example")
    }));
}

#[tokio::test]
async fn records_by_actor_filters_type() {
    let mut pipeline = Pipeline::new();
    seed_brew_chain(&mut pipeline);
    let all = pipeline
        .index
        .records_by_actor(OWNER, None, 10)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    let beans = pipeline
        .index
        .records_by_actor(OWNER, Some(RecordType::Bean), 10)
        .await
        .unwrap();
    assert_eq!(beans.len(), 1);
    assert_eq!(beans[0].record_key, "bean1");
}

#[tokio::test]
async fn removing_a_like_by_uri_drops_its_count() {
    let mut pipeline = Pipeline::new();
    let brew = seed_brew_chain(&mut pipeline);
    pipeline.create(
        FAN,
        RecordType::Like,
        "like1",
        json!({"subject": {"uri": brew}, "createdAt": at(5)}),
    );
    let like = uri(FAN, RecordType::Like, "like1");
    assert_eq!(pipeline.index.like_count(&brew).await.unwrap(), 1);

    pipeline.index.store().remove(&like).unwrap();

    let index = &pipeline.index;
    assert!(index.record(&like).await.unwrap().is_none());
    assert_eq!(index.like_count(&brew).await.unwrap(), 0);
    assert!(!index.has_actor_liked(FAN, &brew).await.unwrap());
    assert_eq!(index.unread_count(OWNER).await.unwrap(), 0);
}
