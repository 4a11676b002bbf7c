//! Read-side facade handed to collaborators.
//!
//! [`FeedIndex`] wraps the store, the profile cache and (optionally) the
//! backfill coordinator behind async methods. Every SQLite call runs on the
//! blocking pool so callers on the runtime never stall a worker thread.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::comments::{self, CommentNode, ThreadedComment};
use crate::aggregation::likes;
use crate::aggregation::notifications::{self, NotificationPage};
use crate::backfill::{BackfillCoordinator, BackfillOutcome};
use crate::config::{Config, FeedConfig};
use crate::error::{Error, Result};
use crate::feed::{self, FeedPage, FeedQuery};
use crate::profiles::ProfileCache;
use crate::records::{IndexedRecord, RecordType, now_micros};
use crate::storage::{IndexStats, IndexStore, RecordScan};

/// Query surface over the local index.
#[derive(Clone)]
pub struct FeedIndex {
    store: Arc<IndexStore>,
    profiles: Arc<ProfileCache>,
    feed: FeedConfig,
    backfill: Option<Arc<BackfillCoordinator>>,
}

impl std::fmt::Debug for FeedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedIndex")
            .field("store", &self.store)
            .field("feed", &self.feed)
            .field("backfill", &self.backfill.is_some())
            .finish_non_exhaustive()
    }
}

/// Diagnostic counts plus the profile cache size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    #[serde(flatten)]
    pub store: IndexStats,
    pub cached_profiles: usize,
}

impl FeedIndex {
    #[must_use]
    pub fn new(store: Arc<IndexStore>, profiles: Arc<ProfileCache>, feed: FeedConfig) -> Self {
        Self {
            store,
            profiles,
            feed,
            backfill: None,
        }
    }

    /// Open the store named by `config` and warm the profile cache from it.
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(IndexStore::open_with(
            config.db_path(),
            config.storage.store_options(),
        )?);
        let profiles = Arc::new(ProfileCache::with_store(
            Arc::clone(&store),
            Duration::from_secs(config.profiles.ttl_secs),
        )?);
        Ok(Self::new(store, profiles, config.feed.clone()))
    }

    #[must_use]
    pub fn with_backfill(mut self, coordinator: Arc<BackfillCoordinator>) -> Self {
        self.backfill = Some(coordinator);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    #[must_use]
    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.profiles
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&IndexStore, &ProfileCache) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let profiles = Arc::clone(&self.profiles);
        tokio::task::spawn_blocking(move || f(&store, &profiles))
            .await
            .map_err(|e| Error::Runtime(format!("index query join failed: {e}")))?
    }

    // ---------------------------------------------------------------------
    // Feeds
    // ---------------------------------------------------------------------

    /// Newest display-eligible items; `0` picks the configured default size.
    pub async fn recent_feed(&self, limit: usize) -> Result<FeedPage> {
        let limit = if limit == 0 {
            self.feed.default_limit
        } else {
            limit
        };
        self.feed_with_query(FeedQuery::recent(limit)).await
    }

    pub async fn feed_with_query(&self, query: FeedQuery) -> Result<FeedPage> {
        let max_limit = self.feed.max_limit;
        self.blocking(move |store, profiles| {
            store.read(|conn| feed::query_feed(conn, &query, max_limit, Some(profiles)))
        })
        .await
    }

    pub async fn record(&self, uri: &str) -> Result<Option<IndexedRecord>> {
        let uri = uri.to_string();
        self.blocking(move |store, _| store.get_record(&uri)).await
    }

    /// Newest records by one actor, any type unless `record_type` is given.
    pub async fn records_by_actor(
        &self,
        actor_id: &str,
        record_type: Option<RecordType>,
        limit: usize,
    ) -> Result<Vec<IndexedRecord>> {
        let scan = RecordScan {
            record_type,
            actor_id: Some(actor_id.to_string()),
            before: None,
            limit: limit.clamp(1, self.feed.max_limit.max(1)),
        };
        self.blocking(move |store, _| store.scan(&scan)).await
    }

    // ---------------------------------------------------------------------
    // Likes and comments
    // ---------------------------------------------------------------------

    pub async fn like_count(&self, subject_uri: &str) -> Result<u64> {
        let subject = subject_uri.to_string();
        self.blocking(move |store, _| store.read(|conn| likes::like_count(conn, &subject)))
            .await
    }

    pub async fn has_actor_liked(&self, actor_id: &str, subject_uri: &str) -> Result<bool> {
        let (actor, subject) = (actor_id.to_string(), subject_uri.to_string());
        self.blocking(move |store, _| store.read(|conn| likes::has_liked(conn, &actor, &subject)))
            .await
    }

    /// Record key of the actor's like on `subject_uri`, for unliking.
    pub async fn like_key(&self, actor_id: &str, subject_uri: &str) -> Result<Option<String>> {
        let (actor, subject) = (actor_id.to_string(), subject_uri.to_string());
        self.blocking(move |store, _| store.read(|conn| likes::like_key(conn, &actor, &subject)))
            .await
    }

    pub async fn comments_for_subject(&self, subject_uri: &str) -> Result<Vec<CommentNode>> {
        let subject = subject_uri.to_string();
        self.blocking(move |store, _| {
            store.read(|conn| comments::comments_for_subject(conn, &subject))
        })
        .await
    }

    /// Comments on `subject_uri` in thread order, at most `limit` of them.
    pub async fn threaded_comments(
        &self,
        subject_uri: &str,
        limit: usize,
        viewer: Option<&str>,
    ) -> Result<Vec<ThreadedComment>> {
        let subject = subject_uri.to_string();
        let viewer = viewer.map(str::to_string);
        self.blocking(move |store, _| {
            store.read(|conn| {
                let nodes = comments::comments_for_subject(conn, &subject)?;
                let uris: Vec<String> = nodes.iter().map(|node| node.uri.clone()).collect();
                let counts = likes::like_counts(conn, &uris)?;
                Ok(comments::build_thread(
                    nodes,
                    limit,
                    viewer.as_deref(),
                    &counts,
                ))
            })
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------------

    pub async fn notifications(
        &self,
        target_actor: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<NotificationPage> {
        let target = target_actor.to_string();
        let cursor = cursor.map(str::to_string);
        let limit = limit.clamp(1, self.feed.max_limit.max(1));
        self.blocking(move |store, _| {
            store.read(|conn| notifications::list(conn, &target, limit, cursor.as_deref()))
        })
        .await
    }

    pub async fn unread_count(&self, target_actor: &str) -> Result<u64> {
        let target = target_actor.to_string();
        self.blocking(move |store, _| {
            store.read(|conn| notifications::unread_count(conn, &target))
        })
        .await
    }

    pub async fn mark_all_read(&self, target_actor: &str) -> Result<()> {
        let target = target_actor.to_string();
        self.blocking(move |store, _| {
            store.write(|conn| notifications::mark_all_read(conn, &target, now_micros()))
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Actors and diagnostics
    // ---------------------------------------------------------------------

    pub async fn is_backfilled(&self, actor_id: &str) -> Result<bool> {
        let actor = actor_id.to_string();
        self.blocking(move |store, _| store.is_backfilled(&actor)).await
    }

    pub async fn mark_backfilled(&self, actor_id: &str) -> Result<()> {
        let actor = actor_id.to_string();
        self.blocking(move |store, _| store.mark_backfilled(&actor, now_micros()))
            .await
    }

    /// Backfill an actor now through the attached coordinator.
    pub async fn backfill_user(&self, actor_id: &str) -> Result<BackfillOutcome> {
        let coordinator = self
            .backfill
            .as_ref()
            .ok_or_else(|| Error::Runtime("backfill is not enabled for this index".into()))?;
        coordinator.backfill_user(actor_id).await
    }

    pub async fn stats(&self) -> Result<IndexReport> {
        self.blocking(|store, profiles| {
            Ok(IndexReport {
                store: store.stats()?,
                cached_profiles: profiles.len(),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RecordMutation;
    use crate::profiles::Profile;
    use crate::records::AtUri;
    use serde_json::json;

    const OWNER: &str = "did:plc:owner";

    fn index() -> (tempfile::TempDir, FeedIndex) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::open(dir.path().join("index.db")).unwrap());
        let profiles = Arc::new(
            ProfileCache::with_store(Arc::clone(&store), Duration::from_secs(60)).unwrap(),
        );
        (dir, FeedIndex::new(store, profiles, FeedConfig::default()))
    }

    fn brew_uri() -> String {
        AtUri::for_record(OWNER, RecordType::Brew, "b1").to_string()
    }

    fn seed(index: &FeedIndex) {
        let store = index.store();
        store
            .apply(&RecordMutation::Upsert(IndexedRecord::new(
                OWNER,
                RecordType::Brew,
                "b1",
                json!({"createdAt": "2024-06-01T07:00:00Z"}),
                None,
                1,
            )))
            .unwrap();
        store
            .apply(&RecordMutation::Upsert(IndexedRecord::new(
                "did:plc:fan",
                RecordType::Like,
                "l1",
                json!({"subject": {"uri": brew_uri()}, "createdAt": "2024-06-01T07:01:00Z"}),
                None,
                1,
            )))
            .unwrap();
        for (key, parent, minute) in [("c1", None, 2), ("c2", Some("c1"), 3)] {
            let mut payload = json!({
                "subject": {"uri": brew_uri()},
                "text": key,
                "createdAt": format!("2024-06-01T07:0{minute}:00Z"),
            });
            if let Some(parent) = parent {
                payload["parent"] = json!({
                    "uri": AtUri::for_record("did:plc:fan", RecordType::Comment, parent).to_string()
                });
            }
            store
                .apply(&RecordMutation::Upsert(IndexedRecord::new(
                    "did:plc:fan",
                    RecordType::Comment,
                    key,
                    payload,
                    None,
                    1,
                )))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn facade_reads_aggregates() {
        let (_dir, index) = index();
        seed(&index);

        assert_eq!(index.like_count(&brew_uri()).await.unwrap(), 1);
        assert!(index.has_actor_liked("did:plc:fan", &brew_uri()).await.unwrap());
        assert_eq!(
            index.like_key("did:plc:fan", &brew_uri()).await.unwrap().as_deref(),
            Some("l1")
        );
        assert!(!index.has_actor_liked(OWNER, &brew_uri()).await.unwrap());

        let nodes = index.comments_for_subject(&brew_uri()).await.unwrap();
        assert_eq!(nodes.len(), 2);
        let thread = index
            .threaded_comments(&brew_uri(), 10, Some("did:plc:fan"))
            .await
            .unwrap();
        assert_eq!(
            thread.iter().map(|c| c.depth).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(thread.iter().all(|c| c.is_mine));

        let page = index.recent_feed(0).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].like_count, 1);
        assert_eq!(page.items[0].comment_count, 2);
    }

    #[tokio::test]
    async fn notifications_round_trip_through_read_state() {
        let (_dir, index) = index();
        seed(&index);

        // like + comment from the fan; the reply is to the fan's own comment
        assert_eq!(index.unread_count(OWNER).await.unwrap(), 2);
        let page = index.notifications(OWNER, 1, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        let rest = index
            .notifications(OWNER, 10, page.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.next_cursor.is_none());

        index.mark_all_read(OWNER).await.unwrap();
        assert_eq!(index.unread_count(OWNER).await.unwrap(), 0);
        let page = index.notifications(OWNER, 10, None).await.unwrap();
        assert!(page.items.iter().all(|n| n.is_read));
    }

    #[tokio::test]
    async fn actor_queries_and_flags() {
        let (_dir, index) = index();
        seed(&index);

        let fan = index
            .records_by_actor("did:plc:fan", Some(RecordType::Comment), 10)
            .await
            .unwrap();
        assert_eq!(fan.len(), 2);
        assert!(index.record(&brew_uri()).await.unwrap().is_some());

        assert!(!index.is_backfilled(OWNER).await.unwrap());
        index.mark_backfilled(OWNER).await.unwrap();
        assert!(index.is_backfilled(OWNER).await.unwrap());
        assert!(matches!(
            index.backfill_user(OWNER).await,
            Err(Error::Runtime(_))
        ));

        index
            .profiles()
            .put(Profile {
                actor_id: OWNER.into(),
                handle: None,
                display_name: Some("Owner".into()),
                avatar: None,
                description: None,
            })
            .unwrap();
        let report = index.stats().await.unwrap();
        assert_eq!(report.store.known_actors, 2);
        assert_eq!(report.store.backfilled_actors, 1);
        assert_eq!(report.cached_profiles, 1);
    }
}
