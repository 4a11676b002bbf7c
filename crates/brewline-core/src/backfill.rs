//! Backfill coordinator: fetch an actor's history from their origin store.
//!
//! The firehose only carries new writes. The first time an actor shows up,
//! their existing records are listed from the origin and pushed through the
//! same apply path as live events, after which the actor is flagged as
//! backfilled for good.
//!
//! # Architecture
//!
//! ```text
//! router ──trigger(actor)──▶ BackfillCoordinator
//!                              ├── in-flight set   (one run per actor)
//!                              ├── Semaphore       (bounded concurrency)
//!                              ├── RecordSource    (origin listing, per type)
//!                              └── IndexStore      (apply_all + mark_backfilled)
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BackfillConfig;
use crate::error::{BackfillError, Error, Result};
use crate::ingest::RecordMutation;
use crate::records::{AtUri, IndexedRecord, RecordType, now_micros};
use crate::retry::{RetryPolicy, with_smart_retry};
use crate::storage::IndexStore;

/// One record as listed by an origin store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

/// Read access to actors' origin stores.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Every record of one type owned by `actor_id`.
    async fn list_records(&self, actor_id: &str, record_type: RecordType)
    -> Result<Vec<OriginRecord>>;
}

// =============================================================================
// HTTP origin
// =============================================================================

#[derive(Debug, Deserialize)]
struct ListRecordsPage {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    records: Vec<OriginRecord>,
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    id: String,
    #[serde(default)]
    service_endpoint: Value,
}

/// Lists records over `com.atproto.repo.listRecords` on the actor's PDS.
pub struct HttpRecordSource {
    client: reqwest::Client,
    plc_directory: Url,
    page_size: u32,
    retry: RetryPolicy,
    origins: RwLock<HashMap<String, Url>>,
}

impl HttpRecordSource {
    pub fn new(config: &BackfillConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .user_agent(concat!("brewline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackfillError::Http(e.to_string()))?;
        let plc_directory = Url::parse(&config.plc_directory)
            .map_err(|e| BackfillError::Http(format!("bad PLC directory URL: {e}")))?;
        Ok(Self {
            client,
            plc_directory,
            page_size: config.page_size,
            retry: RetryPolicy::origin_fetch(),
            origins: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve (and cache) the PDS base URL for an actor.
    pub async fn resolve_origin(&self, actor_id: &str) -> Result<Url> {
        let cached = self
            .origins
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(actor_id)
            .cloned();
        if let Some(url) = cached {
            return Ok(url);
        }

        let doc_url = did_document_url(&self.plc_directory, actor_id)?;
        let doc: DidDocument = self.get_json(doc_url).await?;
        let origin = pds_endpoint(&doc).ok_or_else(|| BackfillError::Resolve {
            actor: actor_id.to_string(),
            reason: "DID document has no #atproto_pds service".to_string(),
        })?;
        debug!(actor = %actor_id, origin = %origin, "origin resolved");

        self.origins
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(actor_id.to_string(), origin.clone());
        Ok(origin)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        with_smart_retry(&self.retry, || self.fetch_json(&url)).await
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| BackfillError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackfillError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }
        let body = response
            .json::<T>()
            .await
            .map_err(|e| BackfillError::Response(e.to_string()))?;
        Ok(body)
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn list_records(
        &self,
        actor_id: &str,
        record_type: RecordType,
    ) -> Result<Vec<OriginRecord>> {
        let origin = self.resolve_origin(actor_id).await?;
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let url = list_records_url(
                &origin,
                actor_id,
                record_type,
                self.page_size,
                cursor.as_deref(),
            )?;
            let page: ListRecordsPage = self.get_json(url).await?;
            let fetched = page.records.len();
            records.extend(page.records);
            match page.cursor {
                Some(next) if fetched > 0 && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }
        Ok(records)
    }
}

fn did_document_url(plc_directory: &Url, actor_id: &str) -> Result<Url> {
    let resolve_err = |reason: String| BackfillError::Resolve {
        actor: actor_id.to_string(),
        reason,
    };
    if actor_id.starts_with("did:plc:") {
        return plc_directory
            .join(actor_id)
            .map_err(|e| resolve_err(e.to_string()).into());
    }
    if let Some(rest) = actor_id.strip_prefix("did:web:") {
        let mut parts = rest.split(':');
        let host = parts.next().unwrap_or_default().replace("%3A", ":");
        let path: Vec<&str> = parts.collect();
        let url = if path.is_empty() {
            format!("https://{host}/.well-known/did.json")
        } else {
            format!("https://{host}/{}/did.json", path.join("/"))
        };
        return Url::parse(&url).map_err(|e| resolve_err(e.to_string()).into());
    }
    Err(resolve_err("unsupported DID method".to_string()).into())
}

fn pds_endpoint(doc: &DidDocument) -> Option<Url> {
    doc.service
        .iter()
        .find(|service| service.id.ends_with("#atproto_pds"))
        .and_then(|service| service.service_endpoint.as_str())
        .and_then(|endpoint| Url::parse(endpoint).ok())
}

fn list_records_url(
    origin: &Url,
    actor_id: &str,
    record_type: RecordType,
    limit: u32,
    cursor: Option<&str>,
) -> Result<Url> {
    let mut url = origin
        .join("/xrpc/com.atproto.repo.listRecords")
        .map_err(|e| BackfillError::Http(e.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("repo", actor_id)
            .append_pair("collection", record_type.nsid())
            .append_pair("limit", &limit.to_string());
        if let Some(cursor) = cursor {
            query.append_pair("cursor", cursor);
        }
    }
    Ok(url)
}

// =============================================================================
// Coordinator
// =============================================================================

/// Result of a backfill request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackfillOutcome {
    /// The persisted flag was already set; nothing was fetched.
    AlreadyBackfilled,
    /// Another task is backfilling this actor right now.
    InProgress,
    Completed {
        records: u64,
        failed_types: Vec<RecordType>,
    },
}

/// Cumulative coordinator counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillStats {
    pub started: u64,
    pub completed: u64,
    pub failed_types: u64,
    pub records: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct BackfillCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed_types: AtomicU64,
    records: AtomicU64,
}

/// Removes an actor from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    actor: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, actor: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(actor.to_string());
        inserted.then(|| Self {
            set: Arc::clone(set),
            actor: actor.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.actor);
    }
}

pub struct BackfillCoordinator {
    store: Arc<IndexStore>,
    source: Arc<dyn RecordSource>,
    record_types: Vec<RecordType>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    completed: RwLock<HashSet<String>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    runtime: tokio::runtime::Handle,
    shutting_down: AtomicBool,
    /// Flips to `true` once; every in-flight origin listing watches it.
    stop_tx: watch::Sender<bool>,
    counters: BackfillCounters,
}

impl BackfillCoordinator {
    /// Create a coordinator bound to the current Tokio runtime.
    pub fn new(
        store: Arc<IndexStore>,
        source: Arc<dyn RecordSource>,
        record_types: Vec<RecordType>,
        max_concurrent: usize,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("backfill needs a Tokio runtime: {e}")))?;
        Ok(Arc::new(Self {
            store,
            source,
            record_types,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            completed: RwLock::new(HashSet::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            runtime,
            shutting_down: AtomicBool::new(false),
            stop_tx: watch::channel(false).0,
            counters: BackfillCounters::default(),
        }))
    }

    #[must_use]
    pub fn stats(&self) -> BackfillStats {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        BackfillStats {
            started: self.counters.started.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed_types: self.counters.failed_types.load(Ordering::Relaxed),
            records: self.counters.records.load(Ordering::Relaxed),
            in_flight: in_flight as u64,
        }
    }

    fn known_complete(&self, actor_id: &str) -> bool {
        self.completed
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(actor_id)
    }

    /// Backfill an actor now, waiting for the result.
    pub async fn backfill_user(&self, actor_id: &str) -> Result<BackfillOutcome> {
        if self.known_complete(actor_id) {
            return Ok(BackfillOutcome::AlreadyBackfilled);
        }
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, actor_id) else {
            return Ok(BackfillOutcome::InProgress);
        };
        self.run_guarded(guard).await
    }

    /// Schedule a background backfill. Returns `true` if a task was spawned.
    ///
    /// Safe to call from blocking threads; duplicates for an actor already
    /// running or known complete are ignored.
    pub fn trigger(self: &Arc<Self>, actor_id: &str) -> bool {
        if self.shutting_down.load(Ordering::Acquire) || self.known_complete(actor_id) {
            return false;
        }
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, actor_id) else {
            return false;
        };

        let this = Arc::clone(self);
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Reap finished tasks so the set only holds live work
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(
            async move {
                let actor = guard.actor.clone();
                match this.run_guarded(guard).await {
                    Ok(outcome) => debug!(actor = %actor, ?outcome, "background backfill finished"),
                    Err(Error::Cancelled(_)) => debug!(actor = %actor, "background backfill interrupted"),
                    Err(err) => warn!(actor = %actor, error = %err, "background backfill failed"),
                }
            },
            &self.runtime,
        );
        true
    }

    /// Stop accepting triggers and interrupt every running backfill.
    ///
    /// Runs waiting on an origin listing or a permit end at once without
    /// setting the actor's flag, so they start over on the next trigger.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.stop_tx.send_replace(true);
        let mut tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "backfill task did not complete cleanly");
            }
        }
    }

    async fn run_guarded(&self, guard: InFlightGuard) -> Result<BackfillOutcome> {
        let actor_id = guard.actor.clone();

        // Re-check under the guard: a run that finished just before we got
        // here has already set the flag
        let store = Arc::clone(&self.store);
        let check_actor = actor_id.clone();
        let done = tokio::task::spawn_blocking(move || store.is_backfilled(&check_actor))
            .await
            .map_err(|e| Error::Runtime(format!("backfill check join failed: {e}")))??;
        if done {
            self.mark_known_complete(&actor_id);
            return Ok(BackfillOutcome::AlreadyBackfilled);
        }

        let _permit = self
            .until_stopped(async {
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled("backfill semaphore closed".into()))
            })
            .await?;
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(actor = %actor_id, "backfill started");

        let mut records = 0u64;
        let mut failed_types = Vec::new();
        for &record_type in &self.record_types {
            match self.backfill_type(&actor_id, record_type).await {
                Ok(applied) => records += applied,
                Err(err @ Error::Cancelled(_)) => {
                    info!(actor = %actor_id, records, "backfill interrupted, flag left unset");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        actor = %actor_id,
                        record_type = %record_type,
                        error = %err,
                        "backfill of record type failed, continuing"
                    );
                    failed_types.push(record_type);
                }
            }
        }

        let store = Arc::clone(&self.store);
        let mark_actor = actor_id.clone();
        tokio::task::spawn_blocking(move || store.mark_backfilled(&mark_actor, now_micros()))
            .await
            .map_err(|e| Error::Runtime(format!("backfill flag join failed: {e}")))??;
        self.mark_known_complete(&actor_id);

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters.records.fetch_add(records, Ordering::Relaxed);
        self.counters
            .failed_types
            .fetch_add(failed_types.len() as u64, Ordering::Relaxed);
        info!(
            actor = %actor_id,
            records,
            failed_types = failed_types.len(),
            "backfill complete"
        );
        drop(guard);
        Ok(BackfillOutcome::Completed {
            records,
            failed_types,
        })
    }

    async fn backfill_type(&self, actor_id: &str, record_type: RecordType) -> Result<u64> {
        let listed = self
            .until_stopped(self.source.list_records(actor_id, record_type))
            .await?;
        let now = now_micros();
        let mutations: Vec<RecordMutation> = listed
            .into_iter()
            .filter_map(|record| origin_mutation(actor_id, record_type, record, now))
            .collect();
        if mutations.is_empty() {
            return Ok(0);
        }

        let store = Arc::clone(&self.store);
        let summary = tokio::task::spawn_blocking(move || store.apply_all(&mutations))
            .await
            .map_err(|e| Error::Runtime(format!("backfill apply join failed: {e}")))??;
        Ok(summary.applied())
    }

    /// Race `work` against shutdown; a stop wins with [`Error::Cancelled`].
    async fn until_stopped<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let mut stop = self.stop_tx.subscribe();
        tokio::select! {
            biased;
            () = async {
                // The sender lives as long as `self`, so this only ends on a stop
                let _ = stop.wait_for(|stopping| *stopping).await;
            } => {
                Err(Error::Cancelled("backfill interrupted by shutdown".into()))
            }
            result = work => result,
        }
    }

    fn mark_known_complete(&self, actor_id: &str) {
        self.completed
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(actor_id.to_string());
    }
}

/// Convert a listed record into an upsert, dropping anything that does not
/// belong to the actor and collection that were asked for.
fn origin_mutation(
    actor_id: &str,
    record_type: RecordType,
    record: OriginRecord,
    indexed_at: i64,
) -> Option<RecordMutation> {
    let uri = match AtUri::parse(&record.uri) {
        Ok(uri) => uri,
        Err(err) => {
            debug!(actor = %actor_id, error = %err, "origin record with bad uri skipped");
            return None;
        }
    };
    if uri.actor != actor_id || uri.record_type() != Some(record_type) || !record.value.is_object()
    {
        debug!(actor = %actor_id, uri = %record.uri, "unexpected origin record skipped");
        return None;
    }
    Some(RecordMutation::Upsert(IndexedRecord::new(
        uri.actor,
        record_type,
        uri.record_key,
        record.value,
        record.cid,
        indexed_at,
    )))
}
