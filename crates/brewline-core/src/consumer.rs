//! Firehose consumer: the connector and router wired into one service.
//!
//! ```text
//!  StreamConnector ──mpsc(frames)──▶ router task ──spawn_blocking──▶ EventRouter
//!        ▲                                │                              │
//!   watch(shutdown)                 cursor flush (every N)        BackfillCoordinator
//! ```
//!
//! `stop` signals the connector, which closes the frame channel; the router
//! task drains what is left and exits. Backfills in flight are interrupted
//! (their actors stay unflagged) and the cursor is flushed last, so a restart
//! resumes after everything applied.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backfill::{BackfillCoordinator, BackfillStats, HttpRecordSource, RecordSource};
use crate::config::Config;
use crate::connector::{ConnectionState, ConnectorSnapshot, StreamConnector};
use crate::error::{Error, Result};
use crate::router::{EventRouter, RouterStats};
use crate::storage::IndexStore;

/// Frames handed to the router in one blocking call at most.
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub connector: ConnectorSnapshot,
    pub router: RouterStats,
    pub backfill: Option<BackfillStats>,
    /// Newest event time applied to the index.
    pub applied_cursor: Option<i64>,
}

struct RunningTasks {
    connector: JoinHandle<Result<()>>,
    router: JoinHandle<()>,
}

pub struct FirehoseConsumer {
    store: Arc<IndexStore>,
    connector: Arc<StreamConnector>,
    router: Arc<EventRouter>,
    backfill: Option<Arc<BackfillCoordinator>>,
    channel_capacity: usize,
    flush_every: u64,
    applied: Arc<AtomicI64>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl FirehoseConsumer {
    /// Build a consumer over `store`. Must be called inside a Tokio runtime
    /// when backfill is enabled.
    pub fn new(config: &Config, store: Arc<IndexStore>) -> Result<Self> {
        let source: Option<Arc<dyn RecordSource>> = if config.backfill.enabled {
            Some(Arc::new(HttpRecordSource::new(&config.backfill)?))
        } else {
            None
        };
        Self::build(config, store, source)
    }

    /// Build a consumer that backfills from `source` instead of the actors'
    /// origin stores. `backfill.enabled` still decides whether it is used.
    pub fn with_record_source(
        config: &Config,
        store: Arc<IndexStore>,
        source: Arc<dyn RecordSource>,
    ) -> Result<Self> {
        Self::build(config, store, Some(source))
    }

    fn build(
        config: &Config,
        store: Arc<IndexStore>,
        source: Option<Arc<dyn RecordSource>>,
    ) -> Result<Self> {
        let wanted = config.stream.wanted_record_types()?;
        let connector = Arc::new(StreamConnector::new(
            &config.stream,
            Arc::clone(&store) as Arc<dyn crate::connector::CursorSource>,
        )?);

        let backfill = match source.filter(|_| config.backfill.enabled) {
            Some(source) => Some(BackfillCoordinator::new(
                Arc::clone(&store),
                source,
                wanted.clone(),
                config.backfill.max_concurrent,
            )?),
            None => None,
        };

        let mut router = EventRouter::new(Arc::clone(&store), wanted);
        if let Some(coordinator) = &backfill {
            router = router.with_backfill(Arc::clone(coordinator));
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            store,
            connector,
            router: Arc::new(router),
            backfill,
            channel_capacity: config.stream.channel_capacity.max(1),
            flush_every: config.stream.cursor_flush_every.max(1),
            applied: Arc::new(AtomicI64::new(0)),
            shutdown_tx,
            tasks: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn backfill(&self) -> Option<&Arc<BackfillCoordinator>> {
        self.backfill.as_ref()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connector.state()
    }

    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        let applied = self.applied.load(Ordering::Acquire);
        ConsumerStats {
            connector: self.connector.snapshot(),
            router: self.router.stats(),
            backfill: self.backfill.as_ref().map(|b| b.stats()),
            applied_cursor: (applied > 0).then_some(applied),
        }
    }

    /// Spawn the connector and router tasks.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tasks.is_some() {
            return Err(Error::Runtime("firehose consumer already started".into()));
        }
        if *self.shutdown_tx.borrow() {
            return Err(Error::Runtime("firehose consumer was stopped".into()));
        }

        let (frame_tx, frame_rx) = mpsc::channel(self.channel_capacity);

        let connector = Arc::clone(&self.connector);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let connector_task =
            tokio::spawn(async move { connector.run(frame_tx, shutdown_rx).await });

        let router_task = tokio::spawn(route_frames(
            frame_rx,
            Arc::clone(&self.router),
            Arc::clone(&self.store),
            Arc::clone(&self.connector),
            Arc::clone(&self.applied),
            self.flush_every,
        ));

        *tasks = Some(RunningTasks {
            connector: connector_task,
            router: router_task,
        });
        info!(endpoint = %self.connector.current_endpoint(), "firehose consumer started");
        Ok(())
    }

    /// Stop the stream, drain the router, interrupt backfills and flush the
    /// cursor.
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        self.shutdown_tx.send_replace(true);

        if let Some(running) = running {
            match running.connector.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "connector ended with an error"),
                Err(err) => warn!(error = %err, "connector task did not complete cleanly"),
            }
            if let Err(err) = running.router.await {
                warn!(error = %err, "router task did not complete cleanly");
            }
        }

        if let Some(backfill) = &self.backfill {
            backfill.shutdown().await;
        }

        let applied = self.applied.load(Ordering::Acquire);
        if applied > 0 {
            flush_cursor(&self.store, applied).await?;
        }
        info!(cursor = applied, "firehose consumer stopped");
        Ok(())
    }
}

async fn route_frames(
    mut frames: mpsc::Receiver<Vec<u8>>,
    router: Arc<EventRouter>,
    store: Arc<IndexStore>,
    connector: Arc<StreamConnector>,
    applied: Arc<AtomicI64>,
    flush_every: u64,
) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    let mut since_flush = 0u64;

    // Ends once the connector drops its sender and the channel is drained
    while frames.recv_many(&mut batch, MAX_BATCH).await > 0 {
        let chunk = std::mem::take(&mut batch);
        let routing = Arc::clone(&router);
        let report = match tokio::task::spawn_blocking(move || routing.route_batch(&chunk)).await {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                error!(error = %err, "batch could not be applied, skipped");
                continue;
            }
            Err(err) => {
                error!(error = %err, "router task failed");
                continue;
            }
        };

        if let Some(time_us) = report.max_time_us {
            connector.note_event_time(time_us);
            applied.fetch_max(time_us, Ordering::AcqRel);
        }
        if !report.backfill_triggered.is_empty() {
            debug!(actors = report.backfill_triggered.len(), "backfills triggered");
        }

        since_flush += report.events + report.failed;
        if since_flush >= flush_every {
            since_flush = 0;
            let cursor = applied.load(Ordering::Acquire);
            if cursor > 0 {
                if let Err(err) = flush_cursor(&store, cursor).await {
                    warn!(error = %err, cursor, "cursor flush failed");
                }
            }
        }
    }
    debug!("router drained");
}

async fn flush_cursor(store: &Arc<IndexStore>, time_us: i64) -> Result<()> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.save_cursor(time_us))
        .await
        .map_err(|e| Error::Runtime(format!("cursor flush join failed: {e}")))?
}
