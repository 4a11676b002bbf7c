//! brewline-core: firehose replica and feed index for brewing records
//!
//! This crate keeps a local, queryable copy of the coffee-brewing records
//! published on a decentralized social network, fed by a live event stream
//! and by per-actor history backfills.
//!
//! # Architecture
//!
//! ```text
//! Firehose (WebSocket) → StreamConnector → EventRouter → IndexStore (SQLite)
//!                                              ↓              ↓
//!                                   BackfillCoordinator   Aggregation (likes,
//!                                     (origin stores)     comments, notifications)
//!                                                             ↓
//!                                         FeedIndex (feeds, threads, counts)
//! ```
//!
//! # Modules
//!
//! - `records`: record types, resource identifiers and the indexed record model
//! - `storage`: SQLite index store (single writer, pooled readers)
//! - `ingest`: the shared apply path for stream and backfill mutations
//! - `aggregation`: like counts, comment threads, notifications
//! - `resolver`: brew → bean → roaster reference resolution
//! - `events`: firehose message decoding
//! - `router`: routing decoded events into the index
//! - `connector`: resilient WebSocket subscription
//! - `backfill`: origin-store history fetches
//! - `consumer`: connector + router as one service
//! - `feed`: keyset-paginated feed queries
//! - `profiles`: author profile cache
//! - `index`: the read facade handed to collaborators
//! - `config`, `logging`, `error`, `retry`, `page_token`: ambient support
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aggregation;
pub mod backfill;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod events;
pub mod feed;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod page_token;
pub mod profiles;
pub mod records;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod storage;

pub use error::{Error, Result, StorageError};
pub use index::FeedIndex;
pub use records::{AtUri, IndexedRecord, RecordType};
