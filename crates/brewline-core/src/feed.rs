//! Feed queries: keyset-paginated pages of display-eligible records.
//!
//! Two orderings are offered. `Recent` walks `(created_at, uri)` downwards.
//! `Popular` ranks by `3 × likes + 2 × comments` and breaks ties the same way
//! `Recent` orders. Both page with an opaque [`PageToken`] holding the sort
//! key of the last item served, never with offsets, so concurrent writes do
//! not shift pages.

use std::fmt;
use std::str::FromStr;

use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::aggregation::{comments, likes};
use crate::error::{Error, Result};
use crate::page_token::PageToken;
use crate::profiles::{Profile, ProfileCache};
use crate::records::{IndexedRecord, RecordType};
use crate::resolver::{self, ResolvedRef};
use crate::storage::{self, RECORD_COLUMNS};

const LIKE_WEIGHT: i64 = 3;
const COMMENT_WEIGHT: i64 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSort {
    #[default]
    Recent,
    Popular,
}

impl fmt::Display for FeedSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recent => f.write_str("recent"),
            Self::Popular => f.write_str("popular"),
        }
    }
}

impl FromStr for FeedSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recent" => Ok(Self::Recent),
            "popular" => Ok(Self::Popular),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// Filter, order and page position of a feed request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedQuery {
    pub record_type: Option<RecordType>,
    pub actor_id: Option<String>,
    pub sort: FeedSort,
    /// Cursor returned by the previous page; `None` or empty for the first.
    pub cursor: Option<String>,
    pub limit: usize,
}

impl FeedQuery {
    /// First page of the newest items of every display-eligible type.
    #[must_use]
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// One feed entry with its read-time enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub uri: String,
    pub record: IndexedRecord,
    pub like_count: u64,
    pub comment_count: u64,
    pub references: Vec<ResolvedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    /// `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Run a feed query on a read connection.
pub(crate) fn query_feed(
    conn: &Connection,
    query: &FeedQuery,
    max_limit: usize,
    profiles: Option<&ProfileCache>,
) -> Result<FeedPage> {
    let limit = query.limit.clamp(1, max_limit.max(1));
    let scored = query.sort == FeedSort::Popular;
    let after = query
        .cursor
        .as_deref()
        .filter(|cursor| !cursor.trim().is_empty())
        .map(|cursor| PageToken::decode(cursor, scored))
        .transpose()?;

    let types: Vec<RecordType> = match query.record_type {
        Some(record_type) if record_type.is_display_eligible() => vec![record_type],
        Some(_) => return Ok(FeedPage::default()),
        None => RecordType::display_types().collect(),
    };

    let mut rows = select_rows(conn, &types, query.actor_id.as_deref(), scored, after, limit)?;

    let next_cursor = if rows.len() > limit {
        rows.truncate(limit);
        rows.last().map(|(record, score)| {
            PageToken::new(*score, record.created_at, record.uri.clone()).encode()
        })
    } else {
        None
    };

    let records: Vec<IndexedRecord> = rows.into_iter().map(|(record, _)| record).collect();
    let items = enrich(conn, records, profiles)?;
    Ok(FeedPage { items, next_cursor })
}

fn select_rows(
    conn: &Connection,
    types: &[RecordType],
    actor_id: Option<&str>,
    scored: bool,
    after: Option<PageToken>,
    limit: usize,
) -> Result<Vec<(IndexedRecord, Option<i64>)>> {
    let mut clauses = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    let placeholders = vec!["?"; types.len()].join(", ");
    clauses.push(format!("r.record_type IN ({placeholders})"));
    args.extend(
        types
            .iter()
            .map(|t| SqlValue::Text(t.nsid().to_string())),
    );
    if let Some(actor) = actor_id {
        clauses.push("r.actor_id = ?".to_string());
        args.push(SqlValue::Text(actor.to_string()));
    }
    let inner_where = clauses.join(" AND ");

    let (outer_where, order) = if scored {
        let outer = match &after {
            Some(token) => {
                args.push(SqlValue::Integer(token.score.unwrap_or_default()));
                args.push(SqlValue::Integer(token.time_us));
                args.push(SqlValue::Text(token.key.clone()));
                "WHERE (score, created_at, uri) < (?, ?, ?)"
            }
            None => "",
        };
        (outer, "score DESC, created_at DESC, uri DESC")
    } else {
        let outer = match &after {
            Some(token) => {
                args.push(SqlValue::Integer(token.time_us));
                args.push(SqlValue::Text(token.key.clone()));
                "WHERE (created_at, uri) < (?, ?)"
            }
            None => "",
        };
        (outer, "created_at DESC, uri DESC")
    };
    args.push(SqlValue::Integer(
        i64::try_from(limit + 1).unwrap_or(i64::MAX),
    ));

    let sql = format!(
        "SELECT {RECORD_COLUMNS}, score FROM (
            SELECT r.uri, r.actor_id, r.record_type, r.record_key, r.payload,
                   r.content_hash, r.indexed_at, r.created_at,
                   {LIKE_WEIGHT} * COALESCE(
                       (SELECT lc.count FROM like_counts lc WHERE lc.subject_uri = r.uri), 0)
                   + {COMMENT_WEIGHT} * (
                       SELECT COUNT(*) FROM comments c WHERE c.subject_uri = r.uri) AS score
            FROM records r
            WHERE {inner_where}
         )
         {outer_where}
         ORDER BY {order}
         LIMIT ?"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
        let record = storage::decode_record_row(row)?;
        let score: i64 = row.get(8)?;
        Ok((record, scored.then_some(score)))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}

fn enrich(
    conn: &Connection,
    records: Vec<IndexedRecord>,
    profiles: Option<&ProfileCache>,
) -> Result<Vec<FeedItem>> {
    let uris: Vec<String> = records.iter().map(|record| record.uri.clone()).collect();
    let like_counts = likes::like_counts(conn, &uris)?;
    let comment_counts = comments::comment_counts(conn, &uris)?;
    let references = resolver::resolve_references(conn, &records)?;
    let authors = profiles
        .map(|cache| cache.get_many(records.iter().map(|record| record.actor_id.as_str())))
        .unwrap_or_default();

    Ok(records
        .into_iter()
        .zip(references)
        .map(|(record, references)| FeedItem {
            uri: record.uri.clone(),
            like_count: like_counts.get(&record.uri).copied().unwrap_or_default(),
            comment_count: comment_counts.get(&record.uri).copied().unwrap_or_default(),
            author: authors.get(&record.actor_id).cloned(),
            references,
            record,
        })
        .collect())
}
