//! Per-actor notifications with a read watermark.
//!
//! Rows are unique on `(target, kind, actor, subject)`, so replayed events
//! never produce duplicates. "Read" is not stored per row: everything created
//! at or before the target's `last_read_at` counts as read.

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, StorageError};
use crate::page_token::PageToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Comment,
    Reply,
}

impl NotificationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "like" => Ok(Self::Like),
            "comment" => Ok(Self::Comment),
            "reply" => Ok(Self::Reply),
            other => Err(StorageError::InvalidValue {
                column: "kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub target_actor: String,
    pub kind: NotificationKind,
    /// Who liked or commented.
    pub actor_id: String,
    pub subject_uri: String,
    pub created_at: i64,
    pub is_read: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    /// Empty when there are no older notifications.
    pub next_cursor: Option<String>,
}

/// Record a notification. Self-notifications and duplicates are dropped;
/// returns whether a row was written.
pub(crate) fn insert(
    conn: &Connection,
    target_actor: &str,
    kind: NotificationKind,
    actor_id: &str,
    subject_uri: &str,
    created_at: i64,
) -> Result<bool> {
    if target_actor == actor_id {
        return Ok(false);
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO notifications (target_actor, kind, actor_id, subject_uri, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![target_actor, kind.as_str(), actor_id, subject_uri, created_at],
    )?;
    Ok(inserted == 1)
}

/// Remove a notification; returns whether one existed.
pub(crate) fn retract(
    conn: &Connection,
    target_actor: &str,
    kind: NotificationKind,
    actor_id: &str,
    subject_uri: &str,
) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM notifications
         WHERE target_actor = ?1 AND kind = ?2 AND actor_id = ?3 AND subject_uri = ?4",
        params![target_actor, kind.as_str(), actor_id, subject_uri],
    )?;
    Ok(deleted > 0)
}

fn last_read_at(conn: &Connection, target_actor: &str) -> Result<i64> {
    let watermark: Option<i64> = conn
        .query_row(
            "SELECT last_read_at FROM notification_reads WHERE target_actor = ?1",
            [target_actor],
            |row| row.get(0),
        )
        .optional()?;
    Ok(watermark.unwrap_or(i64::MIN))
}

/// Newest-first page of a target's notifications.
pub(crate) fn list(
    conn: &Connection,
    target_actor: &str,
    limit: usize,
    cursor: Option<&str>,
) -> Result<NotificationPage> {
    let limit = limit.max(1);
    let before = cursor
        .filter(|c| !c.is_empty())
        .map(decode_cursor)
        .transpose()?;
    let watermark = last_read_at(conn, target_actor)?;
    let fetch = i64::try_from(limit + 1).unwrap_or(i64::MAX);

    let mut items = match before {
        Some((created_at, id)) => {
            let mut stmt = conn.prepare_cached(
                "SELECT id, target_actor, kind, actor_id, subject_uri, created_at
                 FROM notifications
                 WHERE target_actor = ?1 AND (created_at, id) < (?2, ?3)
                 ORDER BY created_at DESC, id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(params![target_actor, created_at, id, fetch], |row| {
                decode_row(row, watermark)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT id, target_actor, kind, actor_id, subject_uri, created_at
                 FROM notifications
                 WHERE target_actor = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![target_actor, fetch], |row| {
                decode_row(row, watermark)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };

    let next_cursor = if items.len() > limit {
        items.truncate(limit);
        items
            .last()
            .map(|last| PageToken::new(None, last.created_at, last.id.to_string()).encode())
    } else {
        None
    };
    Ok(NotificationPage { items, next_cursor })
}

fn decode_cursor(cursor: &str) -> Result<(i64, i64)> {
    let token = PageToken::decode(cursor, false)?;
    let id = token
        .key
        .parse::<i64>()
        .map_err(|_| Error::InvalidCursor(format!("not a notification cursor: {cursor}")))?;
    Ok((token.time_us, id))
}

fn decode_row(row: &Row<'_>, watermark: i64) -> rusqlite::Result<Notification> {
    let kind_raw: String = row.get(2)?;
    let kind = kind_raw.parse::<NotificationKind>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let created_at: i64 = row.get(5)?;
    Ok(Notification {
        id: row.get(0)?,
        target_actor: row.get(1)?,
        kind,
        actor_id: row.get(3)?,
        subject_uri: row.get(4)?,
        created_at,
        is_read: created_at <= watermark,
    })
}

pub(crate) fn unread_count(conn: &Connection, target_actor: &str) -> Result<u64> {
    let watermark = last_read_at(conn, target_actor)?;
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE target_actor = ?1 AND created_at > ?2",
        params![target_actor, watermark],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(n).unwrap_or_default())
}

/// Move the watermark past every current notification. Never moves it back.
pub(crate) fn mark_all_read(conn: &Connection, target_actor: &str, now_us: i64) -> Result<()> {
    let newest: Option<i64> = conn.query_row(
        "SELECT MAX(created_at) FROM notifications WHERE target_actor = ?1",
        [target_actor],
        |row| row.get(0),
    )?;
    let watermark = newest.map_or(now_us, |newest| newest.max(now_us));
    conn.execute(
        "INSERT INTO notification_reads (target_actor, last_read_at) VALUES (?1, ?2)
         ON CONFLICT(target_actor) DO UPDATE SET
            last_read_at = MAX(last_read_at, excluded.last_read_at)",
        params![target_actor, watermark],
    )?;
    Ok(())
}
