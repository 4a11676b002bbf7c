//! Like edges and per-subject counters.
//!
//! An edge exists for every `(subject, actor)` pair with at least one live
//! like record. `like_counts.count` always equals the number of edges for the
//! subject; rows reaching zero are deleted.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::records::{RecordType, reference_uri};

/// Insert an edge. Returns `false` when the actor already likes the subject.
pub(crate) fn insert_edge(
    conn: &Connection,
    subject_uri: &str,
    actor_id: &str,
    record_key: &str,
    created_at: i64,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO likes (subject_uri, actor_id, record_key, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![subject_uri, actor_id, record_key, created_at],
    )?;
    if inserted == 0 {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO like_counts (subject_uri, count) VALUES (?1, 1)
         ON CONFLICT(subject_uri) DO UPDATE SET count = count + 1",
        [subject_uri],
    )?;
    Ok(true)
}

/// What happened to an edge when one of its like records went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EdgeRemoval {
    /// No edge was keyed by that record.
    NotFound,
    /// The edge moved to another live like record by the same actor.
    Repointed { subject_uri: String },
    /// The edge is gone and the counter was decremented.
    Removed { subject_uri: String },
}

/// Drop the edge created by like record `(actor, record_key)`.
///
/// When the actor has another live like record on the same subject the edge
/// is re-keyed to it instead, so the count keeps tracking distinct likers.
pub(crate) fn remove_edge(
    conn: &Connection,
    actor_id: &str,
    record_key: &str,
) -> Result<EdgeRemoval> {
    let subject: Option<String> = conn
        .query_row(
            "SELECT subject_uri FROM likes WHERE actor_id = ?1 AND record_key = ?2",
            params![actor_id, record_key],
            |row| row.get(0),
        )
        .optional()?;
    let Some(subject_uri) = subject else {
        return Ok(EdgeRemoval::NotFound);
    };

    if let Some((other_key, created_at)) =
        surviving_like(conn, actor_id, record_key, &subject_uri)?
    {
        conn.execute(
            "UPDATE likes SET record_key = ?3, created_at = ?4
             WHERE subject_uri = ?1 AND actor_id = ?2",
            params![subject_uri, actor_id, other_key, created_at],
        )?;
        return Ok(EdgeRemoval::Repointed { subject_uri });
    }

    conn.execute(
        "DELETE FROM likes WHERE subject_uri = ?1 AND actor_id = ?2",
        params![subject_uri, actor_id],
    )?;
    let decremented = conn.execute(
        "UPDATE like_counts SET count = count - 1 WHERE subject_uri = ?1 AND count > 1",
        [&subject_uri],
    )?;
    if decremented == 0 {
        conn.execute("DELETE FROM like_counts WHERE subject_uri = ?1", [&subject_uri])?;
    }
    Ok(EdgeRemoval::Removed { subject_uri })
}

/// Another indexed like record by `actor` on `subject`, other than `skip_key`.
fn surviving_like(
    conn: &Connection,
    actor_id: &str,
    skip_key: &str,
    subject_uri: &str,
) -> Result<Option<(String, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT record_key, payload, created_at FROM records
         WHERE actor_id = ?1 AND record_type = ?2 AND record_key != ?3
         ORDER BY created_at ASC, record_key ASC",
    )?;
    let rows = stmt.query_map(
        params![actor_id, RecordType::Like.nsid(), skip_key],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        },
    )?;
    for row in rows {
        let (key, payload, created_at) = row?;
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&payload) else {
            continue;
        };
        if reference_uri(&payload, "subject") == Some(subject_uri) {
            return Ok(Some((key, created_at)));
        }
    }
    Ok(None)
}

pub(crate) fn like_count(conn: &Connection, subject_uri: &str) -> Result<u64> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT count FROM like_counts WHERE subject_uri = ?1",
            [subject_uri],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.map_or(0, |n| u64::try_from(n).unwrap_or_default()))
}

/// Counts for many subjects at once; subjects without likes map to 0.
pub(crate) fn like_counts(conn: &Connection, subjects: &[String]) -> Result<HashMap<String, u64>> {
    let mut counts: HashMap<String, u64> = subjects.iter().map(|s| (s.clone(), 0)).collect();
    for chunk in subjects.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT subject_uri, count FROM like_counts WHERE subject_uri IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (subject, n) = row?;
            counts.insert(subject, u64::try_from(n).unwrap_or_default());
        }
    }
    Ok(counts)
}

/// Record key of the actor's like on `subject`, if any.
pub(crate) fn like_key(conn: &Connection, actor_id: &str, subject_uri: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT record_key FROM likes WHERE subject_uri = ?1 AND actor_id = ?2",
        params![subject_uri, actor_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn has_liked(conn: &Connection, actor_id: &str, subject_uri: &str) -> Result<bool> {
    Ok(like_key(conn, actor_id, subject_uri)?.is_some())
}
