//! Comment nodes and thread assembly.
//!
//! Nodes are stored flat with a nullable `parent_uri`; the forest for a
//! subject is rebuilt at query time by grouping on the parent.
//!
//! ```text
//! A (depth 0)
//! └─ B (1)
//!    └─ C (2)
//!       └─ D (2, true depth 3)
//! ```

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::{AtUri, IndexedRecord, RecordType, reference_uri};

/// Deepest level a reply is shown indented to.
pub const MAX_DISPLAY_DEPTH: usize = 2;

/// One comment as kept by the aggregation tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentNode {
    pub uri: String,
    pub actor_id: String,
    pub record_key: String,
    pub subject_uri: String,
    pub parent_uri: Option<String>,
    pub text: String,
    pub created_at: i64,
    pub content_hash: String,
}

impl CommentNode {
    /// Extract a node from a comment record; `None` without a subject.
    #[must_use]
    pub fn from_record(record: &IndexedRecord) -> Option<Self> {
        if record.record_type != RecordType::Comment {
            return None;
        }
        let subject_uri = reference_uri(&record.payload, "subject")?.to_string();
        let parent_uri = reference_uri(&record.payload, "parent")
            .filter(|parent| *parent != record.uri)
            .map(str::to_string);
        let text = record
            .payload
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            uri: record.uri.clone(),
            actor_id: record.actor_id.clone(),
            record_key: record.record_key.clone(),
            subject_uri,
            parent_uri,
            text,
            created_at: record.created_at,
            content_hash: record.content_hash.clone(),
        })
    }
}

/// A comment positioned in a flattened thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadedComment {
    #[serde(flatten)]
    pub comment: CommentNode,
    /// Indentation level, clamped to [`MAX_DISPLAY_DEPTH`].
    pub depth: usize,
    /// Distance from the root.
    pub true_depth: usize,
    /// Written by the viewing actor.
    pub is_mine: bool,
    pub like_count: u64,
}

pub(crate) fn upsert_node(conn: &Connection, node: &CommentNode) -> Result<()> {
    conn.execute(
        "INSERT INTO comments (actor_id, record_key, subject_uri, parent_uri, text, created_at, content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(actor_id, record_key) DO UPDATE SET
            subject_uri = excluded.subject_uri,
            parent_uri = excluded.parent_uri,
            text = excluded.text,
            created_at = excluded.created_at,
            content_hash = excluded.content_hash",
        params![
            node.actor_id,
            node.record_key,
            node.subject_uri,
            node.parent_uri,
            node.text,
            node.created_at,
            node.content_hash,
        ],
    )?;
    Ok(())
}

/// Remove a node, returning it so notifications can be retracted.
pub(crate) fn remove_node(
    conn: &Connection,
    actor_id: &str,
    record_key: &str,
) -> Result<Option<CommentNode>> {
    let node = conn
        .query_row(
            "SELECT actor_id, record_key, subject_uri, parent_uri, text, created_at, content_hash
             FROM comments WHERE actor_id = ?1 AND record_key = ?2",
            params![actor_id, record_key],
            decode_node_row,
        )
        .optional()?;
    if node.is_some() {
        conn.execute(
            "DELETE FROM comments WHERE actor_id = ?1 AND record_key = ?2",
            params![actor_id, record_key],
        )?;
    }
    Ok(node)
}

/// Every comment on `subject`, oldest first.
pub(crate) fn comments_for_subject(conn: &Connection, subject_uri: &str) -> Result<Vec<CommentNode>> {
    let mut stmt = conn.prepare_cached(
        "SELECT actor_id, record_key, subject_uri, parent_uri, text, created_at, content_hash
         FROM comments WHERE subject_uri = ?1
         ORDER BY created_at ASC, actor_id ASC, record_key ASC",
    )?;
    let rows = stmt.query_map([subject_uri], decode_node_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub(crate) fn comment_counts(conn: &Connection, subjects: &[String]) -> Result<HashMap<String, u64>> {
    let mut counts: HashMap<String, u64> = subjects.iter().map(|s| (s.clone(), 0)).collect();
    for chunk in subjects.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT subject_uri, COUNT(*) FROM comments
             WHERE subject_uri IN ({placeholders}) GROUP BY subject_uri"
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

/// Does `actor` still have a live comment on `subject`?
///
/// With `parent_owner` set, only replies to that actor's comments count.
pub(crate) fn has_live_comment(
    conn: &Connection,
    actor_id: &str,
    subject_uri: &str,
    parent_owner: Option<&str>,
) -> Result<bool> {
    let found = match parent_owner {
        None => conn
            .query_row(
                "SELECT 1 FROM comments WHERE actor_id = ?1 AND subject_uri = ?2 LIMIT 1",
                params![actor_id, subject_uri],
                |_| Ok(()),
            )
            .optional()?,
        Some(owner) => {
            let prefix = format!("at://{owner}/");
            conn.query_row(
                "SELECT 1 FROM comments
                 WHERE actor_id = ?1 AND subject_uri = ?2
                   AND substr(parent_uri, 1, length(?3)) = ?3
                 LIMIT 1",
                params![actor_id, subject_uri, prefix],
                |_| Ok(()),
            )
            .optional()?
        }
    };
    Ok(found.is_some())
}

fn decode_node_row(row: &Row<'_>) -> rusqlite::Result<CommentNode> {
    let actor_id: String = row.get(0)?;
    let record_key: String = row.get(1)?;
    let uri = AtUri::for_record(&actor_id, RecordType::Comment, &record_key).to_string();
    Ok(CommentNode {
        uri,
        actor_id,
        record_key,
        subject_uri: row.get(2)?,
        parent_uri: row.get(3)?,
        text: row.get(4)?,
        created_at: row.get(5)?,
        content_hash: row.get(6)?,
    })
}

/// Flatten a subject's comments into depth-first thread order.
///
/// Roots and siblings are ordered by creation time. A node whose parent is
/// not among `nodes` becomes a root. Parent links that form a cycle cannot
/// reach a root; such nodes are emitted as roots after everything else.
/// `like_counts` supplies per-comment counts (missing entries are 0).
#[must_use]
pub fn build_thread(
    nodes: Vec<CommentNode>,
    limit: usize,
    viewer: Option<&str>,
    like_counts: &HashMap<String, u64>,
) -> Vec<ThreadedComment> {
    let mut nodes = nodes;
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uri.cmp(&b.uri)));

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.uri.as_str(), i))
        .collect();

    let mut roots = Vec::new();
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        match node.parent_uri.as_deref().and_then(|p| index.get(p)) {
            Some(&parent) if parent != i => children.entry(parent).or_default().push(i),
            _ => roots.push(i),
        }
    }

    let mut order: Vec<(usize, usize)> = Vec::with_capacity(nodes.len().min(limit));
    let mut visited: HashSet<usize> = HashSet::with_capacity(nodes.len());

    let mut walk = |start: usize, order: &mut Vec<(usize, usize)>| {
        let mut stack = vec![(start, 0usize)];
        while let Some((i, depth)) = stack.pop() {
            if order.len() >= limit || !visited.insert(i) {
                continue;
            }
            order.push((i, depth));
            if let Some(kids) = children.get(&i) {
                // Reverse so the oldest child is popped first
                stack.extend(kids.iter().rev().map(|&kid| (kid, depth + 1)));
            }
        }
    };

    for &root in &roots {
        walk(root, &mut order);
    }
    for i in 0..nodes.len() {
        walk(i, &mut order);
    }

    let mut slots: Vec<Option<CommentNode>> = nodes.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|(i, true_depth)| {
            let comment = slots[i].take()?;
            let is_mine = viewer.is_some_and(|v| v == comment.actor_id);
            let like_count = like_counts.get(&comment.uri).copied().unwrap_or_default();
            Some(ThreadedComment {
                depth: true_depth.min(MAX_DISPLAY_DEPTH),
                true_depth,
                is_mine,
                like_count,
                comment,
            })
        })
        .collect()
}
