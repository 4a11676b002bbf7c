//! Aggregation engine: like counts, comment threads and notifications.
//!
//! Every table here is derived from like and comment records and is updated
//! inside the same transaction that writes or removes the record, so a crash
//! can never leave a counter out of step with its edges.
//!
//! ```text
//!   like record ──▶ likes ──▶ like_counts
//!        └───────────────────▶ notifications (like)
//!   comment record ──▶ comments
//!        ├───────────────────▶ notifications (comment → subject owner)
//!        └───────────────────▶ notifications (reply → parent author)
//! ```

pub mod comments;
pub mod likes;
pub mod notifications;

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use crate::records::{IndexedRecord, RecordType, uri_owner};

use comments::CommentNode;
use likes::EdgeRemoval;
use notifications::NotificationKind;

/// Derive aggregates from a freshly written record.
pub(crate) fn on_written(conn: &Connection, record: &IndexedRecord) -> Result<()> {
    match record.record_type {
        RecordType::Like => {
            let Some(subject) = record.reference("subject") else {
                debug!(uri = %record.uri, "like without subject, not aggregated");
                return Ok(());
            };
            if likes::insert_edge(
                conn,
                subject,
                &record.actor_id,
                &record.record_key,
                record.created_at,
            )? {
                if let Some(owner) = uri_owner(subject) {
                    notifications::insert(
                        conn,
                        owner,
                        NotificationKind::Like,
                        &record.actor_id,
                        subject,
                        record.created_at,
                    )?;
                }
            }
        }
        RecordType::Comment => {
            let Some(node) = CommentNode::from_record(record) else {
                debug!(uri = %record.uri, "comment without subject, not aggregated");
                return Ok(());
            };
            comments::upsert_node(conn, &node)?;
            notify_comment(conn, &node)?;
        }
        RecordType::Roaster
        | RecordType::Bean
        | RecordType::Grinder
        | RecordType::Brewer
        | RecordType::Brew => {}
    }
    Ok(())
}

/// Undo the aggregates of record `(actor, type, key)`.
///
/// Works from the edge and node tables alone, so it is safe to call whether
/// or not the record itself is still indexed.
pub(crate) fn on_removed(
    conn: &Connection,
    actor_id: &str,
    record_type: RecordType,
    record_key: &str,
) -> Result<()> {
    match record_type {
        RecordType::Like => {
            if let EdgeRemoval::Removed { subject_uri } =
                likes::remove_edge(conn, actor_id, record_key)?
            {
                if let Some(owner) = uri_owner(&subject_uri) {
                    notifications::retract(
                        conn,
                        owner,
                        NotificationKind::Like,
                        actor_id,
                        &subject_uri,
                    )?;
                }
            }
        }
        RecordType::Comment => {
            if let Some(node) = comments::remove_node(conn, actor_id, record_key)? {
                retract_comment(conn, &node)?;
            }
        }
        RecordType::Roaster
        | RecordType::Bean
        | RecordType::Grinder
        | RecordType::Brewer
        | RecordType::Brew => {}
    }
    Ok(())
}

fn notify_comment(conn: &Connection, node: &CommentNode) -> Result<()> {
    if let Some(owner) = uri_owner(&node.subject_uri) {
        notifications::insert(
            conn,
            owner,
            NotificationKind::Comment,
            &node.actor_id,
            &node.subject_uri,
            node.created_at,
        )?;
    }
    if let Some(parent_owner) = node.parent_uri.as_deref().and_then(uri_owner) {
        notifications::insert(
            conn,
            parent_owner,
            NotificationKind::Reply,
            &node.actor_id,
            &node.subject_uri,
            node.created_at,
        )?;
    }
    Ok(())
}

/// Retract a removed comment's notifications unless another live comment by
/// the same actor still accounts for them.
fn retract_comment(conn: &Connection, node: &CommentNode) -> Result<()> {
    if let Some(owner) = uri_owner(&node.subject_uri) {
        if !comments::has_live_comment(conn, &node.actor_id, &node.subject_uri, None)? {
            notifications::retract(
                conn,
                owner,
                NotificationKind::Comment,
                &node.actor_id,
                &node.subject_uri,
            )?;
        }
    }
    if let Some(parent_owner) = node.parent_uri.as_deref().and_then(uri_owner) {
        if !comments::has_live_comment(
            conn,
            &node.actor_id,
            &node.subject_uri,
            Some(parent_owner),
        )? {
            notifications::retract(
                conn,
                parent_owner,
                NotificationKind::Reply,
                &node.actor_id,
                &node.subject_uri,
            )?;
        }
    }
    Ok(())
}
