//! Reference resolution for feed pages.
//!
//! A brew points at a bean, grinder and brewer; a bean points at a roaster.
//! Resolution only ever reads the local index: targets already on the page
//! are reused, the rest are fetched one nesting level at a time with a single
//! batched lookup per level. Anything not indexed resolves as absent.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::IndexedRecord;
use crate::storage::{self, IndexStore};

/// Deepest nesting level followed from a page record.
pub const MAX_REFERENCE_DEPTH: usize = 3;

/// A record together with its resolved references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub record: IndexedRecord,
    pub references: Vec<ResolvedRef>,
}

/// One reference field of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRef {
    pub field: String,
    pub uri: String,
    /// `None` when the target is not indexed or has an unexpected type.
    pub target: Option<Box<ResolvedRecord>>,
}

/// Resolve the references of every record on a page.
///
/// The result is parallel to `page`.
pub(crate) fn resolve_references(
    conn: &Connection,
    page: &[IndexedRecord],
) -> Result<Vec<Vec<ResolvedRef>>> {
    let mut known: HashMap<String, IndexedRecord> = page
        .iter()
        .map(|record| (record.uri.clone(), record.clone()))
        .collect();

    let mut frontier: Vec<IndexedRecord> = page.to_vec();
    for _ in 0..MAX_REFERENCE_DEPTH {
        let wanted: HashSet<String> = frontier
            .iter()
            .flat_map(referenced_uris)
            .filter(|uri| !known.contains_key(uri))
            .collect();
        if wanted.is_empty() {
            break;
        }
        let wanted: Vec<String> = wanted.into_iter().collect();
        let fetched: Vec<IndexedRecord> = storage::get_records(conn, &wanted)?.into_values().collect();
        for record in &fetched {
            known.insert(record.uri.clone(), record.clone());
        }
        frontier = fetched;
    }

    Ok(page
        .iter()
        .map(|record| build_refs(record, &known, 1))
        .collect())
}

fn referenced_uris(record: &IndexedRecord) -> impl Iterator<Item = String> + '_ {
    record
        .record_type
        .reference_fields()
        .iter()
        .filter_map(|(field, _)| record.reference(field).map(str::to_string))
}

fn build_refs(
    record: &IndexedRecord,
    known: &HashMap<String, IndexedRecord>,
    depth: usize,
) -> Vec<ResolvedRef> {
    record
        .record_type
        .reference_fields()
        .iter()
        .filter_map(|&(field, expected)| {
            let uri = record.reference(field)?;
            let target = known
                .get(uri)
                .filter(|target| target.record_type == expected)
                .map(|target| {
                    let references = if depth < MAX_REFERENCE_DEPTH {
                        build_refs(target, known, depth + 1)
                    } else {
                        Vec::new()
                    };
                    Box::new(ResolvedRecord {
                        record: target.clone(),
                        references,
                    })
                });
            Some(ResolvedRef {
                field: field.to_string(),
                uri: uri.to_string(),
                target,
            })
        })
        .collect()
}

impl IndexStore {
    /// Resolve the references of a page of records.
    pub fn resolve(&self, page: &[IndexedRecord]) -> Result<Vec<ResolvedRecord>> {
        let refs = self.read(|conn| resolve_references(conn, page))?;
        Ok(page
            .iter()
            .cloned()
            .zip(refs)
            .map(|(record, references)| ResolvedRecord { record, references })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AtUri, RecordType};
    use serde_json::{Value, json};

    const ACTOR: &str = "did:plc:barista";

    fn uri(record_type: RecordType, key: &str) -> String {
        AtUri::for_record(ACTOR, record_type, key).to_string()
    }

    fn record(record_type: RecordType, key: &str, payload: Value) -> IndexedRecord {
        IndexedRecord::new(ACTOR, record_type, key, payload, None, 1)
    }

    fn store_with(records: &[IndexedRecord]) -> (tempfile::TempDir, IndexStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("resolver.db")).unwrap();
        for record in records {
            store.upsert_record(record).unwrap();
        }
        (dir, store)
    }

    fn brew() -> IndexedRecord {
        record(
            RecordType::Brew,
            "b1",
            json!({
                "beanRef": uri(RecordType::Bean, "bean1"),
                "grinderRef": {"uri": uri(RecordType::Grinder, "g1")},
                "brewerRef": uri(RecordType::Brewer, "missing"),
            }),
        )
    }

    fn find<'a>(refs: &'a [ResolvedRef], field: &str) -> &'a ResolvedRef {
        refs.iter().find(|r| r.field == field).unwrap()
    }

    #[test]
    fn nested_references_resolve_through_levels() {
        let roaster = record(RecordType::Roaster, "r1", json!({"name": "La Cabra"}));
        let bean = record(
            RecordType::Bean,
            "bean1",
            json!({"roasterRef": uri(RecordType::Roaster, "r1")}),
        );
        let grinder = record(RecordType::Grinder, "g1", json!({"name": "Comandante"}));
        let (_dir, store) = store_with(&[roaster, bean, grinder]);

        let resolved = store.resolve(&[brew()]).unwrap();
        assert_eq!(resolved.len(), 1);
        let refs = &resolved[0].references;
        assert_eq!(refs.len(), 3);

        let bean_ref = find(refs, "beanRef").target.as_ref().unwrap();
        assert_eq!(bean_ref.record.record_type, RecordType::Bean);
        let roaster_ref = find(&bean_ref.references, "roasterRef");
        assert_eq!(
            roaster_ref.target.as_ref().unwrap().record.payload["name"],
            "La Cabra"
        );

        assert!(find(refs, "grinderRef").target.is_some());
        let brewer = find(refs, "brewerRef");
        assert!(brewer.target.is_none());
        assert_eq!(brewer.uri, uri(RecordType::Brewer, "missing"));
    }

    #[test]
    fn targets_on_the_page_are_reused() {
        let (_dir, store) = store_with(&[]);
        let bean = record(RecordType::Bean, "bean1", json!({}));
        let resolved = store.resolve(&[brew(), bean]).unwrap();
        assert!(find(&resolved[0].references, "beanRef").target.is_some());
        assert!(resolved[1].references.is_empty());
    }

    #[test]
    fn type_mismatch_resolves_as_absent() {
        // beanRef pointing at a grinder record
        let grinder = record(RecordType::Grinder, "g1", json!({}));
        let (_dir, store) = store_with(&[grinder]);
        let odd = record(
            RecordType::Brew,
            "b2",
            json!({"beanRef": uri(RecordType::Grinder, "g1")}),
        );
        let resolved = store.resolve(&[odd]).unwrap();
        let refs = &resolved[0].references;
        assert_eq!(refs.len(), 1);
        assert!(refs[0].target.is_none());
    }

    #[test]
    fn records_without_reference_fields_resolve_to_nothing() {
        let (_dir, store) = store_with(&[]);
        let roaster = record(RecordType::Roaster, "r1", json!({"beanRef": "ignored"}));
        let resolved = store.resolve(&[roaster]).unwrap();
        assert!(resolved[0].references.is_empty());
    }
}
