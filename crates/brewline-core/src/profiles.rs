//! Author profile cache.
//!
//! Profiles are fetched by a collaborator and handed to the cache; feed pages
//! read them back to decorate items. Entries expire after a fixed TTL and are
//! written through to the `profiles` table so a restarted process starts warm.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::records::now_micros;
use crate::storage::IndexStore;

/// Display data for an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub actor_id: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedProfile {
    profile: Profile,
    expires_at: i64,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct ProfileCache {
    store: Option<Arc<IndexStore>>,
    ttl_us: i64,
    entries: RwLock<HashMap<String, CachedProfile>>,
}

impl std::fmt::Debug for ProfileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileCache")
            .field("ttl_us", &self.ttl_us)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl ProfileCache {
    /// Memory-only cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            store: None,
            ttl_us: ttl_micros(ttl),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cache backed by the index store, pre-filled with unexpired entries.
    pub fn with_store(store: Arc<IndexStore>, ttl: Duration) -> Result<Self> {
        let now = now_micros();
        let warm = store.read(|conn| load_profiles(conn, now))?;
        debug!(profiles = warm.len(), "profile cache warmed from store");
        let entries = warm
            .into_iter()
            .map(|(profile, expires_at)| {
                (
                    profile.actor_id.clone(),
                    CachedProfile {
                        profile,
                        expires_at,
                    },
                )
            })
            .collect();
        Ok(Self {
            store: Some(store),
            ttl_us: ttl_micros(ttl),
            entries: RwLock::new(entries),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&self, profile: Profile) -> Result<()> {
        self.put_at(profile, now_micros())
    }

    /// Insert or refresh a profile as of `now_us`.
    pub fn put_at(&self, profile: Profile, now_us: i64) -> Result<()> {
        let expires_at = now_us.saturating_add(self.ttl_us);
        if let Some(store) = &self.store {
            store.write(|conn| save_profile(conn, &profile, expires_at))?;
        }
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                profile.actor_id.clone(),
                CachedProfile {
                    profile,
                    expires_at,
                },
            );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, actor_id: &str) -> Option<Profile> {
        self.get_at(actor_id, now_micros())
    }

    /// Look up a profile; expired entries are misses.
    #[must_use]
    pub fn get_at(&self, actor_id: &str, now_us: i64) -> Option<Profile> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(actor_id)
            .filter(|cached| cached.expires_at > now_us)
            .map(|cached| cached.profile.clone())
    }

    /// Profiles for many actors at once; misses are left out.
    #[must_use]
    pub fn get_many<'a>(&self, actor_ids: impl IntoIterator<Item = &'a str>) -> HashMap<String, Profile> {
        let now = now_micros();
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        actor_ids
            .into_iter()
            .filter_map(|actor| {
                entries
                    .get(actor)
                    .filter(|cached| cached.expires_at > now)
                    .map(|cached| (actor.to_string(), cached.profile.clone()))
            })
            .collect()
    }

    pub fn invalidate(&self, actor_id: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(actor_id);
        if let Some(store) = &self.store {
            store.write(|conn| delete_profile(conn, actor_id))?;
        }
        Ok(())
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(now_micros())
    }

    /// Drop every entry expired as of `now_us`, returning how many went.
    pub fn purge_expired_at(&self, now_us: i64) -> Result<usize> {
        let removed = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|_, cached| cached.expires_at > now_us);
            before - entries.len()
        };
        if let Some(store) = &self.store {
            if let Err(err) = store.write(|conn| purge_profiles(conn, now_us)) {
                warn!(error = %err, "failed to purge persisted profiles");
                return Err(err);
            }
        }
        Ok(removed)
    }
}

fn ttl_micros(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn save_profile(conn: &Connection, profile: &Profile, expires_at: i64) -> Result<()> {
    let json = serde_json::to_string(profile)?;
    conn.execute(
        "INSERT INTO profiles (actor_id, profile_json, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(actor_id) DO UPDATE SET
            profile_json = excluded.profile_json,
            expires_at = excluded.expires_at",
        params![profile.actor_id, json, expires_at],
    )?;
    Ok(())
}

fn delete_profile(conn: &Connection, actor_id: &str) -> Result<()> {
    conn.execute("DELETE FROM profiles WHERE actor_id = ?1", [actor_id])?;
    Ok(())
}

fn purge_profiles(conn: &Connection, now_us: i64) -> Result<()> {
    conn.execute("DELETE FROM profiles WHERE expires_at <= ?1", [now_us])?;
    Ok(())
}

fn load_profiles(conn: &Connection, now_us: i64) -> Result<Vec<(Profile, i64)>> {
    let mut stmt =
        conn.prepare("SELECT profile_json, expires_at FROM profiles WHERE expires_at > ?1")?;
    let rows = stmt.query_map([now_us], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut profiles = Vec::new();
    for row in rows {
        let (json, expires_at) = row?;
        match serde_json::from_str::<Profile>(&json) {
            Ok(profile) => profiles.push((profile, expires_at)),
            Err(err) => warn!(error = %err, "unreadable cached profile skipped"),
        }
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OptionalExtension;

    fn stored_profile(conn: &Connection, actor_id: &str) -> Result<Option<Profile>> {
        let json: Option<String> = conn
            .query_row(
                "SELECT profile_json FROM profiles WHERE actor_id = ?1",
                [actor_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }

    fn profile(actor: &str, name: &str) -> Profile {
        Profile {
            actor_id: actor.into(),
            handle: Some(format!("{name}.example")),
            display_name: Some(name.into()),
            avatar: None,
            description: None,
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ProfileCache::new(Duration::from_secs(10));
        cache.put_at(profile("did:plc:a", "ana"), 1_000_000).unwrap();
        assert!(cache.get_at("did:plc:a", 5_000_000).is_some());
        assert!(cache.get_at("did:plc:a", 11_000_000).is_none());
        assert!(cache.get_at("did:plc:missing", 0).is_none());

        assert_eq!(cache.purge_expired_at(11_000_000).unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = ProfileCache::new(Duration::from_secs(60));
        cache.put(profile("did:plc:a", "ana")).unwrap();
        cache.put(profile("did:plc:b", "bo")).unwrap();
        cache.invalidate("did:plc:a").unwrap();
        assert!(cache.get("did:plc:a").is_none());
        let many = cache.get_many(["did:plc:a", "did:plc:b"]);
        assert_eq!(many.len(), 1);
        assert_eq!(many["did:plc:b"].display_name.as_deref(), Some("bo"));
    }

    #[test]
    fn store_backed_cache_restarts_warm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.db");
        {
            let store = Arc::new(IndexStore::open(&path).unwrap());
            let cache = ProfileCache::with_store(Arc::clone(&store), Duration::from_secs(3600)).unwrap();
            cache.put(profile("did:plc:a", "ana")).unwrap();
            cache.put(profile("did:plc:b", "bo")).unwrap();
            cache.invalidate("did:plc:b").unwrap();
        }

        let store = Arc::new(IndexStore::open(&path).unwrap());
        let cache = ProfileCache::with_store(Arc::clone(&store), Duration::from_secs(3600)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("did:plc:a"), Some(profile("did:plc:a", "ana")));
        let stored = store.read(|conn| stored_profile(conn, "did:plc:b")).unwrap();
        assert!(stored.is_none());
    }

    #[test]
    fn expired_rows_are_not_warmed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::open(dir.path().join("profiles.db")).unwrap());
        let cache = ProfileCache::with_store(Arc::clone(&store), Duration::from_secs(1)).unwrap();
        cache.put_at(profile("did:plc:old", "old"), 0).unwrap();

        let reloaded = ProfileCache::with_store(Arc::clone(&store), Duration::from_secs(1)).unwrap();
        assert!(reloaded.is_empty());

        cache.purge_expired().unwrap();
        let stored = store.read(|conn| stored_profile(conn, "did:plc:old")).unwrap();
        assert!(stored.is_none());
    }
}
