use crate::db::ControlDb;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cached destination lookup (§4.14). `updated_at` is the control-DB row's
/// freshness stamp; `cached_at` is local wall-clock time used for the
/// fast-path window.
#[derive(Debug, Clone)]
struct DestCacheEntry {
    url: Option<String>,
    updated_at: Option<String>,
    cached_at: Instant,
}

/// C14: read-through cache in front of `destinations`. A hit inside the
/// fast-path window is served without touching the DB at all; past that
/// window a freshness probe re-reads `updated_at` and only re-fetches the
/// URL if it changed. A DB failure caches `None` so a flapping destinations
/// table can't turn into a stampede (§4.14 "null-caching").
pub struct DestinationCache {
    entries: DashMap<String, DestCacheEntry>,
    fast_path: Duration,
}

impl DestinationCache {
    pub fn new(fast_path_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            fast_path: Duration::from_millis(fast_path_ms),
        }
    }

    /// Resolve a destination id to its URL, consulting `db` as needed.
    /// Returns `None` if the destination is missing, inactive, or the probe
    /// failed (the caller falls back per §4.14 / §7).
    pub async fn resolve(&self, db: &ControlDb, destination_id: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(destination_id) {
            if entry.cached_at.elapsed() < self.fast_path {
                return entry.url.clone();
            }
            // Past the fast path: probe freshness before trusting the cache.
            match db.get_destination(destination_id).await {
                Ok(Some(row)) if row.status == "active" => {
                    if Some(&row.updated_at) == entry.updated_at.as_ref() {
                        let url = entry.url.clone();
                        drop(entry);
                        self.touch(destination_id, url.clone(), Some(row.updated_at));
                        return url;
                    }
                    drop(entry);
                    self.touch(destination_id, Some(row.url.clone()), Some(row.updated_at));
                    return Some(row.url);
                }
                Ok(_) => {
                    drop(entry);
                    self.touch(destination_id, None, None);
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, destination_id, "destination freshness probe failed, serving stale");
                    return entry.url.clone();
                }
            }
        }

        match db.get_destination(destination_id).await {
            Ok(Some(row)) if row.status == "active" => {
                self.touch(destination_id, Some(row.url.clone()), Some(row.updated_at));
                Some(row.url)
            }
            Ok(_) => {
                self.touch(destination_id, None, None);
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, destination_id, "destination lookup failed");
                self.touch(destination_id, None, None);
                None
            }
        }
    }

    fn touch(&self, id: &str, url: Option<String>, updated_at: Option<String>) {
        self.entries.insert(
            id.to_string(),
            DestCacheEntry {
                url,
                updated_at,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub type SharedDestinationCache = Arc<DestinationCache>;

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn db_with_one_active() -> ControlDb {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        ControlDb::migrate(&pool).await.unwrap();
        sqlx::query("INSERT INTO destinations (id, user_id, url, status) VALUES ('d1','u1','https://a.example','active')")
            .execute(&pool)
            .await
            .unwrap();
        ControlDb::new(pool)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = DestinationCache::new(60_000);
        let db = db_with_one_active().await;
        assert_eq!(cache.resolve(&db, "d1").await, Some("https://a.example".into()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolve(&db, "d1").await, Some("https://a.example".into()));
    }

    #[tokio::test]
    async fn inactive_destination_caches_none() {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        ControlDb::migrate(&pool).await.unwrap();
        sqlx::query("INSERT INTO destinations (id, user_id, url, status) VALUES ('d2','u1','https://b.example','paused')")
            .execute(&pool)
            .await
            .unwrap();
        let db = ControlDb::new(pool);
        let cache = DestinationCache::new(60_000);
        assert_eq!(cache.resolve(&db, "d2").await, None);
    }

    #[tokio::test]
    async fn unknown_destination_caches_none() {
        let cache = DestinationCache::new(60_000);
        let db = db_with_one_active().await;
        assert_eq!(cache.resolve(&db, "nope").await, None);
    }
}
