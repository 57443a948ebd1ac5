use crate::db::ControlDb;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the postback handler (C13) and click-out handler (C11) need about a
/// campaign's platform (§4.15).
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub platform_id: String,
    pub platform_name: String,
    pub click_id_param: String,
}

struct Entry {
    info: Option<PlatformInfo>,
    cached_at: Instant,
}

/// C15: read-through `campaignId -> PlatformInfo` cache with a long TTL
/// (platform metadata changes rarely). A miss joins `campaigns` to
/// `platforms`; campaigns without a platform cache `None`.
pub struct PlatformCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl PlatformCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub async fn resolve(&self, db: &ControlDb, campaign_id: &str) -> Option<PlatformInfo> {
        if let Some(entry) = self.entries.get(campaign_id) {
            if entry.cached_at.elapsed() < self.ttl {
                return entry.info.clone();
            }
        }

        let info = self.load(db, campaign_id).await;
        self.entries.insert(
            campaign_id.to_string(),
            Entry {
                info: info.clone(),
                cached_at: Instant::now(),
            },
        );
        info
    }

    async fn load(&self, db: &ControlDb, campaign_id: &str) -> Option<PlatformInfo> {
        let campaign = match db.get_campaign(campaign_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, campaign_id, "campaign lookup failed");
                return None;
            }
        };
        let platform_id = campaign.platform_id?;
        match db.get_platform(&platform_id).await {
            Ok(Some(p)) => Some(PlatformInfo {
                platform_id: p.id,
                platform_name: p.name,
                click_id_param: p.click_id_param,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, platform_id, "platform lookup failed");
                None
            }
        }
    }
}

pub type SharedPlatformCache = Arc<PlatformCache>;
