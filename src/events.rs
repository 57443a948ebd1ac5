use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;

/// One row of the unified events table (§3 `Event`). Covers impressions,
/// clicks and conversions — which fields are populated depends on which
/// action path produced it (§4.12's table).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_id: String,
    pub session_id: String,
    pub campaign_id: String,
    pub is_impression: bool,
    pub is_click: bool,
    pub is_conversion: bool,

    pub host: String,
    pub path: String,
    pub ip: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub device: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub referrer: Option<String>,

    pub landing_page: Option<String>,
    pub landing_page_mode: Option<String>,
    pub destination_url: Option<String>,
    pub destination_id: Option<String>,
    pub matched_flags: Option<Vec<String>>,
    pub query_params: HashMap<String, String>,

    pub platform_id: Option<String>,
    pub platform_click_id: Option<String>,
    pub click_id: Option<String>,
    pub payout: Option<f64>,
    pub conversion_type: Option<String>,
    pub postback_data: Option<HashMap<String, String>>,
}

impl Event {
    /// §4.12 orphan guard: emission is skipped entirely when `campaignId` is
    /// empty. Callers should check this before spawning the background
    /// insert so a failed lookup never produces a phantom row.
    pub fn is_orphan(&self) -> bool {
        self.campaign_id.is_empty()
    }
}

/// The analytics event store collaborator (§6). A unified `events` table,
/// one prepared insert statement, `ON CONFLICT(event_id) DO NOTHING` for
/// idempotency (§3 invariant (e), §8 invariant 8).
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &Event) -> Result<(), sqlx::Error>;
    async fn update_enrichment(&self, event_id: &str, enrichment: &EnrichmentUpdate) -> Result<(), sqlx::Error>;
    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<Event>, sqlx::Error>;
}

/// Best-effort enrichment payload from `POST /t/enrich` (§6).
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct EnrichmentUpdate {
    #[serde(rename = "impressionId")]
    pub impression_id: Option<String>,
    pub screen: Option<String>,
    pub dpr: Option<f64>,
    pub gpu: Option<String>,
    pub tz: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "osVersion")]
    pub os_version: Option<String>,
    pub arch: Option<String>,
}

pub struct SqlxEventStore {
    pool: SqlitePool,
}

impl SqlxEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                is_impression INTEGER NOT NULL,
                is_click INTEGER NOT NULL,
                is_conversion INTEGER NOT NULL,
                host TEXT NOT NULL,
                path TEXT NOT NULL,
                ip TEXT NOT NULL,
                country TEXT,
                city TEXT,
                device TEXT,
                browser TEXT,
                os TEXT,
                referrer TEXT,
                landing_page TEXT,
                landing_page_mode TEXT,
                destination_url TEXT,
                destination_id TEXT,
                matched_flags TEXT,
                query_params TEXT,
                platform_id TEXT,
                platform_click_id TEXT,
                click_id TEXT,
                payout REAL,
                conversion_type TEXT,
                postback_data TEXT,
                screen TEXT,
                dpr REAL,
                gpu TEXT,
                tz TEXT,
                model TEXT,
                os_version TEXT,
                arch TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqlxEventStore {
    async fn insert(&self, event: &Event) -> Result<(), sqlx::Error> {
        let matched_flags = event
            .matched_flags
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());
        let query_params = serde_json::to_string(&event.query_params).unwrap_or_default();
        let postback_data = event
            .postback_data
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());

        sqlx::query(
            "INSERT INTO events (
                event_id, session_id, campaign_id, is_impression, is_click, is_conversion,
                host, path, ip, country, city, device, browser, os, referrer,
                landing_page, landing_page_mode, destination_url, destination_id,
                matched_flags, query_params, platform_id, platform_click_id, click_id,
                payout, conversion_type, postback_data
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
             )
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(&event.session_id)
        .bind(&event.campaign_id)
        .bind(event.is_impression)
        .bind(event.is_click)
        .bind(event.is_conversion)
        .bind(&event.host)
        .bind(&event.path)
        .bind(&event.ip)
        .bind(&event.country)
        .bind(&event.city)
        .bind(&event.device)
        .bind(&event.browser)
        .bind(&event.os)
        .bind(&event.referrer)
        .bind(&event.landing_page)
        .bind(&event.landing_page_mode)
        .bind(&event.destination_url)
        .bind(&event.destination_id)
        .bind(matched_flags)
        .bind(query_params)
        .bind(&event.platform_id)
        .bind(&event.platform_click_id)
        .bind(&event.click_id)
        .bind(event.payout)
        .bind(&event.conversion_type)
        .bind(postback_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_enrichment(&self, event_id: &str, enrichment: &EnrichmentUpdate) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE events SET
                screen = COALESCE(?2, screen),
                dpr = COALESCE(?3, dpr),
                gpu = COALESCE(?4, gpu),
                tz = COALESCE(?5, tz),
                model = COALESCE(?6, model),
                os_version = COALESCE(?7, os_version),
                arch = COALESCE(?8, arch)
             WHERE event_id = ?1",
        )
        .bind(event_id)
        .bind(&enrichment.screen)
        .bind(enrichment.dpr)
        .bind(&enrichment.gpu)
        .bind(&enrichment.tz)
        .bind(&enrichment.model)
        .bind(&enrichment.os_version)
        .bind(&enrichment.arch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<Event>, sqlx::Error> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT event_id, session_id, campaign_id, is_impression, is_click, is_conversion,
                    host, path, ip, country, city, device, browser, os, referrer,
                    landing_page, landing_page_mode, destination_url, destination_id,
                    matched_flags, query_params, platform_id, platform_click_id, click_id,
                    payout, conversion_type, postback_data
             FROM events WHERE event_id = ?1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    session_id: String,
    campaign_id: String,
    is_impression: bool,
    is_click: bool,
    is_conversion: bool,
    host: String,
    path: String,
    ip: String,
    country: Option<String>,
    city: Option<String>,
    device: Option<String>,
    browser: Option<String>,
    os: Option<String>,
    referrer: Option<String>,
    landing_page: Option<String>,
    landing_page_mode: Option<String>,
    destination_url: Option<String>,
    destination_id: Option<String>,
    matched_flags: Option<String>,
    query_params: Option<String>,
    platform_id: Option<String>,
    platform_click_id: Option<String>,
    click_id: Option<String>,
    payout: Option<f64>,
    conversion_type: Option<String>,
    postback_data: Option<String>,
}

impl From<EventRow> for Event {
    fn from(r: EventRow) -> Self {
        Event {
            event_id: r.event_id,
            session_id: r.session_id,
            campaign_id: r.campaign_id,
            is_impression: r.is_impression,
            is_click: r.is_click,
            is_conversion: r.is_conversion,
            host: r.host,
            path: r.path,
            ip: r.ip,
            country: r.country,
            city: r.city,
            device: r.device,
            browser: r.browser,
            os: r.os,
            referrer: r.referrer,
            landing_page: r.landing_page,
            landing_page_mode: r.landing_page_mode,
            destination_url: r.destination_url,
            destination_id: r.destination_id,
            matched_flags: r.matched_flags.and_then(|s| serde_json::from_str(&s).ok()),
            query_params: r
                .query_params
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            platform_id: r.platform_id,
            platform_click_id: r.platform_click_id,
            click_id: r.click_id,
            payout: r.payout,
            conversion_type: r.conversion_type,
            postback_data: r.postback_data.and_then(|s| serde_json::from_str(&s).ok()),
        }
    }
}

/// Schedule `event` for a best-effort, non-blocking insert (§4.12, §5
/// "Ordering guarantees" / "runs-to-completion"). Skips silently on the
/// orphan-campaign guard; logs and swallows store failures (§7).
pub fn emit_async(store: std::sync::Arc<dyn EventStore>, event: Event) {
    if event.is_orphan() {
        tracing::debug!("event emission skipped: empty campaign id");
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = store.insert(&event).await {
            tracing::error!(error = %e, event_id = %event.event_id, "event insert failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqlxEventStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlxEventStore::migrate(&pool).await.unwrap();
        SqlxEventStore::new(pool)
    }

    fn sample_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            session_id: "sess1".into(),
            campaign_id: "camp1".into(),
            is_impression: true,
            is_click: false,
            is_conversion: false,
            host: "example.com".into(),
            path: "/".into(),
            ip: "1.2.3.4".into(),
            country: None,
            city: None,
            device: None,
            browser: None,
            os: None,
            referrer: None,
            landing_page: Some("hosted:/a".into()),
            landing_page_mode: Some("hosted".into()),
            destination_url: None,
            destination_id: None,
            matched_flags: None,
            query_params: HashMap::new(),
            platform_id: None,
            platform_click_id: None,
            click_id: None,
            payout: None,
            conversion_type: None,
            postback_data: None,
        }
    }

    #[tokio::test]
    async fn insert_then_replay_is_noop() {
        let store = test_store().await;
        let event = sample_event("evt-1");
        store.insert(&event).await.unwrap();
        // Replay with the same event_id but different payload: conflict
        // clause must keep the first row untouched.
        let mut replay = event.clone();
        replay.is_click = true;
        store.insert(&replay).await.unwrap();

        let found = store.find_by_event_id("evt-1").await.unwrap().unwrap();
        assert!(!found.is_click, "replayed insert must not have mutated the row");
    }

    #[test]
    fn orphan_campaign_is_detected() {
        let mut event = sample_event("evt-2");
        event.campaign_id = String::new();
        assert!(event.is_orphan());
    }
}
