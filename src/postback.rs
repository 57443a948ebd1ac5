use crate::events::{Event, EventStore};
use crate::fingerprint::new_event_id;
use std::collections::HashMap;
use std::sync::Arc;

/// §4.13: `GET /postback?clickId=...&payout=...` (plus arbitrary affiliate
/// network query params, captured verbatim as `postbackData`). Looks the
/// original click event up by its click id, mints a fresh conversion event
/// id, and emits a conversion row that carries the original click's
/// campaign/session/platform linkage forward.
pub struct PostbackRequest<'a> {
    pub click_id: &'a str,
    pub payout: Option<f64>,
    pub conversion_type: Option<&'a str>,
    pub raw_query: &'a HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PostbackError {
    #[error("unknown click id: {0}")]
    UnknownClickId(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Builds the conversion `Event` to insert; does not insert it itself so
/// callers can emit it through the same `emit_async` path as every other
/// event (§4.12, §5 "runs-to-completion").
pub async fn build_conversion_event(
    store: &dyn EventStore,
    req: &PostbackRequest<'_>,
) -> Result<Event, PostbackError> {
    let click = store
        .find_by_event_id(req.click_id)
        .await?
        .filter(|e| e.is_click)
        .ok_or_else(|| PostbackError::UnknownClickId(req.click_id.to_string()))?;

    Ok(Event {
        event_id: new_event_id(),
        session_id: click.session_id,
        campaign_id: click.campaign_id,
        is_impression: false,
        is_click: false,
        is_conversion: true,
        host: click.host,
        path: click.path,
        ip: click.ip,
        country: click.country,
        city: click.city,
        device: click.device,
        browser: click.browser,
        os: click.os,
        referrer: click.referrer,
        landing_page: click.landing_page,
        landing_page_mode: click.landing_page_mode,
        destination_url: click.destination_url,
        destination_id: click.destination_id,
        matched_flags: click.matched_flags,
        query_params: HashMap::new(),
        platform_id: click.platform_id,
        platform_click_id: click.platform_click_id,
        click_id: Some(req.click_id.to_string()),
        payout: req.payout,
        conversion_type: req.conversion_type.map(str::to_string),
        postback_data: Some(req.raw_query.clone()),
    })
}

pub fn emit_conversion(store: Arc<dyn EventStore>, event: Event) {
    crate::events::emit_async(store, event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SqlxEventStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store_with_click() -> SqlxEventStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        SqlxEventStore::migrate(&pool).await.unwrap();
        let store = SqlxEventStore::new(pool);
        let click = Event {
            event_id: "click-1".into(),
            session_id: "sess1".into(),
            campaign_id: "camp1".into(),
            is_impression: false,
            is_click: true,
            is_conversion: false,
            host: "example.com".into(),
            path: "/go".into(),
            ip: "1.2.3.4".into(),
            country: None,
            city: None,
            device: None,
            browser: None,
            os: None,
            referrer: None,
            landing_page: None,
            landing_page_mode: None,
            destination_url: Some("https://advertiser.example".into()),
            destination_id: Some("d1".into()),
            matched_flags: None,
            query_params: HashMap::new(),
            platform_id: Some("p1".into()),
            platform_click_id: Some("plat-click-1".into()),
            click_id: None,
            payout: None,
            conversion_type: None,
            postback_data: None,
        };
        store.insert(&click).await.unwrap();
        store
    }

    #[tokio::test]
    async fn builds_conversion_carrying_campaign_forward() {
        let store = store_with_click().await;
        let query = HashMap::from([("aff_sub".to_string(), "xyz".to_string())]);
        let req = PostbackRequest { click_id: "click-1", payout: Some(12.5), conversion_type: Some("sale"), raw_query: &query };
        let event = build_conversion_event(&store, &req).await.unwrap();
        assert_eq!(event.campaign_id, "camp1");
        assert!(event.is_conversion);
        assert_eq!(event.payout, Some(12.5));
        assert_eq!(event.postback_data.unwrap().get("aff_sub"), Some(&"xyz".to_string()));
    }

    #[tokio::test]
    async fn unknown_click_id_errors() {
        let store = store_with_click().await;
        let query = HashMap::new();
        let req = PostbackRequest { click_id: "nope", payout: None, conversion_type: None, raw_query: &query };
        assert!(build_conversion_event(&store, &req).await.is_err());
    }
}
