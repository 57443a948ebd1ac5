use crate::destcache::DestinationCache;
use crate::error::DispatchError;
use crate::events::EventStore;
use crate::fingerprint::new_event_id;
use crate::macros_engine::{expand, ExpandMode, MacroContextBuilder};
use crate::rules::{Rule, WeightedDest};
use crate::selector::select_destination;
use rand::RngCore;
use std::collections::HashMap;

/// §4.11 step 1: a request is a click-out if the path ends in `/click`
/// (campaign-relative click endpoints are always suffixed this way).
pub fn is_click_path(path: &str) -> bool {
    path.ends_with("/click") || path.ends_with("/click/")
}

pub struct ClickOutcome {
    pub destination_url: String,
    pub click_id: String,
    pub destination_id: Option<String>,
}

/// C11: resolve a matched rule's click destination, mint a click id, and
/// merge the inbound query string into it (§4.11 step 3: "current query
/// takes precedence" over anything already present on the destination URL).
/// `macro_ctx` should already carry the request/campaign namespaces (via
/// `MacroContextBuilder::from_context`); this function adds `click.id` last
/// so `{{click.id}}` in the destination URL resolves against the freshly
/// minted id.
///
/// §4.11 step 4: when `impression_id` names a prior impression row, its
/// stored `query_params` are recovered and merged underneath the live
/// request query (live values win on key collision) before the merge onto
/// the destination URL.
pub async fn resolve_click(
    rule: &Rule,
    dest_cache: &DestinationCache,
    db: &crate::db::ControlDb,
    events: &dyn EventStore,
    query: &HashMap<String, String>,
    impression_id: Option<&str>,
    macro_ctx: MacroContextBuilder,
    rng: &mut dyn RngCore,
) -> Result<ClickOutcome, DispatchError> {
    let click_id = new_event_id();

    let (raw_url, destination_id) = if let Some(url) = &rule.click_url {
        (url.clone(), None)
    } else if let Some(dests) = &rule.click_destinations {
        let picked = select_destination(dests, rng).ok_or_else(|| DispatchError::RuleNotFound("empty click_destinations".into()))?;
        (resolve_dest_url(picked, dest_cache, db).await?, picked.id.clone())
    } else {
        return Err(DispatchError::RuleNotFound("rule has no click action".into()));
    };

    let ctx = macro_ctx.click_id(&click_id).build();
    let expanded = expand(&raw_url, &ctx, ExpandMode::Url);
    let effective_query = recover_and_merge_query(events, impression_id, query).await;
    let merged = merge_query(&expanded, &effective_query);

    Ok(ClickOutcome {
        destination_url: merged,
        click_id,
        destination_id,
    })
}

/// Looks up the impression event by id (when present) and returns its
/// `query_params` with the live request query layered on top.
async fn recover_and_merge_query(
    events: &dyn EventStore,
    impression_id: Option<&str>,
    query: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = match impression_id {
        Some(id) => events.find_by_event_id(id).await.ok().flatten().map(|e| e.query_params).unwrap_or_default(),
        None => HashMap::new(),
    };
    merged.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

async fn resolve_dest_url(
    dest: &WeightedDest,
    dest_cache: &DestinationCache,
    db: &crate::db::ControlDb,
) -> Result<String, DispatchError> {
    if let Some(url) = &dest.url {
        return Ok(url.clone());
    }
    if let Some(id) = &dest.id {
        return dest_cache
            .resolve(db, id)
            .await
            .ok_or_else(|| DispatchError::RuleNotFound(format!("destination {id} not found")));
    }
    Err(DispatchError::RuleNotFound("destination has neither id nor url".into()))
}

/// Appends `query`'s entries onto `url`'s own query string. Keys already
/// present on `url` are overwritten by `query` (§4.11 "current query takes
/// precedence").
fn merge_query(url: &str, query: &HashMap<String, String>) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };
    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    for (k, v) in query {
        if let Some(existing) = pairs.iter_mut().find(|(ek, _)| ek == k) {
            existing.1 = v.clone();
        } else {
            pairs.push((k.clone(), v.clone()));
        }
    }
    parsed.query_pairs_mut().clear();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().extend_pairs(pairs);
    }
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use async_trait::async_trait;

    struct FakeEventStore(Option<Event>);

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn insert(&self, _event: &Event) -> Result<(), sqlx::Error> {
            Ok(())
        }
        async fn update_enrichment(&self, _event_id: &str, _enrichment: &crate::events::EnrichmentUpdate) -> Result<(), sqlx::Error> {
            Ok(())
        }
        async fn find_by_event_id(&self, _event_id: &str) -> Result<Option<Event>, sqlx::Error> {
            Ok(self.0.clone())
        }
    }

    fn impression_event(query_params: HashMap<String, String>) -> Event {
        Event {
            event_id: "imp-1".into(),
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
            landing_page: None,
            landing_page_mode: None,
            destination_url: None,
            destination_id: None,
            matched_flags: None,
            query_params,
            platform_id: None,
            platform_click_id: None,
            click_id: None,
            payout: None,
            conversion_type: None,
            postback_data: None,
        }
    }

    #[tokio::test]
    async fn recovered_query_merges_under_live_query() {
        let mut recovered = HashMap::new();
        recovered.insert("gclid".to_string(), "G123".to_string());
        recovered.insert("foo".to_string(), "stale".to_string());
        let store = FakeEventStore(Some(impression_event(recovered)));

        let mut live = HashMap::new();
        live.insert("foo".to_string(), "bar".to_string());

        let merged = recover_and_merge_query(&store, Some("imp-1"), &live).await;
        assert_eq!(merged.get("gclid"), Some(&"G123".to_string()));
        assert_eq!(merged.get("foo"), Some(&"bar".to_string()), "live query must win on conflict");
    }

    #[tokio::test]
    async fn missing_impression_falls_back_to_live_query_only() {
        let store = FakeEventStore(None);
        let mut live = HashMap::new();
        live.insert("sub1".to_string(), "abc".to_string());
        let merged = recover_and_merge_query(&store, Some("missing"), &live).await;
        assert_eq!(merged, live);
    }

    #[test]
    fn click_path_suffix_detected() {
        assert!(is_click_path("/go/campaign1/click"));
        assert!(!is_click_path("/go/campaign1"));
    }

    #[test]
    fn merge_query_overwrites_existing_and_keeps_others() {
        let mut query = HashMap::new();
        query.insert("utm_source".to_string(), "newsletter".to_string());
        let out = merge_query("https://dest.example/?utm_source=old&kept=1", &query);
        assert!(out.contains("utm_source=newsletter"));
        assert!(out.contains("kept=1"));
    }

    #[test]
    fn merge_query_adds_new_keys() {
        let mut query = HashMap::new();
        query.insert("sub1".to_string(), "abc".to_string());
        let out = merge_query("https://dest.example/path", &query);
        assert!(out.contains("sub1=abc"));
    }
}
