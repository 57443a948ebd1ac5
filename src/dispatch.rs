use crate::blobstore::BlobStore;
use crate::blocklist::is_blocked;
use crate::clickout::{is_click_path, resolve_click};
use crate::context::RequestContext;
use crate::db::ControlDb;
use crate::destcache::DestinationCache;
use crate::error::{DispatchError, DispatchResult};
use crate::events::{emit_async, Event, EventStore};
use crate::fingerprint::new_event_id;
use crate::hosted::{serve_hosted, HostedRequest};
use crate::kv::KvStore;
use crate::macros_engine::MacroContextBuilder;
use crate::matcher::match_any;
use crate::modifications::apply_modifications;
use crate::platformcache::PlatformCache;
use crate::proxy::{fetch_upstream, finalize_proxied_response, resolve_proxy_url, resolve_session_proxy_url};
use crate::resolver::{resolve_bundle, resolve_default};
use crate::rules::{Action, FolderMode, Rule, RuleBundle};
use crate::selector::select_rule;
use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything a single request handler needs; constructed once in `main` and
/// shared via axum's `State` extractor.
pub struct DispatchState {
    pub kv: Arc<dyn KvStore>,
    pub db: Arc<ControlDb>,
    pub events: Arc<dyn EventStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub dest_cache: Arc<DestinationCache>,
    pub platform_cache: Arc<PlatformCache>,
    pub http: reqwest::Client,
    pub config: crate::config::DispatcherConfig,
}

/// The outcome of resolving one matched rule's primary action into a
/// concrete HTTP response. Kept separate from the handler so every branch
/// stays testable without standing up axum.
pub enum DispatchOutcome {
    Response(Response),
    NotFound,
}

/// C1-C11 composed: enrich already happened (the caller passes `ctx`),
/// this resolves the bundle, runs the block filter, matches rules, and
/// executes the winning action (§4.3 through §4.11).
pub async fn dispatch(state: &DispatchState, ctx: &RequestContext) -> DispatchResult<DispatchOutcome> {
    let bundle = match resolve_bundle(state.kv.as_ref(), &ctx.host, &ctx.path).await? {
        Some(b) => b,
        None => return Ok(DispatchOutcome::NotFound),
    };

    if let Some(blocks) = &bundle.blocks {
        if is_blocked(blocks, ctx) || ctx.is_bot() {
            return Ok(DispatchOutcome::Response(safe_page(state, &state.config.safe_page_folder).await));
        }
    } else if ctx.is_bot() {
        return Ok(DispatchOutcome::Response(safe_page(state, &state.config.safe_page_folder).await));
    }

    if is_click_path(&ctx.path) {
        return handle_click(state, ctx, &bundle).await;
    }

    let mut rng = rand::thread_rng();
    let candidates: Vec<&Rule> = bundle
        .rules
        .iter()
        .filter(|r| match_any(&r.effective_condition_sets(), ctx).matched)
        .collect();

    let picked = select_rule(&candidates, &mut rng);

    let macro_ctx = MacroContextBuilder::default()
        .from_context(ctx)
        .campaign(&bundle.id, &bundle.name)
        .site(&bundle.site_name)
        .variables(bundle.variables.as_ref().unwrap_or(&HashMap::new()));

    let response = match picked.and_then(|r| r.primary_action()) {
        Some(Action::Hosted(folder)) => {
            let macro_ctx = macro_ctx.build();
            let req = HostedRequest { folder, path: &ctx.path, user_id: None, drive_name: None };
            let hosted = serve_hosted(state.blobs.as_ref(), &req, &macro_ctx).await?;
            let resp = (StatusCode::OK, [(header::CONTENT_TYPE, hosted.content_type)], hosted.body).into_response();
            if ctx.is_page_like() {
                emit_impression(state, ctx, &bundle, Some(("hosted", folder))).await;
            }
            resp
        }
        Some(Action::Proxy(url)) => {
            let resp = proxy_response(state, url).await?;
            if ctx.is_page_like() {
                emit_impression(state, ctx, &bundle, Some(("proxy", url))).await;
            }
            resp
        }
        Some(Action::Redirect(url)) => {
            let event_id = emit_redirect_click(state, ctx, &bundle).await;
            redirect_response(ctx, &event_id, url)
        }
        Some(Action::Modifications(mods)) => {
            let origin = origin_url(ctx);
            let upstream = fetch_upstream(&state.http, &origin, Duration::from_millis(state.config.request_timeout_ms)).await?;
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
            if !status.is_success() {
                return Err(DispatchError::UpstreamStatus(status));
            }
            let html = String::from_utf8_lossy(&upstream.body);
            let rewritten = apply_modifications(&html, mods).map_err(|e| DispatchError::BlobMiss(e.to_string()))?;
            let resp = (status, [(header::CONTENT_TYPE, "text/html; charset=utf-8".to_string())], rewritten).into_response();
            if ctx.is_page_like() {
                emit_impression(state, ctx, &bundle, Some(("proxy", &origin))).await;
            }
            resp
        }
        Some(Action::Weighted(dests)) => {
            let picked_dest = crate::selector::select_destination(dests, &mut rng);
            match picked_dest.and_then(|d| d.url.clone()) {
                Some(url) => {
                    let event_id = emit_redirect_click(state, ctx, &bundle).await;
                    redirect_response(ctx, &event_id, &url)
                }
                None => default_action_response(state, ctx, &bundle, &mut rng).await?,
            }
        }
        None => default_action_response(state, ctx, &bundle, &mut rng).await?,
    };

    Ok(DispatchOutcome::Response(response))
}

async fn default_action_response(
    state: &DispatchState,
    ctx: &RequestContext,
    bundle: &RuleBundle,
    rng: &mut dyn rand::RngCore,
) -> DispatchResult<Response> {
    match resolve_default(bundle, state.dest_cache.as_ref(), state.db.as_ref(), rng).await {
        Some(resolved) => match resolved.mode {
            FolderMode::Redirect => {
                let event_id = emit_redirect_click(state, ctx, bundle).await;
                Ok(redirect_response(ctx, &event_id, &resolved.folder))
            }
            FolderMode::Proxy => {
                let resp = proxy_response(state, &resolved.folder).await?;
                if ctx.is_page_like() {
                    emit_impression(state, ctx, bundle, Some(("proxy", &resolved.folder))).await;
                }
                Ok(resp)
            }
            FolderMode::Hosted => {
                let req = HostedRequest { folder: &resolved.folder, path: "/", user_id: None, drive_name: None };
                let macro_ctx = MacroContextBuilder::default().build();
                let hosted = serve_hosted(state.blobs.as_ref(), &req, &macro_ctx).await?;
                let resp = (StatusCode::OK, [(header::CONTENT_TYPE, hosted.content_type)], hosted.body).into_response();
                if ctx.is_page_like() {
                    emit_impression(state, ctx, bundle, Some(("hosted", &resolved.folder))).await;
                }
                Ok(resp)
            }
        },
        None => Ok(safe_page(state, &state.config.safe_page_folder).await),
    }
}

/// §3 `{host}{path}[?query]`, used as the same-host fetch target for both
/// C10's origin-HTML refetch and landing-page attribution. No scheme hint
/// is carried on `RequestContext`; this assumes TLS-terminated HTTPS
/// fronting, matching every other absolute-URL construction in this crate.
fn origin_url(ctx: &RequestContext) -> String {
    let mut url = format!("https://{}{}", ctx.host, ctx.path);
    if !ctx.query.is_empty() {
        let qs = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(ctx.query.iter()).finish();
        url.push('?');
        url.push_str(&qs);
    }
    url
}

async fn proxy_response(state: &DispatchState, url: &str) -> DispatchResult<Response> {
    let base = url::Url::parse(url).map_err(|e| DispatchError::InvalidEmbedUrl(e.to_string()))?;
    let proxy_host = base.host_str().unwrap_or_default().to_string();
    let upstream = fetch_upstream(&state.http, url, Duration::from_millis(state.config.request_timeout_ms)).await?;
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
    if !status.is_success() {
        return Err(DispatchError::UpstreamStatus(status));
    }
    let (mut headers, body) = finalize_proxied_response(upstream, |u| resolve_proxy_url(u, &base, &proxy_host))?;
    crate::proxy::strip_response_headers(&mut headers);
    Ok((status, headers, Bytes::from(body)).into_response())
}

/// §6 `/proxy-session`: same bounded fetch as C8, but every link is rewritten
/// to recurse back through `/proxy-session` regardless of host.
pub async fn proxy_session_response(state: &DispatchState, url: &str) -> DispatchResult<Response> {
    let base = url::Url::parse(url).map_err(|e| DispatchError::InvalidEmbedUrl(e.to_string()))?;
    let upstream = fetch_upstream(&state.http, url, Duration::from_millis(state.config.request_timeout_ms)).await?;
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
    if !status.is_success() {
        return Err(DispatchError::UpstreamStatus(status));
    }
    let (mut headers, body) = finalize_proxied_response(upstream, |u| resolve_session_proxy_url(u, &base))?;
    crate::proxy::strip_response_headers(&mut headers);
    Ok((status, headers, Bytes::from(body)).into_response())
}

/// §4.12 "Redirect latency policy": a plain 302 when the already-captured
/// signals are detailed enough, otherwise an HTML stub that beacons
/// screen/DPR/GPU/timezone to `/t/enrich` before navigating.
fn redirect_response(ctx: &RequestContext, event_id: &str, destination: &str) -> Response {
    if ctx.signals_sufficient() {
        Redirect::temporary(destination).into_response()
    } else {
        redirect_stub_response(event_id, destination)
    }
}

fn redirect_stub_response(event_id: &str, destination: &str) -> Response {
    let dest_json = serde_json::to_string(destination).unwrap_or_else(|_| "\"\"".to_string());
    let id_json = serde_json::to_string(event_id).unwrap_or_else(|_| "\"\"".to_string());
    let html = format!(
        r#"<!doctype html><html><head><meta charset="utf-8"></head><body><script>
(function() {{
  var dest = {dest_json};
  var payload = {{
    impressionId: {id_json},
    screen: (screen.width || 0) + "x" + (screen.height || 0),
    dpr: window.devicePixelRatio || null,
    gpu: (function() {{
      try {{
        var c = document.createElement("canvas");
        var gl = c.getContext("webgl") || c.getContext("experimental-webgl");
        var info = gl && gl.getExtension("WEBGL_debug_renderer_info");
        return info ? gl.getParameter(info.UNMASKED_RENDERER_WEBGL) : null;
      }} catch (e) {{ return null; }}
    }})(),
    tz: Intl.DateTimeFormat().resolvedOptions().timeZone
  }};
  if (navigator.sendBeacon) {{
    navigator.sendBeacon("/t/enrich", JSON.stringify(payload));
  }}
  location.href = dest;
}})();
</script></body></html>"#
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/html; charset=utf-8".to_string())], html).into_response()
}

async fn handle_click(state: &DispatchState, ctx: &RequestContext, bundle: &RuleBundle) -> DispatchResult<DispatchOutcome> {
    let mut rng = rand::thread_rng();
    let candidates: Vec<&Rule> = bundle
        .rules
        .iter()
        .filter(|r| r.has_click_action() && match_any(&r.effective_condition_sets(), ctx).matched)
        .collect();

    let rule = match select_rule(&candidates, &mut rng) {
        Some(r) => r,
        None => return Ok(DispatchOutcome::Response(safe_page(state, &state.config.safe_page_folder).await)),
    };

    let macro_ctx = MacroContextBuilder::default()
        .from_context(ctx)
        .campaign(&bundle.id, &bundle.name)
        .site(&bundle.site_name);

    let outcome = resolve_click(
        rule,
        state.dest_cache.as_ref(),
        state.db.as_ref(),
        state.events.as_ref(),
        &ctx.query,
        ctx.impression_id.as_deref(),
        macro_ctx,
        &mut rng,
    )
    .await?;

    let platform = state.platform_cache.resolve(state.db.as_ref(), &bundle.id).await;
    let platform_click_id = platform
        .as_ref()
        .and_then(|p| ctx.query.get(&p.click_id_param))
        .cloned();

    let event = Event {
        event_id: new_event_id(),
        session_id: ctx.session_id.clone(),
        campaign_id: bundle.id.clone(),
        is_impression: false,
        is_click: true,
        is_conversion: false,
        host: ctx.host.clone(),
        path: ctx.path.clone(),
        ip: ctx.ip.clone(),
        country: ctx.geo.country.clone(),
        city: ctx.geo.city.clone(),
        device: ctx.ua.device.clone(),
        browser: ctx.ua.browser.clone(),
        os: ctx.ua.os.clone(),
        referrer: ctx.referrer.clone(),
        landing_page: None,
        landing_page_mode: None,
        destination_url: Some(outcome.destination_url.clone()),
        destination_id: outcome.destination_id.clone(),
        matched_flags: None,
        query_params: ctx.query.clone(),
        platform_id: platform.map(|p| p.platform_id),
        platform_click_id,
        click_id: Some(outcome.click_id),
        payout: None,
        conversion_type: None,
        postback_data: None,
    };
    emit_async(state.events.clone(), event);

    let mut response = Redirect::temporary(&outcome.destination_url).into_response();
    response.headers_mut().insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
    Ok(DispatchOutcome::Response(response))
}

/// §4.12 impression row for `hosted`/`proxy`/`modifications` actions on a
/// page-like path. `landing` is `(mode, page)` — `page` is the hosted
/// folder name for `"hosted"`, the proxied/origin URL for `"proxy"`.
async fn emit_impression(state: &DispatchState, ctx: &RequestContext, bundle: &RuleBundle, landing: Option<(&str, &str)>) {
    let platform_id = state
        .platform_cache
        .resolve(state.db.as_ref(), &bundle.id)
        .await
        .map(|p| p.platform_id);

    let (landing_page_mode, landing_page) = match landing {
        Some((mode, page)) => (Some(mode.to_string()), Some(page.to_string())),
        None => (None, None),
    };

    let event = Event {
        event_id: new_event_id(),
        session_id: ctx.session_id.clone(),
        campaign_id: bundle.id.clone(),
        is_impression: true,
        is_click: false,
        is_conversion: false,
        host: ctx.host.clone(),
        path: ctx.path.clone(),
        ip: ctx.ip.clone(),
        country: ctx.geo.country.clone(),
        city: ctx.geo.city.clone(),
        device: ctx.ua.device.clone(),
        browser: ctx.ua.browser.clone(),
        os: ctx.ua.os.clone(),
        referrer: ctx.referrer.clone(),
        landing_page,
        landing_page_mode,
        destination_url: None,
        destination_id: None,
        matched_flags: None,
        query_params: ctx.query.clone(),
        platform_id,
        platform_click_id: None,
        click_id: None,
        payout: None,
        conversion_type: None,
        postback_data: None,
    };
    emit_async(state.events.clone(), event);
}

/// §4.12's `redirect` row: "`isImpression=true AND isClick=true`, both IDs
/// equal" — a single minted id serves as both `event_id` and `click_id`.
/// Returns that id so the caller can pass it to the client-side beacon
/// payload as `impressionId` when the redirect-latency policy degrades to
/// the HTML stub.
async fn emit_redirect_click(state: &DispatchState, ctx: &RequestContext, bundle: &RuleBundle) -> String {
    let platform_id = state
        .platform_cache
        .resolve(state.db.as_ref(), &bundle.id)
        .await
        .map(|p| p.platform_id);

    let event_id = new_event_id();
    let event = Event {
        event_id: event_id.clone(),
        session_id: ctx.session_id.clone(),
        campaign_id: bundle.id.clone(),
        is_impression: true,
        is_click: true,
        is_conversion: false,
        host: ctx.host.clone(),
        path: ctx.path.clone(),
        ip: ctx.ip.clone(),
        country: ctx.geo.country.clone(),
        city: ctx.geo.city.clone(),
        device: ctx.ua.device.clone(),
        browser: ctx.ua.browser.clone(),
        os: ctx.ua.os.clone(),
        referrer: ctx.referrer.clone(),
        landing_page: None,
        landing_page_mode: Some("redirect".to_string()),
        destination_url: None,
        destination_id: None,
        matched_flags: None,
        query_params: ctx.query.clone(),
        platform_id,
        platform_click_id: None,
        click_id: Some(event_id.clone()),
        payout: None,
        conversion_type: None,
        postback_data: None,
    };
    emit_async(state.events.clone(), event);
    event_id
}

/// §4.4 / §7: the generic fallback page served for blocked/bot/unmatched
/// traffic. Serves `{folder}index.html` out of the blob store; if the
/// safe-page folder itself is missing, falls back to a minimal inline page
/// rather than erroring the whole request.
async fn safe_page(state: &DispatchState, folder: &str) -> Response {
    let req = HostedRequest { folder, path: "/", user_id: None, drive_name: None };
    let macro_ctx = MacroContextBuilder::default().build();
    match serve_hosted(state.blobs.as_ref(), &req, &macro_ctx).await {
        Ok(hosted) => (StatusCode::OK, [(header::CONTENT_TYPE, hosted.content_type)], hosted.body).into_response(),
        Err(_) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8".to_string())],
            "<!doctype html><html><body></body></html>".to_string(),
        )
            .into_response(),
    }
}

