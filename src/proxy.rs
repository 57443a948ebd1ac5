use crate::error::DispatchError;
use crate::htmlrewrite::{rewrite_css_urls, rewrite_html};
use axum::http::HeaderMap;
use bytes::Bytes;
use std::time::Duration;
use url::Url;

/// Response headers stripped before relaying an upstream reply to the
/// client (§4.8): caching/security headers computed for the *origin*
/// response don't apply once the body has been rewritten in flight.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "content-security-policy",
    "strict-transport-security",
    "transfer-encoding",
    "content-encoding",
];

pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

/// C8: fetch the embed target with a bounded deadline (§4.8 "the fetch is
/// bounded"). A timeout surfaces as `DispatchError::UpstreamFetch` so the
/// caller can fall back to a safe page rather than hang the request.
pub async fn fetch_upstream(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<UpstreamResponse, DispatchError> {
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| DispatchError::UpstreamFetch("request timed out".to_string()))??;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = response.bytes().await?;
    Ok(UpstreamResponse { status, content_type, body })
}

/// Relative -> absolute resolution policy for rewritten URLs (§4.8): an
/// absolute URL pointing at the same host the proxy is fronting gets
/// rewritten to stay on-proxy; everything else (external hosts, absolute
/// URLs to a different origin) passes through untouched.
pub fn resolve_proxy_url(candidate: &str, base: &Url, proxy_host: &str) -> Option<String> {
    if candidate.starts_with('#') || candidate.starts_with("javascript:") || candidate.starts_with("mailto:") {
        return None;
    }
    let resolved = base.join(candidate).ok()?;
    if resolved.host_str() != Some(proxy_host) {
        return None;
    }
    let mut relative = resolved.path().to_string();
    if let Some(q) = resolved.query() {
        relative.push('?');
        relative.push_str(q);
    }
    Some(relative)
}

/// §6 `/proxy-session`: rewrites every resolvable link — regardless of host
/// — to recurse back through the same endpoint, so the client never leaves
/// the proxy. Unlike `resolve_proxy_url`, no same-host check: that's the
/// whole point of a transparent proxy session.
pub fn resolve_session_proxy_url(candidate: &str, base: &Url) -> Option<String> {
    if candidate.starts_with('#') || candidate.starts_with("javascript:") || candidate.starts_with("mailto:") {
        return None;
    }
    let resolved = base.join(candidate).ok()?;
    let encoded: String = url::form_urlencoded::byte_serialize(resolved.as_str().as_bytes()).collect();
    Some(format!("/proxy-session?url={encoded}"))
}

/// Rewrites the proxied body in place based on content type, and returns
/// the headers the caller should relay (§4.8's content-type dispatch
/// table): HTML is rewritten with `lol_html`, CSS with the `url()` scanner,
/// everything else passed through byte-for-byte. `rewrite_url` is generic
/// over the link-rewrite policy so both C8's proxy (same-host only) and
/// `/proxy-session` (every host, recursing through itself) share this.
pub fn finalize_proxied_response<F>(upstream: UpstreamResponse, rewrite_url: F) -> Result<(HeaderMap, Bytes), DispatchError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut headers = HeaderMap::new();

    let body = if upstream.content_type.starts_with("text/html") {
        let html = String::from_utf8_lossy(&upstream.body);
        let rewritten = rewrite_html(&html, &rewrite_url, |css| rewrite_css_urls(css, &rewrite_url))
            .map_err(|e| DispatchError::UpstreamFetch(e.to_string()))?;
        headers.insert("content-type", "text/html; charset=utf-8".parse().unwrap());
        Bytes::from(rewritten)
    } else if upstream.content_type.starts_with("text/css") {
        let css = String::from_utf8_lossy(&upstream.body);
        let rewritten = rewrite_css_urls(&css, &rewrite_url);
        headers.insert("content-type", "text/css; charset=utf-8".parse().unwrap());
        Bytes::from(rewritten)
    } else {
        headers.insert(
            "content-type",
            upstream.content_type.parse().unwrap_or_else(|_| "application/octet-stream".parse().unwrap()),
        );
        upstream.body
    };

    Ok((headers, body))
}

pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_resolves_against_base() {
        let base = Url::parse("https://landing.example/a/").unwrap();
        let out = resolve_proxy_url("b.html", &base, "landing.example").unwrap();
        assert_eq!(out, "/a/b.html");
    }

    #[test]
    fn external_host_is_left_alone() {
        let base = Url::parse("https://landing.example/a/").unwrap();
        assert!(resolve_proxy_url("https://cdn.other.example/x.png", &base, "landing.example").is_none());
    }

    #[test]
    fn fragment_and_mailto_are_skipped() {
        let base = Url::parse("https://landing.example/a/").unwrap();
        assert!(resolve_proxy_url("#section", &base, "landing.example").is_none());
        assert!(resolve_proxy_url("mailto:a@b.com", &base, "landing.example").is_none());
    }

    #[test]
    fn html_response_gets_rewritten_and_recontenttyped() {
        let base = Url::parse("https://landing.example/").unwrap();
        let upstream = UpstreamResponse {
            status: 200,
            content_type: "text/html".to_string(),
            body: Bytes::from(r#"<img src="/x.png">"#),
        };
        let (headers, body) = finalize_proxied_response(upstream, |u| resolve_proxy_url(u, &base, "landing.example")).unwrap();
        assert_eq!(headers.get("content-type").unwrap(), "text/html; charset=utf-8");
        assert!(String::from_utf8_lossy(&body).contains("/x.png"));
    }

    #[test]
    fn session_proxy_rewrites_external_host_too() {
        let base = Url::parse("https://landing.example/").unwrap();
        let out = resolve_session_proxy_url("https://cdn.other.example/x.png", &base).unwrap();
        assert!(out.starts_with("/proxy-session?url="));
        assert!(out.contains("cdn.other.example"));
    }

    #[test]
    fn session_proxy_resolves_relative_against_base() {
        let base = Url::parse("https://landing.example/a/").unwrap();
        let out = resolve_session_proxy_url("b.html", &base).unwrap();
        assert!(out.contains("landing.example%2Fa%2Fb.html"));
    }
}
