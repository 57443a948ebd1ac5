use crate::context::{CfMeta, GeoInfo, RequestContext, UaInfo};
use crate::fingerprint::{derive_session_id, new_event_id, FingerprintInput};
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::IpAddr;
use woothee::parser::Parser;

/// Raw transport metadata the TLS terminator hands the enricher alongside
/// the HTTP request (§3 `.cf`, §6 "Required transport metadata"). In a real
/// deployment these arrive as proxy-injected headers; which headers carry
/// them is a deployment detail kept out of this module's public surface.
#[derive(Debug, Clone, Default)]
pub struct TransportMeta {
    pub asn: Option<u32>,
    pub as_org: Option<String>,
    pub colo: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub continent: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub tz: Option<String>,
    pub postal: Option<String>,
    pub trust_score: Option<f64>,
    pub bot_score: Option<f64>,
    pub verified_bot: bool,
    pub http_proto: String,
    pub tls_version: Option<String>,
    pub tls_cipher: String,
}

/// C1: builds the immutable `RequestContext` every other component reads.
/// UA parsing comes from `woothee`, then Client Hints (§4.1, "more specific
/// than the coarse UA string") override device/OS/browser when present.
pub fn enrich(
    headers: &HeaderMap,
    host: &str,
    path: &str,
    query: &HashMap<String, String>,
    client_ip: IpAddr,
    transport: &TransportMeta,
) -> RequestContext {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");

    let ip = real_ip(headers).unwrap_or(client_ip).to_string();
    let user_agent = header_str("user-agent").to_string();
    let ua = parse_ua(&user_agent, headers);

    let header_order: Vec<String> = headers.keys().map(|k| k.as_str().to_string()).collect();
    let session_id = derive_session_id(&FingerprintInput {
        ip: &ip,
        tls_cipher: &transport.tls_cipher,
        http_protocol: &transport.http_proto,
        user_agent: &user_agent,
        header_order: &header_order,
        accept: header_str("accept"),
        accept_language: header_str("accept-language"),
        accept_encoding: header_str("accept-encoding"),
        sec_ch_ua: header_str("sec-ch-ua"),
        sec_ch_ua_platform: header_str("sec-ch-ua-platform"),
        sec_ch_ua_mobile: header_str("sec-ch-ua-mobile"),
        connection: header_str("connection"),
        upgrade_insecure_requests: header_str("upgrade-insecure-requests"),
    });

    let impression_id = query.get("impression_id").cloned().or_else(|| {
        headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|c| cookie_value(c, "impression_id"))
    });

    let referrer = headers
        .get("referer")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let headers_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
        .collect();

    RequestContext {
        host: host.to_string(),
        path: path.to_string(),
        query: query.clone(),
        headers: headers_map,
        ip,
        org: transport.as_org.clone(),
        referrer,
        is_embed: false,
        session_id,
        impression_id,
        ua,
        geo: GeoInfo {
            country: transport.country.clone(),
            region: transport.region.clone(),
            region_code: transport.region_code.clone(),
            city: transport.city.clone(),
            continent: transport.continent.clone(),
            lat: transport.lat,
            lon: transport.lon,
            tz: transport.tz.clone(),
            postal: transport.postal.clone(),
        },
        cf: CfMeta {
            asn: transport.asn,
            as_org: transport.as_org.clone(),
            colo: transport.colo.clone(),
            trust_score: transport.trust_score,
            bot_score: transport.bot_score,
            verified_bot: transport.verified_bot,
            http_proto: Some(transport.http_proto.clone()),
            tls_version: transport.tls_version.clone(),
            tls_cipher: Some(transport.tls_cipher.clone()),
        },
    }
}

/// `x-forwarded-for` (left-most hop) then `x-real-ip`, falling back to the
/// socket's peer address (teacher's `extract_ip` pattern, generalized).
fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = v.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// woothee's coarse classification, overridden by Client Hints when the
/// browser sent them (§4.1).
fn parse_ua(raw: &str, headers: &HeaderMap) -> UaInfo {
    let parser = Parser::new();
    let parsed = parser.parse(raw);

    let mut ua = UaInfo {
        raw: raw.to_string(),
        browser: parsed.as_ref().map(|r| r.name.to_string()),
        version: parsed.as_ref().map(|r| r.version.to_string()),
        os: parsed.as_ref().map(|r| r.os.to_string()),
        os_version: parsed.as_ref().map(|r| r.os_version.to_string()),
        device: parsed.as_ref().map(|r| r.category.to_string()),
        brand: None,
        model: None,
        arch: None,
    };

    if let Some(platform) = headers.get("sec-ch-ua-platform").and_then(|v| v.to_str().ok()) {
        let trimmed = platform.trim_matches('"');
        if !trimmed.is_empty() {
            ua.os = Some(trimmed.to_string());
        }
    }
    if let Some(mobile) = headers.get("sec-ch-ua-mobile").and_then(|v| v.to_str().ok()) {
        if mobile == "?1" {
            ua.device = Some("mobile".to_string());
        } else if mobile == "?0" {
            ua.device = Some("pc".to_string());
        }
    }
    if let Some(model) = headers.get("sec-ch-ua-model").and_then(|v| v.to_str().ok()) {
        let trimmed = model.trim_matches('"');
        if !trimmed.is_empty() {
            ua.model = Some(trimmed.to_string());
        }
    }
    if let Some(arch) = headers.get("sec-ch-ua-arch").and_then(|v| v.to_str().ok()) {
        let trimmed = arch.trim_matches('"');
        if !trimmed.is_empty() {
            ua.arch = Some(trimmed.to_string());
        }
    }
    ua
}

/// A UA-string heuristic bot signal, distinct from the transport layer's
/// `bot_score`/`verified_bot` (§4.1). Matches common crawler/bot tokens.
pub fn is_bot_ua(raw: &str) -> bool {
    const TOKENS: &[&str] = &[
        "bot", "spider", "crawl", "slurp", "bingpreview", "facebookexternalhit", "headlesschrome",
    ];
    let lower = raw.to_ascii_lowercase();
    TOKENS.iter().any(|t| lower.contains(t))
}

/// §4.1 / §4.12: prefetch/prerender requests carry `sec-purpose` or
/// `purpose` containing `prefetch`/`prerender` and are short-circuited with
/// a no-body 204 before rule matching — they produce no events.
pub fn is_speculative(headers: &HeaderMap) -> bool {
    let carries_token = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                let lower = v.to_ascii_lowercase();
                lower.contains("prefetch") || lower.contains("prerender")
            })
            .unwrap_or(false)
    };
    carries_token("sec-purpose") || carries_token("purpose")
}

/// `/track.js?url=<encoded landing url>` request shape (§4.1 "embed mode").
/// Returns the decoded target `(host, path, query)` when the request is an
/// embed request, so the caller can enrich against the *embedded* page
/// rather than the tracker script's own URL.
pub fn parse_embed_target(url_param: &str) -> Option<(String, String, HashMap<String, String>)> {
    let parsed = url::Url::parse(url_param).ok()?;
    let host = parsed.host_str()?.to_string();
    let path = parsed.path().to_string();
    let query = parsed.query_pairs().into_owned().collect();
    Some((host, path, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn forwarded_for_takes_left_most_hop() {
        let h = headers_with(&[("x-forwarded-for", "9.9.9.9, 10.0.0.1")]);
        assert_eq!(real_ip(&h), Some("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn client_hints_override_ua_os() {
        let h = headers_with(&[("sec-ch-ua-platform", "\"macOS\"")]);
        let ua = parse_ua("Mozilla/5.0 (Windows NT 10.0)", &h);
        assert_eq!(ua.os.as_deref(), Some("macOS"));
    }

    #[test]
    fn bot_ua_tokens_detected() {
        assert!(is_bot_ua("Mozilla/5.0 (compatible; Googlebot/2.1)"));
        assert!(!is_bot_ua("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15)"));
    }

    #[test]
    fn embed_target_parses_host_path_query() {
        let (host, path, query) = parse_embed_target("https://landing.example/a/b?x=1").unwrap();
        assert_eq!(host, "landing.example");
        assert_eq!(path, "/a/b");
        assert_eq!(query.get("x"), Some(&"1".to_string()));
    }

    #[test]
    fn sec_purpose_prefetch_is_speculative() {
        let h = headers_with(&[("sec-purpose", "prefetch;prerender")]);
        assert!(is_speculative(&h));
    }

    #[test]
    fn purpose_header_prefetch_is_speculative() {
        let h = headers_with(&[("purpose", "prefetch")]);
        assert!(is_speculative(&h));
    }

    #[test]
    fn ordinary_request_is_not_speculative() {
        let h = headers_with(&[("user-agent", "Mozilla/5.0")]);
        assert!(!is_speculative(&h));
    }

    #[test]
    fn cookie_value_extracted() {
        assert_eq!(cookie_value("a=1; impression_id=xyz; b=2", "impression_id"), Some("xyz".into()));
    }
}
