use crate::context::RequestContext;
use crate::rules::FlagSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Outcome of evaluating one `FlagSet` against a request: the boolean
/// verdict plus a human-readable list of which fields matched, used for
/// logging and as `matchedFlags` on click events (§4.5).
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub matched: bool,
    pub descriptors: Vec<String>,
}

/// Evaluate a rule's condition: either the single `flags` (legacy) or an OR
/// across `groups` (§4.5, §3 invariant that `groups` overrides `flags`).
/// Callers should pass `Rule::effective_condition_sets()`.
pub fn match_any(condition_sets: &[FlagSet], ctx: &RequestContext) -> MatchResult {
    let mut descriptors = Vec::new();
    for set in condition_sets {
        let r = match_flag_set(set, ctx);
        if r.matched {
            return r;
        }
        descriptors.extend(r.descriptors);
    }
    MatchResult {
        matched: false,
        descriptors,
    }
}

/// Evaluate a single `FlagSet`: every present field must match (AND across
/// fields); a list value matches if any element matches (OR within field).
pub fn match_flag_set(flags: &FlagSet, ctx: &RequestContext) -> MatchResult {
    let mut descriptors = Vec::new();

    macro_rules! check_field {
        ($field:expr, $name:literal, $matches_one:expr) => {
            if let Some(values) = &$field {
                let ok = values.iter().any(|v| $matches_one(v));
                if !ok {
                    return MatchResult {
                        matched: false,
                        descriptors,
                    };
                }
                descriptors.push(format!("{}", $name));
            }
        };
    }

    check_field!(flags.country, "country", |v: &String| ctx
        .geo
        .country
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.region, "region", |v: &String| ctx
        .geo
        .region
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.city, "city", |v: &String| ctx
        .geo
        .city
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.continent, "continent", |v: &String| ctx
        .geo
        .continent
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.asn, "asn", |v: &u32| ctx.cf.asn == Some(*v));

    check_field!(flags.colo, "colo", |v: &String| ctx
        .cf
        .colo
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.ip, "ip", |v: &String| ip_matches(v, &ctx.ip));

    check_field!(flags.org, "org", |v: &String| ctx
        .org
        .as_deref()
        .map(|o| glob_match(v, o))
        .unwrap_or(false));

    check_field!(flags.language, "language", |v: &String| {
        primary_language_subtag(ctx.headers.get("accept-language").map(|s| s.as_str()).unwrap_or(""))
            .map(|lang| lang.eq_ignore_ascii_case(v))
            .unwrap_or(false)
    });

    check_field!(flags.device, "device", |v: &String| ctx
        .ua
        .device
        .as_deref()
        .map(|d| d.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.browser, "browser", |v: &String| ctx
        .ua
        .browser
        .as_deref()
        .map(|b| b.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    check_field!(flags.os, "os", |v: &String| ctx
        .ua
        .os
        .as_deref()
        .map(|o| o.to_ascii_lowercase().contains(&v.to_ascii_lowercase()))
        .unwrap_or(false));

    check_field!(flags.brand, "brand", |v: &String| ctx
        .ua
        .brand
        .as_deref()
        .map(|b| b.eq_ignore_ascii_case(v))
        .unwrap_or(false));

    if let Some(time) = &flags.time {
        if !time_matches(time, current_utc_fractional_hour()) {
            return MatchResult {
                matched: false,
                descriptors,
            };
        }
        descriptors.push("time".to_string());
    }

    if let Some(params) = &flags.params {
        // §4.5: `params` only matches on page-like requests; on asset
        // requests it is unconditionally false.
        if !ctx.is_page_like() {
            return MatchResult {
                matched: false,
                descriptors,
            };
        }
        for (key, values) in params {
            let ok = ctx
                .query
                .get(key)
                .map(|actual| values.iter().any(|v| v == actual))
                .unwrap_or(false);
            if !ok {
                return MatchResult {
                    matched: false,
                    descriptors,
                };
            }
        }
        descriptors.push("params".to_string());
    }

    MatchResult {
        matched: true,
        descriptors,
    }
}

/// §4.5: `start <= now < end`, no past-midnight wrap (Open Question 1 —
/// flagged, not silently resolved; see DESIGN.md).
fn time_matches(range: &crate::rules::TimeRange, now_hour: f64) -> bool {
    range.start <= now_hour && now_hour < range.end
}

fn current_utc_fractional_hour() -> f64 {
    use chrono::Timelike;
    let now = chrono::Utc::now();
    now.hour() as f64 + now.minute() as f64 / 60.0 + now.second() as f64 / 3600.0
}

/// Primary subtag of an `Accept-Language` header, e.g. `en-US,fr;q=0.8` -> `en`.
fn primary_language_subtag(accept_language: &str) -> Option<String> {
    let first = accept_language.split(',').next()?.trim();
    let first = first.split(';').next()?.trim();
    let primary = first.split('-').next()?.trim();
    if primary.is_empty() {
        None
    } else {
        Some(primary.to_ascii_lowercase())
    }
}

/// `ip` predicate: exact match, CIDR (IPv4), hyphen range `a-b`, or
/// `*`-wildcard (§4.5).
pub fn ip_matches(pattern: &str, actual: &str) -> bool {
    if pattern.contains('/') {
        if let (Ok(net), Ok(addr)) = (
            ipnet::Ipv4Net::from_str(pattern),
            Ipv4Addr::from_str(actual),
        ) {
            return net.contains(&addr);
        }
        return false;
    }

    if let Some((lo, hi)) = pattern.split_once('-') {
        if let (Ok(lo), Ok(hi), Ok(addr)) = (
            Ipv4Addr::from_str(lo.trim()),
            Ipv4Addr::from_str(hi.trim()),
            Ipv4Addr::from_str(actual),
        ) {
            let lo: u32 = lo.into();
            let hi: u32 = hi.into();
            let addr: u32 = addr.into();
            return lo <= addr && addr <= hi;
        }
        return false;
    }

    if pattern.contains('*') {
        return glob_match(pattern, actual);
    }

    pattern == actual
}

/// Case-insensitive `*`-glob: `*` matches any run of characters (zero or
/// more). Used for `org`, and reused by the block filter for its wildcard
/// fields (§4.4).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let text = text.to_ascii_lowercase();
    glob_match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    // Classic two-pointer wildcard match, backtracking on '*'.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (None, 0usize);

    while ti < text.len() {
        if pi < pattern.len() && pattern[pi] == b'*' {
            star_p = Some(pi);
            star_t = ti;
            pi += 1;
        } else if pi < pattern.len() && pattern[pi] == text[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(sp) = star_p {
            pi = sp + 1;
            star_t += 1;
            ti = star_t;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CfMeta, GeoInfo, RequestContext, UaInfo};
    use crate::rules::OneOrMany;
    use std::collections::HashMap;

    fn base_ctx() -> RequestContext {
        RequestContext {
            host: "example.com".into(),
            path: "/".into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            ip: "1.2.3.4".into(),
            org: Some("Example Org".into()),
            referrer: None,
            is_embed: false,
            session_id: "abc12345".into(),
            impression_id: None,
            ua: UaInfo::default(),
            geo: GeoInfo {
                country: Some("US".into()),
                ..Default::default()
            },
            cf: CfMeta::default(),
        }
    }

    #[test]
    fn cidr_matches_within_range_not_outside() {
        assert!(ip_matches("1.2.3.0/24", "1.2.3.255"));
        assert!(!ip_matches("1.2.3.0/24", "1.2.4.0"));
    }

    #[test]
    fn hyphen_range_matches() {
        assert!(ip_matches("1.2.3.0-1.2.3.10", "1.2.3.5"));
        assert!(!ip_matches("1.2.3.0-1.2.3.10", "1.2.3.11"));
    }

    #[test]
    fn wildcard_ip_matches() {
        assert!(ip_matches("1.2.3.*", "1.2.3.200"));
        assert!(!ip_matches("1.2.3.*", "1.2.4.1"));
    }

    #[test]
    fn exact_ip_matches() {
        assert!(ip_matches("1.2.3.4", "1.2.3.4"));
        assert!(!ip_matches("1.2.3.4", "1.2.3.5"));
    }

    #[test]
    fn org_glob_case_insensitive() {
        assert!(glob_match("*example*", "An Example Org"));
        assert!(!glob_match("*nomatch*", "An Example Org"));
    }

    #[test]
    fn country_field_matches() {
        let ctx = base_ctx();
        let flags = FlagSet {
            country: Some(OneOrMany(vec!["us".into()])),
            ..Default::default()
        };
        assert!(match_flag_set(&flags, &ctx).matched);
    }

    #[test]
    fn list_value_is_or_within_field() {
        let ctx = base_ctx();
        let flags = FlagSet {
            country: Some(OneOrMany(vec!["CA".into(), "US".into()])),
            ..Default::default()
        };
        assert!(match_flag_set(&flags, &ctx).matched);
    }

    #[test]
    fn multiple_fields_are_anded() {
        let ctx = base_ctx();
        let flags = FlagSet {
            country: Some(OneOrMany(vec!["US".into()])),
            city: Some(OneOrMany(vec!["Nowhere".into()])),
            ..Default::default()
        };
        assert!(!match_flag_set(&flags, &ctx).matched);
    }

    #[test]
    fn params_does_not_match_on_asset_path() {
        let mut ctx = base_ctx();
        ctx.path = "/static/app.js".into();
        ctx.query.insert("utm".into(), "x".into());
        let mut params = HashMap::new();
        params.insert("utm".to_string(), OneOrMany(vec!["x".to_string()]));
        let flags = FlagSet {
            params: Some(params),
            ..Default::default()
        };
        assert!(!match_flag_set(&flags, &ctx).matched);
    }

    #[test]
    fn params_matches_on_page_like_path() {
        let mut ctx = base_ctx();
        ctx.path = "/".into();
        ctx.query.insert("utm".into(), "x".into());
        let mut params = HashMap::new();
        params.insert("utm".to_string(), OneOrMany(vec!["x".to_string()]));
        let flags = FlagSet {
            params: Some(params),
            ..Default::default()
        };
        assert!(match_flag_set(&flags, &ctx).matched);
    }

    #[test]
    fn os_is_substring_others_are_equality() {
        let mut ctx = base_ctx();
        ctx.ua.os = Some("Mac OS X".into());
        let flags = FlagSet {
            os: Some(OneOrMany(vec!["Mac".into()])),
            ..Default::default()
        };
        assert!(match_flag_set(&flags, &ctx).matched);
    }

    #[test]
    fn time_range_half_open() {
        let range = crate::rules::TimeRange { start: 9.0, end: 17.0 };
        assert!(time_matches(&range, 9.0));
        assert!(time_matches(&range, 16.999));
        assert!(!time_matches(&range, 17.0));
        assert!(!time_matches(&range, 8.999));
    }
}
