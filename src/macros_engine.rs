use crate::context::RequestContext;
use std::collections::HashMap;

/// All per-request macro sources materialized once, case-insensitive on
/// name (§4.7, §9 "Dynamic macro maps"). Built once per request and never
/// mutated during expansion.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
    values: HashMap<String, String>,
}

impl MacroContext {
    pub fn builder() -> MacroContextBuilder {
        MacroContextBuilder::default()
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

#[derive(Default)]
pub struct MacroContextBuilder {
    values: HashMap<String, String>,
}

impl MacroContextBuilder {
    fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    fn set_opt(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    /// Populate the `user.*`, `request.*` and `query.*` namespaces from a
    /// request context (§4.7).
    pub fn from_context(mut self, ctx: &RequestContext) -> Self {
        self = self
            .set("user.ip", ctx.ip.clone())
            .set_opt("user.city", ctx.geo.city.clone())
            .set_opt("user.country", ctx.geo.country.clone())
            .set_opt("user.continent", ctx.geo.continent.clone())
            .set_opt("user.region", ctx.geo.region.clone())
            .set_opt("user.regioncode", ctx.geo.region_code.clone())
            .set_opt("user.postalcode", ctx.geo.postal.clone())
            .set_opt("user.lat", ctx.geo.lat.map(|v| v.to_string()))
            .set_opt("user.long", ctx.geo.lon.map(|v| v.to_string()))
            .set_opt("user.timezone", ctx.geo.tz.clone())
            .set_opt("user.device", ctx.ua.device.clone())
            .set_opt("user.browser", ctx.ua.browser.clone())
            .set_opt("user.browserversion", ctx.ua.version.clone())
            .set_opt("user.os", ctx.ua.os.clone())
            .set_opt("user.osversion", ctx.ua.os_version.clone())
            .set_opt("user.brand", ctx.ua.brand.clone())
            .set_opt("user.model", ctx.ua.model.clone())
            .set_opt("user.arch", ctx.ua.arch.clone())
            .set_opt("user.bot_score", ctx.cf.bot_score.map(|v| v.to_string()))
            .set_opt("user.threat_score", ctx.cf.trust_score.map(|v| v.to_string()))
            .set("user.is_verified_bot", ctx.cf.verified_bot.to_string())
            .set_opt("user.organization", ctx.org.clone())
            .set_opt("user.referrer", ctx.referrer.clone())
            .set_opt("user.colo", ctx.cf.colo.clone())
            .set_opt("user.colo.city", ctx.geo.city.clone())
            .set_opt("user.colo.country", ctx.geo.country.clone())
            .set_opt("user.colo.region", ctx.geo.region.clone())
            .set_opt("user.colo.name", ctx.cf.colo.clone())
            .set_opt("user.asn", ctx.cf.asn.map(|v| v.to_string()))
            .set("request.domain", ctx.host.clone())
            .set("request.path", ctx.path.clone())
            .set_opt("session.id", Some(ctx.session_id.clone()))
            .set_opt("impression.id", ctx.impression_id.clone());

        for (k, v) in &ctx.query {
            let key = format!("query.{}", sanitize_query_key(k));
            self = self.set(&key, v.clone());
        }
        self
    }

    pub fn campaign(self, id: &str, name: &str) -> Self {
        self.set("campaign.id", id).set("campaign.name", name)
    }

    pub fn site(self, name: &str) -> Self {
        self.set("site.name", name)
    }

    pub fn click_id(self, id: &str) -> Self {
        self.set("click.id", id)
    }

    pub fn session_id(self, id: &str) -> Self {
        self.set("session.id", id)
    }

    pub fn impression_id(self, id: &str) -> Self {
        self.set("impression.id", id)
    }

    pub fn platform(self, id: &str, name: &str, click_id: Option<&str>) -> Self {
        let s = self.set("platform.id", id).set("platform.name", name);
        s.set_opt("platform.click_id", click_id)
    }

    /// Per-rule / per-bundle `variables`, lowest precedence (applied first
    /// so more specific `set_*` calls made afterward win ties, though in
    /// practice variable names shouldn't collide with reserved namespaces).
    pub fn variables(mut self, vars: &HashMap<String, String>) -> Self {
        for (k, v) in vars {
            self = self.set(k, v.clone());
        }
        self
    }

    pub fn build(self) -> MacroContext {
        MacroContext { values: self.values }
    }
}

/// `<k>` with non-alphanumeric/underscore chars replaced by `_`, per §4.7's
/// `query.<k>` token naming.
fn sanitize_query_key(k: &str) -> String {
    k.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Whether substituted values get percent-encoded (URL context) or inserted
/// raw (HTML/CSS context), §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandMode {
    Url,
    Raw,
}

const ESCAPE_PLACEHOLDER_PREFIX: &str = "\u{0}\u{0}MACRO_ESC\u{0}\u{0}";

/// Expand `{{name}}` tokens against `ctx`. `{{!name}}` is an escape form that
/// always survives as the literal `{{name}}` in the output, regardless of
/// whether `name` resolves. Unknown tokens are left verbatim (§4.7).
///
/// Algorithm (§4.7): protect `{{!x}}` behind a placeholder, substitute every
/// remaining `{{x}}`, then restore the placeholders to `{{x}}`.
pub fn expand(input: &str, ctx: &MacroContext, mode: ExpandMode) -> String {
    let (protected, escaped_names) = protect_escapes(input);
    let substituted = substitute_tokens(&protected, ctx, mode);
    restore_escapes(&substituted, &escaped_names)
}

fn protect_escapes(input: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(input.len());
    let mut escaped = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if input[i..].starts_with("{{!") {
            if let Some(end) = input[i..].find("}}") {
                let name = &input[i + 3..i + end];
                let idx = escaped.len();
                escaped.push(name.to_string());
                out.push_str(&format!("{ESCAPE_PLACEHOLDER_PREFIX}{idx}\u{0}\u{0}"));
                i += end + 2;
                continue;
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    (out, escaped)
}

fn substitute_tokens(input: &str, ctx: &MacroContext, mode: ExpandMode) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with("{{") {
            if let Some(end) = input[i..].find("}}") {
                let name = &input[i + 2..i + end];
                match ctx.lookup(name) {
                    Some(value) => {
                        if mode == ExpandMode::Url {
                            out.push_str(
                                &url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>(),
                            );
                        } else {
                            out.push_str(value);
                        }
                    }
                    None => out.push_str(&input[i..i + end + 2]),
                }
                i += end + 2;
                continue;
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn restore_escapes(input: &str, escaped_names: &[String]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(ESCAPE_PLACEHOLDER_PREFIX) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + ESCAPE_PLACEHOLDER_PREFIX.len()..];
        let end = after.find("\u{0}\u{0}").expect("escape placeholder must be terminated");
        let idx: usize = after[..end].parse().expect("escape placeholder index must be numeric");
        out.push_str("{{");
        out.push_str(&escaped_names[idx]);
        out.push_str("}}");
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}
