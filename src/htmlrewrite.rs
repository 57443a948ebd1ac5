use lol_html::{element, rewrite_str, text, RewriteStrSettings};

/// §4.8 / §4.10's tag -> attribute map: every place a URL can appear in
/// markup that the proxy rewriter and the modifications rewriter both need
/// to walk. `srcset` carries one or more `url descriptor` pairs and is
/// handled separately (`rewrite_srcset`).
const URL_ATTRS: &[(&str, &str)] = &[
    ("a", "href"),
    ("link", "href"),
    ("img", "src"),
    ("source", "src"),
    ("video", "src"),
    ("video", "poster"),
    ("audio", "src"),
    ("script", "src"),
    ("iframe", "src"),
    ("form", "action"),
];

const SRCSET_SELECTORS: &[&str] = &["img", "source"];

/// Streams `html` through `lol_html`, calling `rewrite_url` for every
/// attribute value in `URL_ATTRS` and every candidate in a `srcset` list,
/// and `rewrite_inline_css` for inline `style="..."` attributes and
/// `<style>` element bodies (§4.8).
pub fn rewrite_html(
    html: &str,
    mut rewrite_url: impl FnMut(&str) -> Option<String>,
    mut rewrite_inline_css: impl FnMut(&str) -> String,
) -> Result<String, lol_html::errors::RewritingError> {
    let mut element_handlers = Vec::new();
    for (tag, attr) in URL_ATTRS {
        let selector = format!("{tag}[{attr}]");
        element_handlers.push(element!(selector, move |el| {
            if let Some(original) = el.get_attribute(attr) {
                if let Some(rewritten) = rewrite_url(&original) {
                    el.set_attribute(attr, &rewritten)?;
                }
            }
            Ok(())
        }));
    }
    for tag in SRCSET_SELECTORS {
        let selector = format!("{tag}[srcset]");
        element_handlers.push(element!(selector, move |el| {
            if let Some(original) = el.get_attribute("srcset") {
                let rewritten = rewrite_srcset(&original, &mut rewrite_url);
                el.set_attribute("srcset", &rewritten)?;
            }
            Ok(())
        }));
    }
    element_handlers.push(element!("*[style]", move |el| {
        if let Some(style) = el.get_attribute("style") {
            let rewritten = rewrite_inline_css(&style);
            el.set_attribute("style", &rewritten)?;
        }
        Ok(())
    }));
    element_handlers.push(text!("style", move |t| {
        let rewritten = rewrite_inline_css(t.as_str());
        t.replace(&rewritten, lol_html::html_content::ContentType::Text);
        Ok(())
    }));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: element_handlers,
            ..RewriteStrSettings::new()
        },
    )
}

/// `srcset="a.png 1x, b.png 2x"` -> rewrite each URL candidate, keep its
/// descriptor (`1x`, `640w`, ...) untouched.
fn rewrite_srcset(value: &str, rewrite_url: &mut impl FnMut(&str) -> Option<String>) -> String {
    value
        .split(',')
        .map(|candidate| {
            let candidate = candidate.trim();
            let mut parts = candidate.splitn(2, char::is_whitespace);
            let url = parts.next().unwrap_or("");
            let descriptor = parts.next();
            let rewritten = rewrite_url(url).unwrap_or_else(|| url.to_string());
            match descriptor {
                Some(d) => format!("{rewritten} {d}"),
                None => rewritten,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rewrites every `url(...)` function in a CSS string or style attribute
/// (§4.8). Skips `data:` URLs. Hand-rolled scan rather than a full CSS
/// parser: `url(...)` is lexically simple enough not to need one.
pub fn rewrite_css_urls(css: &str, mut rewrite_url: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(css.len());
    let bytes = css.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if css[i..].starts_with("url(") {
            if let Some(end) = css[i + 4..].find(')') {
                let raw = css[i + 4..i + 4 + end].trim();
                let unquoted = raw.trim_matches(|c| c == '"' || c == '\'');
                if unquoted.starts_with("data:") {
                    out.push_str(&css[i..i + 4 + end + 1]);
                } else if let Some(rewritten) = rewrite_url(unquoted) {
                    out.push_str("url(\"");
                    out.push_str(&rewritten);
                    out.push_str("\")");
                } else {
                    out.push_str(&css[i..i + 4 + end + 1]);
                }
                i += 4 + end + 1;
                continue;
            }
        }
        let ch = css[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}
