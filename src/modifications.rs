use crate::rules::{ModAction, Modification, SetAttributeValue};
use lol_html::html_content::ContentType;
use lol_html::{element, rewrite_str, RewriteStrSettings};

/// C10: applies a rule's `modifications` list to an HTML document as a
/// single streaming pass (§4.10). Edits targeting the same selector are
/// independent per element; `setCss` merges into any existing inline
/// `style` rather than replacing it.
pub fn apply_modifications(html: &str, modifications: &[Modification]) -> Result<String, lol_html::errors::RewritingError> {
    let mut handlers = Vec::new();
    for m in modifications {
        let action = m.action;
        let value = m.value.clone();
        handlers.push(element!(m.selector.clone(), move |el| {
            match action {
                ModAction::SetText => {
                    if let Some(text) = value.as_str() {
                        el.set_inner_content(text, ContentType::Text);
                    }
                }
                ModAction::SetHtml => {
                    if let Some(html) = value.as_str() {
                        el.set_inner_content(html, ContentType::Html);
                    }
                }
                ModAction::SetCss => {
                    if let Some(css) = value.as_str() {
                        let merged = merge_style(el.get_attribute("style").as_deref(), css);
                        el.set_attribute("style", &merged)?;
                    }
                }
                ModAction::SetAttribute => {
                    if let Ok(attr) = serde_json::from_value::<SetAttributeValue>(value.clone()) {
                        el.set_attribute(&attr.name, &attr.value)?;
                    }
                }
                ModAction::Remove => {
                    el.remove();
                }
            }
            Ok(())
        }));
    }

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::new()
        },
    )
}

/// `setCss` appends declarations to whatever inline style the element
/// already carries, separated by `;`, rather than clobbering it (§4.10).
fn merge_style(existing: Option<&str>, addition: &str) -> String {
    match existing {
        Some(existing) if !existing.trim().is_empty() => {
            let trimmed = existing.trim_end().trim_end_matches(';');
            format!("{trimmed}; {addition}")
        }
        _ => addition.to_string(),
    }
}
