//! Diagram fences are rendered client-side; the pipeline only hands the
//! source over in a tagged container.

use super::escape::{escape_attribute, escape_html};

pub(crate) fn is_diagram_language(language: Option<&str>, reserved: &str) -> bool {
    language.is_some_and(|lang| lang.eq_ignore_ascii_case(reserved))
}

/// Wrap diagram source for the external renderer. The renderer reads the
/// element's decoded text content, so the source is escaped exactly once.
pub(crate) fn render_diagram_container(language: &str, source: &str) -> String {
    let language = escape_attribute(&language.to_ascii_lowercase());
    format!(
        "<div class=\"{language}\" data-role=\"diagram\" data-diagram=\"{language}\">{}</div>\n",
        escape_html(source)
    )
}
