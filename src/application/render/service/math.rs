use katex::{OptsBuilder, OutputType};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::render::types::{MathBlock, MathKind, PLACEHOLDER_SENTINEL};

use super::escape::{escape_attribute, escape_html};

const KATEX_ERROR_CLASS: &str = "class=\"katex-error\"";

#[derive(Debug, Clone, Error)]
pub enum MathError {
    #[error("invalid typesetter options: {0}")]
    Options(String),
    #[error("typesetting failed: {0}")]
    Typeset(String),
}

/// Turns LaTeX source into an HTML fragment.
pub trait MathEngine: Send + Sync {
    fn typeset(&self, source: &str, kind: MathKind) -> Result<String, MathError>;

    /// Pay any one-off start-up cost before the first request.
    fn warm_up(&self) -> Result<(), MathError> {
        self.typeset("x", MathKind::Inline).map(|_| ())
    }
}

/// KaTeX through the embedded JS runtime. The runtime is created lazily per
/// thread, so warm up on the thread that renders.
#[derive(Debug, Default, Clone, Copy)]
pub struct KatexEngine;

impl MathEngine for KatexEngine {
    fn typeset(&self, source: &str, kind: MathKind) -> Result<String, MathError> {
        let mut builder = OptsBuilder::default();
        builder.display_mode(kind.is_display());
        builder.output_type(OutputType::Html);
        builder.throw_on_error(false);

        let opts = builder
            .build()
            .map_err(|err| MathError::Options(err.to_string()))?;

        let html = katex::render_with_opts(source, opts)
            .map_err(|err| MathError::Typeset(err.to_string()))?;

        // Lenient mode reports parse errors inline instead of failing.
        if html.contains(KATEX_ERROR_CLASS) {
            return Err(MathError::Typeset(format!("KaTeX could not parse `{source}`")));
        }
        Ok(html)
    }
}

/// Where a placeholder can end up after markdown parsing. Checked in
/// `PRIORITY` order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderWrapping {
    /// The placeholder was a paragraph on its own.
    Paragraph,
    /// The placeholder ended up as an inline code span.
    Code,
    Bare,
}

impl PlaceholderWrapping {
    pub const PRIORITY: [PlaceholderWrapping; 3] = [
        PlaceholderWrapping::Paragraph,
        PlaceholderWrapping::Code,
        PlaceholderWrapping::Bare,
    ];

    pub fn needle(self, placeholder: &str) -> String {
        match self {
            PlaceholderWrapping::Paragraph => format!("<p>{placeholder}</p>"),
            PlaceholderWrapping::Code => format!("<code>{placeholder}</code>"),
            PlaceholderWrapping::Bare => placeholder.to_string(),
        }
    }
}

pub struct MathRestorer<'e> {
    engine: &'e dyn MathEngine,
}

impl<'e> MathRestorer<'e> {
    pub fn new(engine: &'e dyn MathEngine) -> Self {
        Self { engine }
    }

    /// Typeset every block and splice it over its placeholder. Typesetting
    /// failures become inline error fragments.
    pub fn restore(&self, html: String, blocks: &[MathBlock]) -> String {
        blocks.iter().fold(html, |acc, block| {
            let fragment = self.render_fragment(block);
            substitute(acc, &block.placeholder, &fragment)
        })
    }

    fn render_fragment(&self, block: &MathBlock) -> String {
        match self.engine.typeset(&block.raw_content, block.kind) {
            Ok(html) => match block.kind {
                MathKind::Block => format!("<div class=\"math-display\">{html}</div>"),
                MathKind::Inline => html,
            },
            Err(err) => {
                counter!("mdworker_math_fallback_total", "kind" => kind_label(block.kind))
                    .increment(1);
                debug!(
                    target = "application::render::math",
                    kind = kind_label(block.kind),
                    error = %err,
                    "math typesetting failed; emitting source"
                );
                error_fragment(block, &err)
            }
        }
    }
}

fn substitute(mut html: String, placeholder: &str, fragment: &str) -> String {
    for wrapping in PlaceholderWrapping::PRIORITY {
        let needle = wrapping.needle(placeholder);
        if let Some(start) = html.find(&needle) {
            html.replace_range(start..start + needle.len(), fragment);
            return html;
        }
    }

    warn!(
        target = "application::render::math",
        placeholder = %placeholder.trim_matches(PLACEHOLDER_SENTINEL),
        "math placeholder missing from rendered html"
    );
    html
}

fn error_fragment(block: &MathBlock, err: &MathError) -> String {
    let tag = match block.kind {
        MathKind::Block => "div",
        MathKind::Inline => "span",
    };
    format!(
        "<{tag} class=\"math-error\" title=\"{}\">{}</{tag}>",
        escape_attribute(&err.to_string()),
        escape_html(&block.delimited_source())
    )
}

fn kind_label(kind: MathKind) -> &'static str {
    match kind {
        MathKind::Block => "block",
        MathKind::Inline => "inline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::service::extract::extract_math;

    struct Identity;

    impl MathEngine for Identity {
        fn typeset(&self, source: &str, _kind: MathKind) -> Result<String, MathError> {
            Ok(source.to_string())
        }
    }

    struct Failing;

    impl MathEngine for Failing {
        fn typeset(&self, _source: &str, _kind: MathKind) -> Result<String, MathError> {
            Err(MathError::Typeset("unexpected end of input".into()))
        }
    }

    fn block(kind: MathKind, content: &str, index: usize) -> MathBlock {
        MathBlock {
            kind,
            raw_content: content.into(),
            placeholder: kind.placeholder(index),
        }
    }

    #[test]
    fn paragraph_wrapper_is_dropped_for_display_math() {
        let math = block(MathKind::Block, "a+b", 0);
        let html = format!("<p>{}</p>\n", math.placeholder);
        let restored = MathRestorer::new(&Identity).restore(html, &[math]);
        assert_eq!(restored, "<div class=\"math-display\">a+b</div>\n");
    }

    #[test]
    fn code_wrapper_is_dropped() {
        let math = block(MathKind::Inline, "x", 0);
        let html = format!("<p>see <code>{}</code></p>", math.placeholder);
        let restored = MathRestorer::new(&Identity).restore(html, &[math]);
        assert_eq!(restored, "<p>see x</p>");
    }

    #[test]
    fn paragraph_match_takes_priority_over_bare() {
        let first = block(MathKind::Inline, "one", 0);
        let html = format!("<li>{ph}</li><p>{ph}</p>", ph = first.placeholder);
        let restored = MathRestorer::new(&Identity).restore(html, &[first.clone()]);
        assert_eq!(restored, format!("<li>{}</li>one", first.placeholder));
    }

    #[test]
    fn failures_render_escaped_source() {
        let math = block(MathKind::Block, r"\frac{1}{<", 0);
        let html = format!("<p>{}</p>", math.placeholder);
        let restored = MathRestorer::new(&Failing).restore(html, &[math]);
        assert_eq!(
            restored,
            "<div class=\"math-error\" title=\"typesetting failed: unexpected end of input\">$$\\frac{1}{&lt;$$</div>"
        );
    }

    #[test]
    fn identity_round_trip_reproduces_math_source() {
        let markdown = "Euler: $e^{i\\pi}+1=0$ and $$\\sum_{k} k$$";
        let extracted = extract_math(markdown);
        let restored = MathRestorer::new(&Identity).restore(extracted.text, &extracted.blocks);

        assert!(!restored.contains('\u{1F}'));
        assert!(restored.contains("e^{i\\pi}+1=0"));
        assert!(restored.contains("<div class=\"math-display\">\\sum_{k} k</div>"));
    }

    #[test]
    fn missing_placeholder_leaves_html_untouched() {
        let math = block(MathKind::Inline, "x", 4);
        let restored = MathRestorer::new(&Identity).restore("<p>plain</p>".into(), &[math]);
        assert_eq!(restored, "<p>plain</p>");
    }

    #[test]
    fn katex_marks_parse_errors_as_failures() {
        let err = KatexEngine
            .typeset(r"\frac{1}{", MathKind::Block)
            .expect_err("incomplete fraction");
        assert!(matches!(err, MathError::Typeset(_)));

        let html = KatexEngine
            .typeset("x^2", MathKind::Inline)
            .expect("valid math");
        assert!(html.contains("katex"));
    }
}
