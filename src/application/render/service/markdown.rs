use std::sync::Arc;

use comrak::{
    Arena, Options, format_html,
    nodes::{AstNode, NodeHtmlBlock, NodeValue},
    parse_document,
};

use crate::application::render::types::RenderError;

use super::{
    config::default_options,
    diagram::{is_diagram_language, render_diagram_container},
    highlight::Highlighter,
};

/// GFM markdown to HTML, with code blocks routed through the highlighter and
/// diagram blocks passed through for client-side rendering.
pub struct MarkdownParser {
    options: Options<'static>,
    highlighter: Arc<Highlighter>,
    diagram_language: String,
}

impl MarkdownParser {
    pub fn new(highlighter: Arc<Highlighter>, diagram_language: impl Into<String>) -> Self {
        Self {
            options: default_options(),
            highlighter,
            diagram_language: diagram_language.into(),
        }
    }

    pub fn highlighter(&self) -> &Arc<Highlighter> {
        &self.highlighter
    }

    /// The returned future holds AST references across grammar loads and is
    /// therefore not `Send`; drive it on the thread that created it.
    pub async fn parse(&self, text: &str) -> Result<String, RenderError> {
        let arena = Arena::new();
        let root = parse_document(&arena, text, &self.options);

        for node in collect_code_blocks(root) {
            let Some((info, literal)) = extract_code_block(node) else {
                continue;
            };
            let mut segments = info.split_whitespace();
            let language = segments.next().map(str::to_string);
            let meta = segments.collect::<Vec<_>>().join(" ");

            let html = if is_diagram_language(language.as_deref(), &self.diagram_language) {
                render_diagram_container(&self.diagram_language, &literal)
            } else {
                let meta = (!meta.is_empty()).then_some(meta.as_str());
                self.highlighter
                    .render_code(&literal, language.as_deref(), meta)
                    .await
            };

            let mut data = node.data.borrow_mut();
            data.value = NodeValue::HtmlBlock(NodeHtmlBlock {
                block_type: 0,
                literal: html,
            });
        }

        let mut html = String::new();
        format_html(root, &self.options, &mut html)
            .map_err(|err| RenderError::markdown(err.to_string()))?;
        Ok(html)
    }
}

fn collect_code_blocks<'a>(root: &'a AstNode<'a>) -> Vec<&'a AstNode<'a>> {
    root.descendants()
        .filter(|node| matches!(node.data.borrow().value, NodeValue::CodeBlock(_)))
        .collect()
}

fn extract_code_block(node: &AstNode<'_>) -> Option<(String, String)> {
    let data = node.data.borrow();
    if let NodeValue::CodeBlock(block) = &data.value {
        Some((block.info.trim().to_string(), block.literal.clone()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::service::highlight::HighlighterConfig;

    fn parser() -> MarkdownParser {
        let highlighter = Highlighter::load(HighlighterConfig {
            fallback_language: "text".into(),
            marker_class: "code-block-enhance".into(),
            default_theme: "base16-ocean.light".into(),
        })
        .expect("syntax pack loads");
        MarkdownParser::new(Arc::new(highlighter), "mermaid")
    }

    #[tokio::test]
    async fn diagram_blocks_bypass_highlighting() {
        let html = parser()
            .parse("```mermaid\ngraph TD; A-->B\n```\n")
            .await
            .expect("parse");

        assert_eq!(
            html,
            "<div class=\"mermaid\" data-role=\"diagram\" data-diagram=\"mermaid\">graph TD; A--&gt;B\n</div>\n"
        );
    }

    #[tokio::test]
    async fn code_blocks_are_highlighted() {
        let html = parser()
            .parse("```rust title=\"main.rs\"\nlet x = 1;\n```\n")
            .await
            .expect("parse");

        assert!(html.contains("syntax-lang-rust code-block-enhance"));
        assert!(html.contains("data-meta=\"title=&quot;main.rs&quot;\""));
        assert!(html.contains("<span class=\"syntax-"));
    }

    #[tokio::test]
    async fn nested_code_blocks_are_rewritten() {
        let html = parser()
            .parse("> quoted\n>\n> ```\n> <b>\n> ```\n")
            .await
            .expect("parse");

        assert!(html.contains("<blockquote>"));
        assert!(html.contains("data-language=\"text\""));
        assert!(html.contains("&lt;b&gt;"));
    }

    #[tokio::test]
    async fn placeholders_survive_parsing() {
        let html = parser()
            .parse("\u{1F}BLOCK_MATH_0\u{1F}\n\nsee `\u{1F}INLINE_MATH_0\u{1F}`")
            .await
            .expect("parse");

        assert_eq!(
            html,
            "<p>\u{1F}BLOCK_MATH_0\u{1F}</p>\n<p>see <code>\u{1F}INLINE_MATH_0\u{1F}</code></p>\n"
        );
    }
}
