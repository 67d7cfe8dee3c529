use std::sync::Arc;

use mdworker::application::render::{
    GrammarState, MathEngine, MathError, MathKind, RenderEngine, RenderPipelineConfig,
    extract_math,
};

/// Deterministic typesetter: `[<delimiter>:<source>]`, failing on a dangling group.
struct Bracketed;

impl MathEngine for Bracketed {
    fn typeset(&self, source: &str, kind: MathKind) -> Result<String, MathError> {
        if source.ends_with('{') {
            return Err(MathError::Typeset("unexpected end of input".into()));
        }
        Ok(format!("[{}:{source}]", kind.delimiter()))
    }
}

struct Identity;

impl MathEngine for Identity {
    fn typeset(&self, source: &str, _kind: MathKind) -> Result<String, MathError> {
        Ok(source.to_string())
    }
}

async fn engine(math: Arc<dyn MathEngine>) -> RenderEngine {
    RenderEngine::initialize(RenderPipelineConfig::default(), math)
        .await
        .expect("engine initializes")
}

#[tokio::test]
async fn notes_fixture_matches_expected_html() {
    let markdown = include_str!("fixtures/notes.md");
    let html = engine(Arc::new(Bracketed))
        .await
        .render(markdown)
        .await
        .expect("render succeeds");

    let expected = include_str!("fixtures/notes.html");
    assert_eq!(expected.trim_end(), html.trim_end());
}

#[tokio::test]
async fn code_fixture_highlights_known_and_falls_back_for_unknown() {
    let markdown = include_str!("fixtures/code.md");
    let engine = engine(Arc::new(Bracketed)).await;
    let html = engine.render(markdown).await.expect("render succeeds");

    assert!(html.contains("<code>echo $HOME</code>"));
    assert!(html.contains("syntax-lang-rust code-block-enhance"));
    assert!(html.contains("<span class=\"syntax-"));
    assert!(html.contains(
        "<pre class=\"syntax-highlight syntax-lang-text code-block-enhance\" data-language=\"text\"><code class=\"language-text syntax-code\">Qapla' $x$ &lt;batlh&gt;\n</code></pre>"
    ));
    assert_eq!(
        engine.highlighter().grammar_state("klingon"),
        Some(GrammarState::Unsupported)
    );
}

#[tokio::test]
async fn balanced_display_math_leaves_no_placeholders() {
    let markdown = "Intro\n\n$$\na^2 + b^2 = c^2\n$$\n\n> quoted $$x$$ inline\n";
    let html = engine(Arc::new(Identity))
        .await
        .render(markdown)
        .await
        .expect("render succeeds");

    assert!(!html.contains('\u{1F}'));
    assert!(!html.contains("BLOCK_MATH_"));
    assert!(html.contains("<div class=\"math-display\">a^2 + b^2 = c^2</div>"));
    assert!(html.contains("<div class=\"math-display\">x</div>"));
}

#[tokio::test]
async fn identity_typesetting_reproduces_math_source() {
    let sources = [r"\alpha_{i} < \beta", r"\sum_{k=0}^{n} k", "x^2"];
    let markdown = format!(
        "$${}$$\n\ntext ${}$ and ${}$",
        sources[0], sources[1], sources[2]
    );

    let extracted = extract_math(&markdown);
    let raw: Vec<_> = extracted
        .blocks
        .iter()
        .map(|block| block.raw_content.as_str())
        .collect();
    assert_eq!(raw, sources);

    let html = engine(Arc::new(Identity))
        .await
        .render(&markdown)
        .await
        .expect("render succeeds");
    for source in sources {
        assert!(html.contains(source), "{source} missing from {html}");
    }
}

#[tokio::test]
async fn diagram_source_is_escaped_exactly_once() {
    let html = engine(Arc::new(Identity))
        .await
        .render("```mermaid\nflowchart TD\n  A[\"<start>\"] --> B{a && b}\n```\n")
        .await
        .expect("render succeeds");

    assert!(html.contains("A[\"&lt;start&gt;\"] --&gt; B{a &amp;&amp; b}"));
    assert!(!html.contains("&amp;lt;"));
    assert!(!html.contains("syntax-highlight"));
}

#[tokio::test]
async fn failed_math_is_marked_in_the_document() {
    let html = engine(Arc::new(Bracketed))
        .await
        .render(r"$$\frac{1}{$$")
        .await
        .expect("math failures never fail the render");

    assert_eq!(
        html,
        "<div class=\"math-error\" title=\"typesetting failed: unexpected end of input\">$$\\frac{1}{$$</div>\n"
    );
}

#[tokio::test]
async fn simple_markdown_snapshot() {
    let html = engine(Arc::new(Bracketed))
        .await
        .render("Hello **world**, ~~bye~~ $x$")
        .await
        .expect("render succeeds");

    insta::assert_snapshot!(html.trim_end(), @"<p>Hello <strong>world</strong>, <del>bye</del> [$:x]</p>");
}

#[test]
fn extraction_separates_block_and_inline() {
    let extracted = extract_math("$$a$$ and $b$");
    let kinds: Vec<_> = extracted
        .blocks
        .iter()
        .map(|block| (block.kind, block.raw_content.as_str()))
        .collect();
    assert_eq!(kinds, vec![(MathKind::Block, "a"), (MathKind::Inline, "b")]);
}

#[test]
fn escaped_dollar_is_not_math() {
    let extracted = extract_math(r"price is \$5, formula $x$");
    assert_eq!(extracted.blocks.len(), 1);
    assert_eq!(extracted.blocks[0].kind, MathKind::Inline);
    assert_eq!(extracted.blocks[0].raw_content, "x");
    assert!(extracted.text.contains(r"\$5"));
}

#[tokio::test]
async fn fence_inside_list_item_keeps_dollars_literal() {
    let html = engine(Arc::new(Bracketed))
        .await
        .render("- ~~~\n  cost $x$\n  ~~~\n- after $y$\n")
        .await
        .expect("render succeeds");

    assert!(html.contains("cost $x$\n</code></pre>"), "{html}");
    assert!(!html.contains("[$:x]"));
    assert!(html.contains("after [$:y]"));
}

#[tokio::test]
async fn escaped_backtick_leaves_following_math_active() {
    let html = engine(Arc::new(Bracketed))
        .await
        .render(r"a \` then $x$ and `y`")
        .await
        .expect("render succeeds");

    assert_eq!(html, "<p>a ` then [$:x] and <code>y</code></p>\n");
}
