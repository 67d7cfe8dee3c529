use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delimiter byte wrapped around every math placeholder. Markdown text never
/// produces it, so comrak passes it through untouched.
pub const PLACEHOLDER_SENTINEL: char = '\u{1F}';

/// Whether an expression was written as `$$...$$` or `$...$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathKind {
    Block,
    Inline,
}

impl MathKind {
    pub fn delimiter(self) -> &'static str {
        match self {
            MathKind::Block => "$$",
            MathKind::Inline => "$",
        }
    }

    /// Display mode for KaTeX: block math is typeset as a standalone equation.
    pub fn is_display(self) -> bool {
        matches!(self, MathKind::Block)
    }

    pub(crate) fn placeholder_tag(self) -> &'static str {
        match self {
            MathKind::Block => "BLOCK_MATH_",
            MathKind::Inline => "INLINE_MATH_",
        }
    }

    pub(crate) fn placeholder(self, index: usize) -> String {
        format!(
            "{PLACEHOLDER_SENTINEL}{}{index}{PLACEHOLDER_SENTINEL}",
            self.placeholder_tag()
        )
    }
}

/// A math expression lifted out of the markdown before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MathBlock {
    pub kind: MathKind,
    /// Trimmed source between the delimiters.
    pub raw_content: String,
    pub placeholder: String,
}

impl MathBlock {
    /// Source re-wrapped in its original delimiters.
    pub fn delimited_source(&self) -> String {
        let delimiter = self.kind.delimiter();
        format!("{delimiter}{}{delimiter}", self.raw_content)
    }
}

/// Inbound message: render `markdown` and answer with the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub id: String,
    pub markdown: String,
}

impl RenderRequest {
    pub fn new(id: impl Into<String>, markdown: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            markdown: markdown.into(),
        }
    }
}

/// Outbound message. Serialises to `{"id", "html"}` or `{"id", "error"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenderResponse {
    Html { id: String, html: String },
    Error { id: String, error: String },
}

impl RenderResponse {
    pub fn html(id: impl Into<String>, html: impl Into<String>) -> Self {
        Self::Html {
            id: id.into(),
            html: html.into(),
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            id: id.into(),
            error: error.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RenderResponse::Html { id, .. } | RenderResponse::Error { id, .. } => id.as_str(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RenderResponse::Error { .. })
    }

    /// Split into the rendered HTML or the error message.
    pub fn into_result(self) -> Result<String, String> {
        match self {
            RenderResponse::Html { html, .. } => Ok(html),
            RenderResponse::Error { error, .. } => Err(error),
        }
    }
}

/// Pipeline-level failures. Math and grammar problems never surface here; they
/// degrade inside the document instead.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("render engine initialization failed: {message}")]
    Initialization { message: String },
    #[error("markdown parsing failed: {message}")]
    Markdown { message: String },
    #[error("render task aborted: {message}")]
    Aborted { message: String },
}

impl RenderError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    pub fn markdown(message: impl Into<String>) -> Self {
        Self::Markdown {
            message: message.into(),
        }
    }
}
