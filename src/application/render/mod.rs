//! Markdown rendering pipeline.
//!
//! A document flows through math extraction, markdown parsing with code-block
//! highlighting, and math restoration. Workers run that pipeline off the
//! caller's thread and answer `{id, markdown}` requests with `{id, html}` or
//! `{id, error}` responses; [`RenderClient`] correlates those responses back to
//! awaiting callers.

mod engine;
mod runtime;
mod service;
mod types;
mod worker;

pub use engine::{EngineSlot, EngineState};
pub use runtime::{ClientError, RenderClient, RenderMailbox, RenderMailboxError};
pub use service::{
    ExtractedMarkdown, FIXED_THEMES, GrammarState, Highlighter, HighlighterConfig,
    HighlighterError, KatexEngine, MarkdownParser, MathEngine, MathError, MathRestorer,
    PlaceholderWrapping, RenderEngine, RenderPipelineConfig, extract_math,
};
pub use types::{
    MathBlock, MathKind, PLACEHOLDER_SENTINEL, RenderError, RenderRequest, RenderResponse,
};
pub use worker::{
    PipelineCoordinator, RenderPool, RenderSink, RenderWorker, WorkerError, WorkerMessage,
};
