mod config;
mod diagram;
mod escape;
mod extract;
mod highlight;
mod markdown;
mod math;

use std::{sync::Arc, time::Instant};

use futures::future::join_all;
use tracing::{info, warn};

use crate::application::render::types::RenderError;
use crate::config::{
    DEFAULT_CODE_MARKER_CLASS, DEFAULT_DIAGRAM_LANGUAGE, DEFAULT_FALLBACK_LANGUAGE,
    DEFAULT_THEME, RenderSettings,
};

pub use extract::{ExtractedMarkdown, extract_math};
pub use highlight::{
    FIXED_THEMES, GrammarState, Highlighter, HighlighterConfig, HighlighterError,
};
pub use markdown::MarkdownParser;
pub use math::{KatexEngine, MathEngine, MathError, MathRestorer, PlaceholderWrapping};

#[derive(Debug, Clone)]
pub struct RenderPipelineConfig {
    pub diagram_language: String,
    pub fallback_language: String,
    pub code_marker_class: String,
    pub preload_languages: Vec<String>,
    pub theme: String,
}

impl Default for RenderPipelineConfig {
    fn default() -> Self {
        Self {
            diagram_language: DEFAULT_DIAGRAM_LANGUAGE.to_string(),
            fallback_language: DEFAULT_FALLBACK_LANGUAGE.to_string(),
            code_marker_class: DEFAULT_CODE_MARKER_CLASS.to_string(),
            preload_languages: Vec::new(),
            theme: DEFAULT_THEME.to_string(),
        }
    }
}

impl From<&RenderSettings> for RenderPipelineConfig {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            diagram_language: settings.diagram_language.clone(),
            fallback_language: settings.fallback_language.clone(),
            code_marker_class: settings.code_marker_class.clone(),
            preload_languages: settings.preload_languages.clone(),
            theme: settings.theme.clone(),
        }
    }
}

impl RenderPipelineConfig {
    fn highlighter_config(&self) -> HighlighterConfig {
        HighlighterConfig {
            fallback_language: self.fallback_language.clone(),
            marker_class: self.code_marker_class.clone(),
            default_theme: self.theme.clone(),
        }
    }
}

/// The initialized extract → parse → restore pipeline.
pub struct RenderEngine {
    parser: MarkdownParser,
    math: Arc<dyn MathEngine>,
}

impl RenderEngine {
    /// Load the syntax pack off the executor, preload configured grammars and
    /// warm up the math engine on the calling thread.
    pub async fn initialize(
        config: RenderPipelineConfig,
        math: Arc<dyn MathEngine>,
    ) -> Result<Self, RenderError> {
        let started_at = Instant::now();
        let highlighter_config = config.highlighter_config();
        let highlighter = tokio::task::spawn_blocking(move || Highlighter::load(highlighter_config))
            .await
            .map_err(|err| RenderError::initialization(format!("highlighter load aborted: {err}")))?
            .map_err(|err| RenderError::initialization(err.to_string()))?;
        let highlighter = Arc::new(highlighter);

        let preloaded = join_all(
            config
                .preload_languages
                .iter()
                .map(|language| highlighter.ensure_grammar(language)),
        )
        .await;
        for (language, state) in config.preload_languages.iter().zip(preloaded) {
            if !matches!(state, GrammarState::Loaded { .. }) {
                warn!(
                    target = "application::render::engine",
                    language = %language,
                    state = ?state,
                    "preloaded grammar unavailable"
                );
            }
        }

        if let Err(err) = math.warm_up() {
            warn!(
                target = "application::render::engine",
                error = %err,
                "math engine warm-up failed"
            );
        }

        info!(
            target = "application::render::engine",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            preloaded = config.preload_languages.len(),
            "render engine ready"
        );

        Ok(Self {
            parser: MarkdownParser::new(highlighter, config.diagram_language),
            math,
        })
    }

    pub fn highlighter(&self) -> &Arc<Highlighter> {
        self.parser.highlighter()
    }

    /// Render one document. Math and grammar failures degrade in place; only
    /// markdown formatting failures surface as errors.
    pub async fn render(&self, markdown: &str) -> Result<String, RenderError> {
        let ExtractedMarkdown { text, blocks } = extract_math(markdown);
        let html = self.parser.parse(&text).await?;
        Ok(MathRestorer::new(self.math.as_ref()).restore(html, &blocks))
    }
}
