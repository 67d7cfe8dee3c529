use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use dashmap::DashMap;
use metrics::counter;
use syntect::{
    dumps::from_uncompressed_data,
    highlighting::{Theme, ThemeSet},
    html::{ClassStyle, ClassedHTMLGenerator, css_for_theme_with_class_style},
    parsing::{SyntaxReference, SyntaxSet},
    util::LinesWithEndings,
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::escape::{escape_attribute, escape_html};

/// Themes shipped with the highlighter. Output is class-based, so a theme is
/// only needed when exporting its stylesheet.
pub const FIXED_THEMES: [&str; 3] = ["base16-ocean.light", "base16-ocean.dark", "InspiredGitHub"];

#[derive(Debug, Error)]
pub enum HighlighterError {
    #[error("syntax pack could not be decoded: {0}")]
    SyntaxPack(String),
    #[error("theme `{0}` is not available")]
    UnknownTheme(String),
    #[error("no grammar registered for `{0}`")]
    UnknownLanguage(String),
    #[error("grammar for `{language}` failed: {message}")]
    Grammar { language: String, message: String },
}

#[derive(Debug, Clone)]
pub struct HighlighterConfig {
    /// Language id used for unhighlighted output.
    pub fallback_language: String,
    /// Extra class on every `<pre>` for the client-side enhancement pass.
    pub marker_class: String,
    pub default_theme: String,
}

/// Outcome of loading a language's grammar. Cached per grammar for the
/// lifetime of the highlighter, failures included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarState {
    Loaded { name: String },
    Unsupported,
    Failed { reason: String },
}

/// Syntect-backed highlighter emitting `syntax-` prefixed CSS classes.
pub struct Highlighter {
    syntax_set: Arc<SyntaxSet>,
    themes: BTreeMap<&'static str, Theme>,
    class_style: ClassStyle,
    config: HighlighterConfig,
    grammars: DashMap<String, Arc<OnceCell<GrammarState>>>,
    loads_started: AtomicUsize,
}

impl Highlighter {
    /// Decode the syntax pack generated by `build.rs`. This is CPU-heavy;
    /// callers run it off the async executor.
    pub fn load(config: HighlighterConfig) -> Result<Self, HighlighterError> {
        let syntax_bytes = include_bytes!(env!("SYNTAX_PACK_FILE"));
        let syntax_set: SyntaxSet = from_uncompressed_data(syntax_bytes)
            .map_err(|err| HighlighterError::SyntaxPack(err.to_string()))?;

        let mut defaults = ThemeSet::load_defaults();
        let themes: BTreeMap<&'static str, Theme> = FIXED_THEMES
            .iter()
            .filter_map(|name| defaults.themes.remove(*name).map(|theme| (*name, theme)))
            .collect();
        if !themes.contains_key(config.default_theme.as_str()) {
            return Err(HighlighterError::UnknownTheme(config.default_theme));
        }

        Ok(Self {
            syntax_set: Arc::new(syntax_set),
            themes,
            class_style: ClassStyle::SpacedPrefixed { prefix: "syntax-" },
            config,
            grammars: DashMap::new(),
            loads_started: AtomicUsize::new(0),
        })
    }

    pub fn theme_names(&self) -> impl Iterator<Item = &str> {
        self.themes.keys().copied()
    }

    /// Stylesheet for one of the fixed themes, or the configured default.
    pub fn theme_css(&self, name: Option<&str>) -> Result<String, HighlighterError> {
        let name = name.unwrap_or(self.config.default_theme.as_str());
        let theme = self
            .themes
            .get(name)
            .ok_or_else(|| HighlighterError::UnknownTheme(name.to_string()))?;
        css_for_theme_with_class_style(theme, self.class_style)
            .map_err(|err| HighlighterError::UnknownTheme(format!("{name}: {err}")))
    }

    /// Number of grammar loads actually performed (not shared waits).
    pub fn grammar_loads(&self) -> usize {
        self.loads_started.load(Ordering::Relaxed)
    }

    /// Cached outcome for `language`. Languages with no grammar in the pack
    /// are always `Unsupported` and never cached.
    pub fn grammar_state(&self, language: &str) -> Option<GrammarState> {
        let Some(syntax) = find_syntax(&self.syntax_set, language) else {
            return Some(GrammarState::Unsupported);
        };
        self.grammars
            .get(syntax.name.as_str())
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Number of grammars with a cached load outcome.
    pub fn cached_grammars(&self) -> usize {
        self.grammars.len()
    }

    /// Load the grammar for `language` once. Concurrent callers asking for
    /// the same grammar wait on the same load; aliases share one entry.
    pub async fn ensure_grammar(&self, language: &str) -> GrammarState {
        let Some(syntax) = find_syntax(&self.syntax_set, language) else {
            return GrammarState::Unsupported;
        };
        let cell = Arc::clone(
            self.grammars
                .entry(syntax.name.clone())
                .or_default()
                .value(),
        );
        cell.get_or_init(|| self.load_grammar(language.to_ascii_lowercase()))
            .await
            .clone()
    }

    async fn load_grammar(&self, language: String) -> GrammarState {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let syntax_set = Arc::clone(&self.syntax_set);
        let class_style = self.class_style;
        let token = language.clone();
        let outcome =
            tokio::task::spawn_blocking(move || warm_grammar(&syntax_set, &token, class_style))
                .await;

        let state = match outcome {
            Ok(Ok(name)) => GrammarState::Loaded { name },
            Ok(Err(err)) => GrammarState::Failed {
                reason: err.to_string(),
            },
            Err(err) => GrammarState::Failed {
                reason: format!("grammar load task aborted: {err}"),
            },
        };

        match &state {
            GrammarState::Loaded { name } => {
                counter!("mdworker_grammar_load_total", "result" => "loaded").increment(1);
                debug!(
                    target = "application::render::highlight",
                    language = %language,
                    grammar = %name,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "grammar loaded"
                );
            }
            GrammarState::Failed { reason } => {
                counter!("mdworker_grammar_load_total", "result" => "failed").increment(1);
                warn!(
                    target = "application::render::highlight",
                    language = %language,
                    error = %reason,
                    "grammar load failed; falling back to plain text"
                );
            }
            GrammarState::Unsupported => {}
        }

        state
    }

    /// Render a fenced block. Never fails: unknown languages and broken
    /// grammars come back as escaped, unhighlighted code.
    pub async fn render_code(
        &self,
        code: &str,
        language: Option<&str>,
        meta: Option<&str>,
    ) -> String {
        let Some(token) = language.map(str::trim).filter(|lang| !lang.is_empty()) else {
            return self.render_plain(code, meta);
        };

        match self.ensure_grammar(token).await {
            GrammarState::Loaded { .. } => match self.highlight(code, token, meta) {
                Ok(html) => html,
                Err(err) => {
                    warn!(
                        target = "application::render::highlight",
                        language = token,
                        error = %err,
                        "highlighting failed; rendering plain code"
                    );
                    self.render_plain(code, meta)
                }
            },
            GrammarState::Unsupported | GrammarState::Failed { .. } => {
                self.render_plain(code, meta)
            }
        }
    }

    fn highlight(
        &self,
        code: &str,
        language: &str,
        meta: Option<&str>,
    ) -> Result<String, HighlighterError> {
        let syntax = find_syntax(&self.syntax_set, language)
            .ok_or_else(|| HighlighterError::UnknownLanguage(language.to_string()))?;

        let code_with_newline = with_trailing_newline(code);
        let mut generator =
            ClassedHTMLGenerator::new_with_class_style(syntax, &self.syntax_set, self.class_style);

        for line in LinesWithEndings::from(code_with_newline.as_str()) {
            generator
                .parse_html_for_line_which_includes_newline(line)
                .map_err(|err| HighlighterError::Grammar {
                    language: language.to_string(),
                    message: err.to_string(),
                })?;
        }

        Ok(self.wrap(language, meta, &generator.finalize()))
    }

    fn render_plain(&self, code: &str, meta: Option<&str>) -> String {
        let escaped = escape_html(&with_trailing_newline(code));
        self.wrap(&self.config.fallback_language, meta, &escaped)
    }

    fn wrap(&self, language: &str, meta: Option<&str>, body: &str) -> String {
        let lang = escape_attribute(&language.to_ascii_lowercase());
        let marker = escape_attribute(&self.config.marker_class);
        let meta_attr = meta
            .filter(|m| !m.is_empty())
            .map(|m| format!(" data-meta=\"{}\"", escape_attribute(m)))
            .unwrap_or_default();

        format!(
            "<pre class=\"syntax-highlight syntax-lang-{lang} {marker}\" data-language=\"{lang}\"><code class=\"language-{lang} syntax-code\"{meta_attr}>{body}</code></pre>\n"
        )
    }
}

/// Compile the grammar's regexes by highlighting an empty line.
fn warm_grammar(
    syntax_set: &SyntaxSet,
    language: &str,
    class_style: ClassStyle,
) -> Result<String, HighlighterError> {
    let syntax = find_syntax(syntax_set, language)
        .ok_or_else(|| HighlighterError::UnknownLanguage(language.to_string()))?;
    let mut generator = ClassedHTMLGenerator::new_with_class_style(syntax, syntax_set, class_style);
    generator
        .parse_html_for_line_which_includes_newline("\n")
        .map_err(|err| HighlighterError::Grammar {
            language: language.to_string(),
            message: err.to_string(),
        })?;
    Ok(syntax.name.clone())
}

fn with_trailing_newline(code: &str) -> String {
    let mut owned = code.to_string();
    if !owned.ends_with('\n') {
        owned.push('\n');
    }
    owned
}

fn find_syntax<'a>(syntax_set: &'a SyntaxSet, token: &str) -> Option<&'a SyntaxReference> {
    let lowercase = token.to_ascii_lowercase();
    syntax_set
        .find_syntax_by_token(&lowercase)
        .or_else(|| syntax_set.find_syntax_by_name(&lowercase))
        .or_else(|| syntax_set.find_syntax_by_extension(&lowercase))
}
