//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::render::FIXED_THEMES;

pub use cli::{
    CliArgs, Command, LoggingOverrides, RenderFileArgs, RenderOverrides, ServeArgs, ThemeCssArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mdworker";
const ENV_PREFIX: &str = "MDWORKER";
const DEFAULT_WORKER_INSTANCES: u32 = 1;
const MAX_WORKER_INSTANCES: u32 = 32;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_DIAGRAM_LANGUAGE: &str = "mermaid";
pub(crate) const DEFAULT_FALLBACK_LANGUAGE: &str = "text";
pub(crate) const DEFAULT_CODE_MARKER_CLASS: &str = "code-block-enhance";
pub(crate) const DEFAULT_THEME: &str = "base16-ocean.light";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub workers: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub diagram_language: String,
    pub fallback_language: String,
    pub code_marker_class: String,
    pub preload_languages: Vec<String>,
    pub theme: String,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub instances: NonZeroUsize,
    /// Caller-side wait per document; workers themselves never time out.
    pub response_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("render.preload_languages")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(args),
        Some(Command::Render(args)) => raw.apply_render_file_overrides(args),
        Some(Command::ThemeCss(args)) => {
            raw.apply_logging_overrides(&args.logging);
            if let Some(theme) = args.theme.as_ref() {
                raw.render.theme = Some(theme.clone());
            }
        }
        None => raw.apply_serve_overrides(&ServeArgs::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    render: RawRenderSettings,
    workers: RawWorkerSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, args: &ServeArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_render_overrides(&args.render);
        if let Some(instances) = args.workers_instances {
            self.workers.instances = Some(instances.into());
        }
    }

    fn apply_render_file_overrides(&mut self, args: &RenderFileArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_render_overrides(&args.render);
        if let Some(timeout) = args.response_timeout_ms {
            self.workers.response_timeout_ms = Some(timeout);
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(language) = overrides.diagram_language.as_ref() {
            self.render.diagram_language = Some(language.clone());
        }
        if let Some(language) = overrides.fallback_language.as_ref() {
            self.render.fallback_language = Some(language.clone());
        }
        if let Some(class) = overrides.code_marker_class.as_ref() {
            self.render.code_marker_class = Some(class.clone());
        }
        if !overrides.preload_languages.is_empty() {
            self.render.preload_languages = Some(overrides.preload_languages.clone());
        }
        if let Some(theme) = overrides.theme.as_ref() {
            self.render.theme = Some(theme.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            render,
            workers,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            render: build_render_settings(render)?,
            workers: build_worker_settings(workers)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let diagram_language = language_tag(
        render.diagram_language,
        DEFAULT_DIAGRAM_LANGUAGE,
        "render.diagram_language",
    )?;
    let fallback_language = language_tag(
        render.fallback_language,
        DEFAULT_FALLBACK_LANGUAGE,
        "render.fallback_language",
    )?;

    let code_marker_class = render
        .code_marker_class
        .unwrap_or_else(|| DEFAULT_CODE_MARKER_CLASS.to_string());
    if code_marker_class.trim().is_empty() || code_marker_class.contains(char::is_whitespace) {
        return Err(LoadError::invalid(
            "render.code_marker_class",
            "must be a single non-empty class name",
        ));
    }

    let preload_languages = render
        .preload_languages
        .unwrap_or_default()
        .into_iter()
        .map(|language| language.trim().to_ascii_lowercase())
        .filter(|language| !language.is_empty())
        .collect();

    let theme = render.theme.unwrap_or_else(|| DEFAULT_THEME.to_string());
    if !FIXED_THEMES.contains(&theme.as_str()) {
        return Err(LoadError::invalid(
            "render.theme",
            format!("`{theme}` is not one of {}", FIXED_THEMES.join(", ")),
        ));
    }

    Ok(RenderSettings {
        diagram_language,
        fallback_language,
        code_marker_class,
        preload_languages,
        theme,
    })
}

fn build_worker_settings(workers: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let instances_value = workers.instances.unwrap_or(DEFAULT_WORKER_INSTANCES.into());
    let instances = non_zero_u32(instances_value, "workers.instances")?;
    if instances.get() > MAX_WORKER_INSTANCES {
        return Err(LoadError::invalid(
            "workers.instances",
            format!("must not exceed {MAX_WORKER_INSTANCES}"),
        ));
    }
    let instances = usize::try_from(instances.get())
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| LoadError::invalid("workers.instances", "out of range"))?;

    let timeout_ms = workers
        .response_timeout_ms
        .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "workers.response_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(WorkerSettings {
        instances,
        response_timeout: Duration::from_millis(timeout_ms),
    })
}

fn language_tag(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let tag = value
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| default.to_string());
    if tag.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    if tag.contains(char::is_whitespace) {
        return Err(LoadError::invalid(key, "must be a single word"));
    }
    Ok(tag)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    diagram_language: Option<String>,
    fallback_language: Option<String>,
    code_marker_class: Option<String>,
    preload_languages: Option<Vec<String>>,
    theme: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    instances: Option<u64>,
    response_timeout_ms: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }

    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;

    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
