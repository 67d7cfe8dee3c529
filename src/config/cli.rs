use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mdworker binary.
#[derive(Debug, Parser)]
#[command(
    name = "mdworker",
    version,
    about = "Markdown to HTML rendering workers"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MDWORKER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Answer JSON-line render requests on stdin with JSON lines on stdout.
    Serve(Box<ServeArgs>),
    /// Render a single markdown file and print the HTML.
    Render(RenderFileArgs),
    /// Print the stylesheet for a highlighting theme.
    #[command(name = "theme-css")]
    ThemeCss(ThemeCssArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the fence language rendered as a client-side diagram.
    #[arg(long = "render-diagram-language", value_name = "LANG")]
    pub diagram_language: Option<String>,

    /// Override the language id used for unhighlighted code.
    #[arg(long = "render-fallback-language", value_name = "LANG")]
    pub fallback_language: Option<String>,

    /// Override the class added to every highlighted code block.
    #[arg(long = "render-code-marker-class", value_name = "CLASS")]
    pub code_marker_class: Option<String>,

    /// Grammar to load during start-up; repeatable.
    #[arg(long = "render-preload-language", value_name = "LANG")]
    pub preload_languages: Vec<String>,

    /// Override the highlighting theme.
    #[arg(long = "render-theme", value_name = "THEME")]
    pub theme: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the number of worker instances.
    #[arg(long = "workers-instances", value_name = "COUNT")]
    pub workers_instances: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderFileArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the per-document timeout in milliseconds.
    #[arg(long = "workers-response-timeout-ms", value_name = "MILLIS")]
    pub response_timeout_ms: Option<u64>,

    /// Markdown file to render; `-` reads stdin.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ThemeCssArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Theme to export; defaults to the configured theme.
    #[arg(long, value_name = "THEME")]
    pub theme: Option<String>,
}
