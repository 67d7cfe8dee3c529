use std::{path::Path, process, sync::Arc};

use mdworker::{
    application::{
        error::AppError,
        render::{
            Highlighter, HighlighterConfig, KatexEngine, RenderClient, RenderPipelineConfig,
            RenderPool, RenderWorker,
        },
    },
    config,
    infra::{error::InfraError, telemetry},
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.messages().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::ThemeCss(_) => run_theme_css(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (pool, mut responses) = RenderPool::spawn(
        settings.workers.instances,
        RenderPipelineConfig::from(&settings.render),
        Arc::new(KatexEngine),
    )?;
    pool.initialize().await?;
    info!(
        target = "mdworker::serve",
        instances = pool.len(),
        "accepting render requests on stdin"
    );

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = responses.recv().await {
            let mut line = serde_json::to_string(&response)
                .map_err(|err| AppError::unexpected(format!("failed to encode response: {err}")))?;
            line.push('\n');
            stdout
                .write_all(line.as_bytes())
                .await
                .map_err(InfraError::from)?;
            stdout.flush().await.map_err(InfraError::from)?;
        }
        Ok::<(), AppError>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(InfraError::from)? {
        if line.trim().is_empty() {
            continue;
        }
        pool.submit_raw(line)?;
    }

    info!(
        target = "mdworker::serve",
        "stdin closed; draining queued requests"
    );
    tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .map_err(|err| AppError::unexpected(format!("pool shutdown task failed: {err}")))??;

    writer
        .await
        .map_err(|err| AppError::unexpected(format!("response writer failed: {err}")))?
}

async fn run_render(
    settings: config::Settings,
    args: config::RenderFileArgs,
) -> Result<(), AppError> {
    let markdown = read_source(&args.file).await?;

    let (worker, responses) = RenderWorker::spawn(
        0,
        RenderPipelineConfig::from(&settings.render),
        Arc::new(KatexEngine),
    )?;
    let client =
        RenderClient::new(worker, responses).with_timeout(settings.workers.response_timeout);

    let html = client.render_markdown(markdown).await?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(html.as_bytes())
        .await
        .map_err(InfraError::from)?;
    stdout.flush().await.map_err(InfraError::from)?;

    let worker = client.into_sink();
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .map_err(|err| AppError::unexpected(format!("worker shutdown task failed: {err}")))??;
    Ok(())
}

async fn read_source(path: &Path) -> Result<String, AppError> {
    if path == Path::new("-") {
        let mut buffer = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buffer)
            .await
            .map_err(InfraError::from)?;
        return Ok(buffer);
    }

    let markdown = tokio::fs::read_to_string(path)
        .await
        .map_err(InfraError::from)?;
    Ok(markdown)
}

async fn run_theme_css(settings: config::Settings) -> Result<(), AppError> {
    let theme = settings.render.theme.clone();
    let highlighter_config = HighlighterConfig {
        fallback_language: settings.render.fallback_language.clone(),
        marker_class: settings.render.code_marker_class.clone(),
        default_theme: theme.clone(),
    };

    let css = tokio::task::spawn_blocking(move || {
        Highlighter::load(highlighter_config)?.theme_css(Some(theme.as_str()))
    })
    .await
    .map_err(|err| AppError::unexpected(format!("theme export task failed: {err}")))?
    .map_err(|err| AppError::unexpected(err.to_string()))?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(css.as_bytes())
        .await
        .map_err(InfraError::from)?;
    stdout.flush().await.map_err(InfraError::from)?;
    Ok(())
}
