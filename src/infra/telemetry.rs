use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so stdout stays free for rendered output and protocol
/// frames.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "mdworker_render_total",
            Unit::Count,
            "Total number of render requests accepted by workers."
        );
        describe_counter!(
            "mdworker_render_failed_total",
            Unit::Count,
            "Total number of render requests answered with an error."
        );
        describe_counter!(
            "mdworker_math_fallback_total",
            Unit::Count,
            "Total number of math expressions emitted as error fragments."
        );
        describe_counter!(
            "mdworker_grammar_load_total",
            Unit::Count,
            "Total number of syntax grammar loads, labelled by result."
        );
        describe_histogram!(
            "mdworker_render_ms",
            Unit::Milliseconds,
            "Wall-clock time spent rendering one document."
        );
    });
}
