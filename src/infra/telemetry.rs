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
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cardshot_screenshot_cache_hit_total",
            Unit::Count,
            "Total number of screenshots served from the snapshot store."
        );
        describe_counter!(
            "cardshot_screenshot_cache_miss_total",
            Unit::Count,
            "Total number of screenshot requests that required a render."
        );
        describe_counter!(
            "cardshot_screenshot_skipped_total",
            Unit::Count,
            "Total number of requests for missing or unpublished cards."
        );
        describe_counter!(
            "cardshot_screenshot_render_failed_total",
            Unit::Count,
            "Total number of renders that failed."
        );
        describe_histogram!(
            "cardshot_screenshot_render_ms",
            Unit::Milliseconds,
            "Render latency in milliseconds, launch to capture."
        );
    });
}
