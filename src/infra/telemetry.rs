use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::queue::metric_names;

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

/// Register descriptions for every metric the render queue reports.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            metric_names::NODE_ACQUIRE_TOTAL,
            Unit::Count,
            "Queue node shells handed out, labelled by source (pool or new)."
        );
        describe_counter!(
            metric_names::NODE_RELEASE_TOTAL,
            Unit::Count,
            "Queue node shells returned, labelled by outcome (retained or dropped)."
        );
        describe_counter!(
            metric_names::CONTENT_CACHE_TOTAL,
            Unit::Count,
            "Fragment cache lookups, labelled by result (hit or miss)."
        );
        describe_gauge!(
            metric_names::SLOTS_IN_USE,
            Unit::Count,
            "Pool slots currently held by running or suspended nodes."
        );
        describe_counter!(
            metric_names::CHUNKS_FLUSHED_TOTAL,
            Unit::Count,
            "Output chunks delivered to render stream consumers."
        );
        describe_counter!(
            metric_names::RENDER_TOTAL,
            Unit::Count,
            "Finished render requests, labelled by outcome."
        );
        describe_histogram!(
            metric_names::RENDER_MS,
            Unit::Milliseconds,
            "Render request latency in milliseconds."
        );
    });
}
