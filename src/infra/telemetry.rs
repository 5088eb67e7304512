use std::path::Path;
use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{self, LogFormat, LoggingSettings, Settings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Load settings and install logging from them.
pub fn bootstrap(file: Option<&Path>) -> Result<Settings, InfraError> {
    let settings = config::load(file)?;
    init(&settings.logging)?;
    Ok(settings)
}

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

/// Register descriptions for every metric the engine emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rescache_detail_hit_total",
            Unit::Count,
            "Detail lookups answered from the cache."
        );
        describe_counter!(
            "rescache_detail_miss_total",
            Unit::Count,
            "Detail lookups that had to read the primary store."
        );
        describe_counter!(
            "rescache_detail_negative_total",
            Unit::Count,
            "Detail lookups answered by a negative cache entry."
        );
        describe_counter!(
            "rescache_id_list_refresh_total",
            Unit::Count,
            "Id-list refresh attempts by result (ok, error, skipped)."
        );
        describe_histogram!(
            "rescache_id_list_refresh_ms",
            Unit::Milliseconds,
            "Duration of full id-list rebuilds in milliseconds."
        );
        describe_histogram!(
            "rescache_ingest_batch_ms",
            Unit::Milliseconds,
            "Change ingestion batch latency in milliseconds."
        );
        describe_gauge!(
            "rescache_event_queue_len",
            Unit::Count,
            "Current number of pending events per queue."
        );
        describe_counter!(
            "rescache_event_dropped_total",
            Unit::Count,
            "Events dropped because their queue was full."
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_reports_missing_config_file() {
        let err = bootstrap(Some(Path::new("/nonexistent/rescache.toml")))
            .expect_err("missing file");
        assert!(matches!(err, InfraError::Config(_)));
    }
}
