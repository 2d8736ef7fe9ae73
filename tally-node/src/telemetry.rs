use crate::config::{LoggingConfig, MetricsConfig};
use crate::error::{Result, TallyError};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    // Ignore the error when a subscriber is already installed
    let _ = match config.format.as_deref() {
        Some("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
}

/// Register metric descriptions
pub fn describe_metrics() {
    describe_counter!(
        "tally_contributions_accepted_total",
        "Total number of contributions accepted from participants"
    );
    describe_counter!(
        "tally_contributions_simulated_total",
        "Total number of contributions synthesized by stall recovery"
    );
    describe_counter!(
        "tally_contributions_rejected_total",
        "Total number of contributions refused by strict validation"
    );
    describe_counter!(
        "tally_messages_discarded_total",
        "Total number of malformed messages discarded"
    );
    describe_counter!(
        "tally_participants_pruned_total",
        "Total number of participants removed after a send failure"
    );
    describe_gauge!("tally_participants", "Currently registered participants");
    describe_gauge!("tally_current_count", "Next expected count value");
}

/// Install the Prometheus exporter when metrics are enabled
pub fn start_metrics_exporter(config: &MetricsConfig) -> Result<Option<SocketAddr>> {
    if !config.enabled {
        return Ok(None);
    }

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| TallyError::Config(format!("Invalid metrics address: {}", e)))?;

    PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .map_err(|e| TallyError::Setup(format!("Failed to install Prometheus exporter: {}", e)))?;

    describe_metrics();
    info!(metrics_addr = %listen_addr, "Prometheus metrics server started");
    Ok(Some(listen_addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_exporter_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            listen_addr: "not an address".to_string(),
        };
        assert_eq!(start_metrics_exporter(&config).expect("disabled"), None);
    }

    #[test]
    fn test_invalid_metrics_address() {
        let config = MetricsConfig {
            enabled: true,
            listen_addr: "nowhere".to_string(),
        };
        assert!(matches!(
            start_metrics_exporter(&config),
            Err(TallyError::Config(_))
        ));
    }
}
