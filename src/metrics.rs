//! Prometheus metrics.
//!
//! Renders [`PipelineStats`] in Prometheus text format. The monitor can
//! serve it standalone; the API server mounts the same handlers.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::stats::PipelineStats;

/// Start a standalone metrics HTTP server on `port`.
///
/// Serves `/metrics` and `/health` until the process exits. Returns an
/// error if the server fails to bind to the port.
pub async fn start_metrics_server(
    port: u16,
    stats: Arc<PipelineStats>,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(stats);

    let listener = TcpListener::bind(addr).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(stats): State<Arc<PipelineStats>>) -> impl IntoResponse {
    let output = format_prometheus_metrics(&stats);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

/// Escape a label value (country names may contain quotes).
fn label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Format statistics as Prometheus text format.
pub fn format_prometheus_metrics(stats: &PipelineStats) -> String {
    let summary = stats.summary();
    let mut out = String::with_capacity(4096);

    let _ = writeln!(out, "# HELP ft8mon_uptime_seconds Time since the process started");
    let _ = writeln!(out, "# TYPE ft8mon_uptime_seconds gauge");
    let _ = writeln!(out, "ft8mon_uptime_seconds {:.3}", summary.elapsed_secs);

    counter(
        &mut out,
        "ft8mon_datagrams_total",
        "UDP datagrams received",
        summary.datagrams,
    );
    counter(
        &mut out,
        "ft8mon_bytes_received_total",
        "UDP payload bytes received",
        summary.bytes_received,
    );
    counter(
        &mut out,
        "ft8mon_decode_errors_total",
        "Datagrams that failed to decode",
        summary.decode_errors,
    );
    counter(
        &mut out,
        "ft8mon_classify_errors_total",
        "Decoded messages that failed classification",
        summary.classify_errors,
    );
    counter(
        &mut out,
        "ft8mon_messages_queued_total",
        "Messages handed to the delivery queue",
        summary.messages_queued,
    );
    counter(
        &mut out,
        "ft8mon_messages_dropped_total",
        "Messages dropped because the delivery queue was full",
        summary.messages_dropped,
    );
    counter(
        &mut out,
        "ft8mon_batches_delivered_total",
        "Report batches delivered",
        summary.batches_delivered,
    );
    counter(
        &mut out,
        "ft8mon_batches_failed_total",
        "Report batches discarded after a delivery failure",
        summary.batches_failed,
    );
    counter(
        &mut out,
        "ft8mon_messages_ingested_total",
        "Messages aggregated into buckets",
        summary.messages_ingested,
    );

    // Decodes by kind
    let _ = writeln!(out, "# HELP ft8mon_decodes_total Decoded messages by kind");
    let _ = writeln!(out, "# TYPE ft8mon_decodes_total counter");
    let mut kinds: Vec<_> = summary.messages_by_kind.iter().collect();
    kinds.sort();
    for (kind, count) in kinds {
        let _ = writeln!(out, "ft8mon_decodes_total{{kind=\"{kind}\"}} {count}");
    }
    if summary.messages_by_kind.is_empty() {
        let _ = writeln!(out, "ft8mon_decodes_total {}", summary.decodes_handled);
    }

    let _ = writeln!(out, "# HELP ft8mon_decodes_by_country_total Decodes by caller country (top 10)");
    let _ = writeln!(out, "# TYPE ft8mon_decodes_by_country_total counter");
    for (country, count) in &summary.top_countries {
        let _ = writeln!(
            out,
            "ft8mon_decodes_by_country_total{{country=\"{}\"}} {count}",
            label(country)
        );
    }

    if let Some(ref snr) = summary.snr_percentiles {
        let _ = writeln!(out, "# HELP ft8mon_snr_db SNR distribution in decibels");
        let _ = writeln!(out, "# TYPE ft8mon_snr_db summary");
        let _ = writeln!(out, "ft8mon_snr_db{{quantile=\"0.5\"}} {}", snr.p50);
        let _ = writeln!(out, "ft8mon_snr_db{{quantile=\"0.9\"}} {}", snr.p90);
        let _ = writeln!(out, "ft8mon_snr_db{{quantile=\"0.99\"}} {}", snr.p99);
        let _ = writeln!(out, "ft8mon_snr_db_count {}", snr.count);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EnrichedMessage, MessageKind};

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let stats = PipelineStats::new();
        let output = format_prometheus_metrics(&stats);

        assert!(output.contains("ft8mon_uptime_seconds"));
        assert!(output.contains("ft8mon_decode_errors_total 0"));
        assert!(output.contains("ft8mon_decodes_total 0"));
        assert!(!output.contains("ft8mon_snr_db{"));
    }

    #[test]
    fn test_format_prometheus_metrics_with_data() {
        let stats = PipelineStats::new();
        stats.record_datagram(100);
        stats.record_message(&EnrichedMessage {
            snr: -15,
            kind: MessageKind::Cq,
            country: Some("Cote d'Ivoire \"CI\"".to_string()),
            ..Default::default()
        });

        let output = format_prometheus_metrics(&stats);

        assert!(output.contains("ft8mon_bytes_received_total 100"));
        assert!(output.contains("ft8mon_decodes_total{kind=\"CQ\"} 1"));
        assert!(output.contains(r#"ft8mon_decodes_by_country_total{country="Cote d'Ivoire \"CI\""} 1"#));
        assert!(output.contains("ft8mon_snr_db{quantile=\"0.5\"} -15"));
        assert!(output.contains("ft8mon_snr_db_count 1"));
    }

    #[test]
    fn test_prometheus_format_validity() {
        let stats = PipelineStats::new();
        stats.record_message(&EnrichedMessage::default());
        let output = format_prometheus_metrics(&stats);

        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.rsplitn(2, ' ').collect();
            assert_eq!(parts.len(), 2, "Invalid metric line: {}", line);
            assert!(parts[0].parse::<f64>().is_ok(), "Invalid value: {}", line);
        }
    }
}
