//! # Prometheus Metrics
//!
//! Engine metrics, scraped at `/metrics` on the metrics port. Everything
//! lives in a dedicated [`prometheus::Registry`] under the `zkredit`
//! namespace.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    core::Collector, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use zkredit_protocol::orchestrator::EngineStats;

/// Metric handles shared by the API handlers and the gauge refresher.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub authorizations_granted_total: IntCounter,
    /// Denials labelled by error kind (`policy_violation`, `conflict`, ...).
    pub authorizations_denied_total: IntCounterVec,
    pub proofs_requested_total: IntCounter,
    /// Prover verdicts received through the callback endpoint.
    pub proofs_resolved_total: IntCounter,
    pub credit_adjustments_total: IntCounter,
    pub transfers_executed_total: IntCounter,
    pub open_credit_lines: IntGauge,
    pub active_agents: IntGauge,
    pub tracked_assets: IntGauge,
    /// Time spent inside `authorize_spend`, including the credit draw.
    pub authorization_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers every metric. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("zkredit".into()), None)?;

        let authorizations_granted_total = register(
            &registry,
            IntCounter::new(
                "authorizations_granted_total",
                "Spend authorizations granted",
            )?,
        )?;
        let authorizations_denied_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "authorizations_denied_total",
                    "Spend authorizations refused, by error kind",
                ),
                &["kind"],
            )?,
        )?;
        let proofs_requested_total = register(
            &registry,
            IntCounter::new("proofs_requested_total", "Proof requests accepted")?,
        )?;
        let proofs_resolved_total = register(
            &registry,
            IntCounter::new(
                "proofs_resolved_total",
                "Prover verdicts applied through the callback endpoint",
            )?,
        )?;
        let credit_adjustments_total = register(
            &registry,
            IntCounter::new(
                "credit_adjustments_total",
                "Draws and repayments applied to credit lines",
            )?,
        )?;
        let transfers_executed_total = register(
            &registry,
            IntCounter::new(
                "transfers_executed_total",
                "Transfers accepted by the chain collaborator",
            )?,
        )?;
        let open_credit_lines = register(
            &registry,
            IntGauge::new("open_credit_lines", "Credit lines not yet closed")?,
        )?;
        let active_agents = register(
            &registry,
            IntGauge::new("active_agents", "Agents currently allowed to spend")?,
        )?;
        let tracked_assets = register(
            &registry,
            IntGauge::new("tracked_assets", "Asset snapshots held by the ledger")?,
        )?;
        let authorization_latency_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "authorization_latency_seconds",
                    "Latency of spend authorization in seconds",
                )
                .buckets(vec![
                    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
                ]),
            )?,
        )?;

        Ok(Self {
            registry,
            authorizations_granted_total,
            authorizations_denied_total,
            proofs_requested_total,
            proofs_resolved_total,
            credit_adjustments_total,
            transfers_executed_total,
            open_credit_lines,
            active_agents,
            tracked_assets,
            authorization_latency_seconds,
        })
    }

    /// Copies engine entity counts into the gauges.
    pub fn observe_stats(&self, stats: &EngineStats) {
        self.open_credit_lines.set(stats.open_credit_lines as i64);
        self.active_agents.set(stats.active_agents as i64);
        self.tracked_assets.set(stats.assets as i64);
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler for `/metrics`. 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
