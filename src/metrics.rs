//! Prometheus metrics for the ibuo operator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::prep::dispatcher::PrepReport;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub name: String,
    pub result: String,
}

/// Labels for per-resource metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpgradeLabels {
    pub name: String,
}

/// Labels for finished prep runs.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PrepResultLabels {
    pub name: String,
    pub result: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<UpgradeLabels, Histogram>,
    pub prep_started_total: Family<UpgradeLabels, Counter>,
    pub prep_finished_total: Family<PrepResultLabels, Counter>,
    pub prep_active: Family<UpgradeLabels, Gauge>,
    pub prep_duration_seconds: Family<PrepResultLabels, Histogram>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets for prep duration (10s to 2h): seed pulls and precaching can take
/// tens of minutes.
const PREP_DURATION_BUCKETS: &[f64] = &[
    10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "ibuo_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<UpgradeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "ibuo_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let prep_started_total = Family::<UpgradeLabels, Counter>::default();
        registry.register(
            "ibuo_prep_started",
            "Total number of prep workers started",
            prep_started_total.clone(),
        );

        let prep_finished_total = Family::<PrepResultLabels, Counter>::default();
        registry.register(
            "ibuo_prep_finished",
            "Total number of prep workers finished, by result",
            prep_finished_total.clone(),
        );

        let prep_active = Family::<UpgradeLabels, Gauge>::default();
        registry.register(
            "ibuo_prep_active",
            "Whether a prep worker is running (1=running, 0=idle)",
            prep_active.clone(),
        );

        let prep_duration_seconds =
            Family::<PrepResultLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(PREP_DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "ibuo_prep_duration_seconds",
            "Duration of prep worker runs in seconds",
            prep_duration_seconds.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            prep_started_total,
            prep_finished_total,
            prep_active,
            prep_duration_seconds,
        }
    }

    pub fn observe_reconcile(&self, name: &str, result: &str, seconds: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                name: name.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&UpgradeLabels {
                name: name.to_string(),
            })
            .observe(seconds);
    }

    /// Mark `name` as having no running worker.
    pub fn set_prep_idle(&self, name: &str) {
        self.prep_active
            .get_or_create(&UpgradeLabels {
                name: name.to_string(),
            })
            .set(0);
    }

    /// Record the dispatch outcome for `name`.
    pub fn observe_prep(&self, name: &str, report: &PrepReport) {
        let labels = UpgradeLabels {
            name: name.to_string(),
        };
        match report {
            PrepReport::Started(_) => {
                self.prep_started_total.get_or_create(&labels).inc();
                self.prep_active.get_or_create(&labels).set(1);
            }
            PrepReport::InProgress(_) => {}
            PrepReport::Finished { outcome, elapsed, .. } => {
                let result = PrepResultLabels {
                    name: name.to_string(),
                    result: outcome.to_string(),
                };
                self.prep_finished_total.get_or_create(&result).inc();
                self.prep_duration_seconds
                    .get_or_create(&result)
                    .observe(elapsed.as_secs_f64());
                self.prep_active.get_or_create(&labels).set(0);
            }
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prep::task::WorkerOutcome;
    use std::time::Duration;

    fn encoded(registry: &Registry) -> String {
        let mut buf = String::new();
        encode(&mut buf, registry).unwrap();
        buf
    }

    #[test]
    fn test_reconcile_metrics_encoding() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);

        metrics.observe_reconcile("upgrade", "requeue", 0.042);

        let buf = encoded(&registry);
        assert!(buf.contains("ibuo_reconcile_total"));
        assert!(buf.contains("ibuo_reconcile_duration_seconds"));
        assert!(buf.contains("upgrade"));
    }

    #[test]
    fn test_prep_lifecycle() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        let labels = UpgradeLabels {
            name: "upgrade".to_string(),
        };

        metrics.observe_prep("upgrade", &PrepReport::Started("Prep stage initialized".into()));
        assert_eq!(metrics.prep_active.get_or_create(&labels).get(), 1);
        assert_eq!(metrics.prep_started_total.get_or_create(&labels).get(), 1);

        metrics.observe_prep("upgrade", &PrepReport::InProgress("Pulling".into()));
        assert_eq!(metrics.prep_started_total.get_or_create(&labels).get(), 1);

        metrics.observe_prep(
            "upgrade",
            &PrepReport::Finished {
                outcome: WorkerOutcome::Succeeded,
                message: "Prep completed successfully".into(),
                elapsed: Duration::from_secs(600),
            },
        );
        assert_eq!(metrics.prep_active.get_or_create(&labels).get(), 0);

        let buf = encoded(&registry);
        assert!(buf.contains("ibuo_prep_finished_total"));
        assert!(buf.contains("result=\"Succeeded\""));
        assert!(buf.contains("ibuo_prep_duration_seconds"));
    }
}
