use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            let trace_id = id.to_string();
            Ok(Self { id: trace_id })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
    pub instance: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub kind: String,
    pub event: String,
}

/// Operator-wide metrics, registered once at startup and shared by every
/// per-GVK controller.
#[derive(Clone)]
pub struct Metrics {
    pub reconcile_runs: Family<(), Counter>,
    pub reconcile_failures: Family<ErrorLabels, Counter>,
    pub reconcile_duration: HistogramWithExemplars<TraceLabel>,
    pub job_events: Family<EventLabels, Counter>,
    pub ready: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            reconcile_runs: Family::<(), Counter>::default(),
            reconcile_failures: Family::<ErrorLabels, Counter>::default(),
            reconcile_duration: HistogramWithExemplars::new([0.25, 1., 5., 30., 120., 600.].into_iter()),
            job_events: Family::<EventLabels, Counter>::default(),
            ready: Gauge::default(),
        }
    }
}

impl Metrics {
    /// Register all metrics and return the registered handle.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.reconcile_duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciliation errors",
            self.reconcile_failures.clone(),
        );
        r.register("reconcile_runs", "reconciliations", self.reconcile_runs.clone());
        r.register(
            "job_events",
            "job events received from the runner",
            self.job_events.clone(),
        );
        r.register("ready", "controllers running", self.ready.clone());
        self
    }

    pub fn reconcile_failure(&self, kind: &str, instance: &str, e: &Error) {
        self.reconcile_failures
            .get_or_create(&ErrorLabels {
                kind: kind.to_string(),
                instance: instance.to_string(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn job_event_inc(&self, kind: &str, event: &str) {
        self.job_events
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
                event: event.to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.reconcile_runs.get_or_create(&()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
