use kube::core::GroupVersionKind;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::mutation::resolve_shape;

/// `kind` label for anything outside the shape table.
pub const OTHER_KIND: &str = "other";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub kind: &'static str,
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub allowed: &'static str,
    pub outcome: &'static str,
}

pub struct RewriterMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub patch_operations_total: Counter,
    pub admission_request_duration_seconds: Histogram,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl RewriterMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "mount_rewriter_admission_requests",
            "Admission requests decoded, by object kind and operation",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "mount_rewriter_admission_responses",
            "Admission responses sent, by verdict and outcome",
            admission_responses_total.clone(),
        );

        let patch_operations_total = Counter::default();
        registry.register(
            "mount_rewriter_patch_operations",
            "Mount path replace operations emitted",
            patch_operations_total.clone(),
        );

        let admission_request_duration_seconds = Histogram::new(DURATION_BUCKETS.iter().copied());
        registry.register(
            "mount_rewriter_admission_request_duration_seconds",
            "Time spent handling one admission request",
            admission_request_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            admission_responses_total,
            patch_operations_total,
            admission_request_duration_seconds,
        }
    }

    /// Kinds the webhook does not rewrite share one label value.
    pub fn record_request(&self, gvk: &GroupVersionKind, operation: &str) {
        let kind = resolve_shape(gvk).map_or(OTHER_KIND, |shape| shape.kind);
        self.admission_requests_total
            .get_or_create(&RequestLabels {
                kind,
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn record_response(&self, allowed: bool, outcome: &'static str) {
        self.admission_responses_total
            .get_or_create(&ResponseLabels {
                allowed: if allowed { "true" } else { "false" },
                outcome,
            })
            .inc();
    }
}
