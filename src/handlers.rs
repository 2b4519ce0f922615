use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use json_patch::{Patch, PatchOperation};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info, warn};

use crate::engine::{MutationEngine, Outcome};
use crate::health;
use crate::metrics::RewriterMetrics;
use crate::review;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub struct AppState {
    pub engine: MutationEngine,
    pub metrics: RewriterMetrics,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/mutate", post(handle_mutate))
        .route("/healthz", get(health::healthz))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Takes the raw body so that malformed JSON still gets an `AdmissionReview`
/// answer rather than an extractor rejection.
pub async fn handle_mutate(
    State(state): State<SharedState>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(mutate(&state, &body))
}

pub fn mutate(state: &AppState, body: &[u8]) -> AdmissionReview<DynamicObject> {
    let start = Instant::now();
    let response = respond(state, body);
    state
        .metrics
        .admission_request_duration_seconds
        .observe(start.elapsed().as_secs_f64());
    response.into_review()
}

fn respond(state: &AppState, body: &[u8]) -> AdmissionResponse {
    if state.engine.snapshot().debug_requests {
        info!(body = %String::from_utf8_lossy(body), "admission review received");
    }

    let request = match review::decode(body) {
        Ok(request) => request,
        Err(e) => {
            let observed = review::observe_envelope(body);
            warn!(
                uid = observed.uid.as_deref().unwrap_or("<unknown>"),
                "rejecting undecodable admission review: {e}"
            );
            state.metrics.record_response(false, "rejected");
            return review::failure_response(&observed, &e);
        }
    };

    let operation = review::operation_name(&request.operation);
    state.metrics.record_request(&request.kind, &operation);

    let outcome = catch_unwind(AssertUnwindSafe(|| state.engine.evaluate(&request)));
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                uid = %request.uid,
                kind = %request.kind.kind,
                "mount path planning panicked, rejecting request"
            );
            state.metrics.record_response(false, "rejected");
            return AdmissionResponse::from(&request)
                .deny("internal error while planning mount path rewrites");
        }
    };

    let outcome_label = outcome.as_str();
    let response = match outcome {
        Outcome::Patched(patches) => patch_response(state, &request, &operation, patches),
        other => {
            debug!(
                uid = %request.uid,
                kind = %request.kind.kind,
                operation = %operation,
                outcome = other.as_str(),
                "no mount paths to rewrite"
            );
            AdmissionResponse::from(&request)
        }
    };

    state.metrics.record_response(
        response.allowed,
        if response.allowed { outcome_label } else { "rejected" },
    );
    response
}

fn patch_response(
    state: &AppState,
    request: &AdmissionRequest<DynamicObject>,
    operation: &str,
    patches: Vec<PatchOperation>,
) -> AdmissionResponse {
    info!(
        uid = %request.uid,
        kind = %request.kind.kind,
        operation = %operation,
        namespace = request.namespace.as_deref().unwrap_or(""),
        name = resource_name(request),
        patches = patches.len(),
        "rewriting volume mount paths"
    );

    if state.engine.snapshot().debug_patches {
        match serde_json::to_string(&patches) {
            Ok(patch) => info!(uid = %request.uid, %patch, "generated patch"),
            Err(e) => warn!(uid = %request.uid, "failed to render patch for logging: {e}"),
        }
    }

    let count = patches.len() as u64;
    match AdmissionResponse::from(request).with_patch(Patch(patches)) {
        Ok(patched) => {
            state.metrics.patch_operations_total.inc_by(count);
            patched
        }
        Err(e) => {
            error!(uid = %request.uid, "failed to serialize patch: {e}");
            AdmissionResponse::from(request)
                .deny(format!("failed to serialize mount path patch: {e}"))
        }
    }
}

fn resource_name(request: &AdmissionRequest<DynamicObject>) -> &str {
    if !request.name.is_empty() {
        return &request.name;
    }
    request
        .object
        .as_ref()
        .and_then(|object| {
            object
                .metadata
                .name
                .as_deref()
                .or(object.metadata.generate_name.as_deref())
        })
        .unwrap_or("<unknown>")
}
