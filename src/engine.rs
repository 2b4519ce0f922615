use json_patch::PatchOperation;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, Operation};

use crate::config::Snapshot;
use crate::mutation::{mount_paths, resolve_shape};

/// What the engine decided for one request.
#[derive(Debug)]
pub enum Outcome {
    Patched(Vec<PatchOperation>),
    /// Matching object with no mount under the source prefix.
    Unchanged,
    SkippedOperation,
    SkippedKind,
    SkippedLabel,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Patched(_) => "patched",
            Outcome::Unchanged => "unchanged",
            Outcome::SkippedOperation => "skipped_operation",
            Outcome::SkippedKind => "skipped_kind",
            Outcome::SkippedLabel => "skipped_label",
        }
    }
}

pub struct MutationEngine {
    snapshot: Snapshot,
}

impl MutationEngine {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn evaluate(&self, request: &AdmissionRequest<DynamicObject>) -> Outcome {
        if !matches!(request.operation, Operation::Create | Operation::Update) {
            return Outcome::SkippedOperation;
        }
        let Some(shape) = resolve_shape(&request.kind) else {
            return Outcome::SkippedKind;
        };
        let Some(object) = &request.object else {
            return Outcome::SkippedOperation;
        };
        if !self.snapshot.selector.matches(&object.metadata) {
            return Outcome::SkippedLabel;
        }
        let Some(pod_spec) = shape.pod_spec(&object.data) else {
            return Outcome::Unchanged;
        };

        let patches = mount_paths::plan(&self.snapshot.rule, pod_spec, self.snapshot.scope);
        if patches.is_empty() {
            Outcome::Unchanged
        } else {
            Outcome::Patched(patches)
        }
    }
}
