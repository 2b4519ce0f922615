use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// The label an object must carry, with this exact value, to be rewritten.
/// Checked on every request regardless of the webhook's `objectSelector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Only top-level `metadata.labels` count; pod template labels are ignored.
    pub fn matches(&self, metadata: &ObjectMeta) -> bool {
        metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.key))
            .is_some_and(|value| *value == self.value)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}
