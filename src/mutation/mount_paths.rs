use json_patch::{PatchOperation, ReplaceOperation};
use serde_json::Value;
use tracing::debug;

use crate::config::ConfigError;

use super::{ContainerScope, PodSpecView};

/// Moves mount paths from one directory prefix to another.
///
/// Both prefixes are absolute and stored without a trailing separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    from: String,
    to: String,
}

impl RewriteRule {
    pub fn new(from: &str, to: &str) -> Result<Self, ConfigError> {
        let from = normalize_prefix("rewrite_from", from)?;
        let to = normalize_prefix("rewrite_to", to)?;

        // Every source path would count as already rewritten.
        if from.starts_with(&to) {
            return Err(ConfigError::SourceInsideDestination { from, to });
        }

        Ok(Self { from, to })
    }

    pub fn from_prefix(&self) -> &str {
        &self.from
    }

    pub fn to_prefix(&self) -> &str {
        &self.to
    }

    /// Returns the rewritten path, or `None` when `path` is left alone.
    ///
    /// `path` is rewritten only when it equals the source prefix or continues
    /// it with a `/`; `/homework` is not under `/home`. Any path that already
    /// begins with the destination text is never touched again.
    pub fn rewrite(&self, path: &str) -> Option<String> {
        if path.starts_with(&self.to) {
            return None;
        }
        let remainder = strip_dir_prefix(path, &self.from)?;
        if remainder.is_empty() {
            Some(format!("{}/", self.to))
        } else {
            Some(format!("{}{remainder}", self.to))
        }
    }
}

/// Strips `prefix` from `path` only on a directory boundary. The remainder is
/// either empty or starts with `/`.
fn strip_dir_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn normalize_prefix(field: &'static str, value: &str) -> Result<String, ConfigError> {
    if !value.starts_with('/') {
        return Err(ConfigError::RelativePrefix {
            field,
            value: value.to_string(),
        });
    }
    let trimmed = value.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::RootPrefix { field });
    }
    Ok(trimmed.to_string())
}

/// Plans one `replace` per volume mount that `rule` moves.
///
/// Everything is read from the object as submitted, so the container and mount
/// indices in each pointer are positions in the original arrays and the
/// operations can be applied together in any order.
pub fn plan(
    rule: &RewriteRule,
    pod_spec: PodSpecView<'_>,
    scope: ContainerScope,
) -> Vec<PatchOperation> {
    let mut patches = Vec::new();

    for list in scope.lists() {
        for container in pod_spec.containers(list) {
            for mount in container.volume_mounts() {
                let Some(current) = mount.mount_path() else {
                    continue;
                };
                if let Some(rewritten) = rule.rewrite(current) {
                    debug!(
                        kind = pod_spec.shape().kind,
                        pod_spec = %pod_spec.shape().pointer_prefix(),
                        container = mount.container().name(),
                        from = current,
                        to = %rewritten,
                        "planned mount path rewrite"
                    );
                    patches.push(PatchOperation::Replace(ReplaceOperation {
                        path: mount.mount_path_pointer(),
                        value: Value::String(rewritten),
                    }));
                }
            }
        }
    }

    patches
}
