pub mod labels;
pub mod mount_paths;

use json_patch::jsonptr::PointerBuf;
use kube::core::GroupVersionKind;
use serde_json::Value;

/// Where the pod spec lives inside a resource of a given kind.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceShape {
    pub group: &'static str,
    pub kind: &'static str,
    pod_spec_path: &'static [&'static str],
}

const POD_SPEC: &[&str] = &["spec"];
const TEMPLATE_SPEC: &[&str] = &["spec", "template", "spec"];
const JOB_TEMPLATE_SPEC: &[&str] = &["spec", "jobTemplate", "spec", "template", "spec"];

static SHAPES: &[ResourceShape] = &[
    ResourceShape { group: "", kind: "Pod", pod_spec_path: POD_SPEC },
    ResourceShape { group: "", kind: "ReplicationController", pod_spec_path: TEMPLATE_SPEC },
    ResourceShape { group: "apps", kind: "Deployment", pod_spec_path: TEMPLATE_SPEC },
    ResourceShape { group: "apps", kind: "StatefulSet", pod_spec_path: TEMPLATE_SPEC },
    ResourceShape { group: "apps", kind: "DaemonSet", pod_spec_path: TEMPLATE_SPEC },
    ResourceShape { group: "apps", kind: "ReplicaSet", pod_spec_path: TEMPLATE_SPEC },
    ResourceShape { group: "batch", kind: "Job", pod_spec_path: TEMPLATE_SPEC },
    ResourceShape { group: "batch", kind: "CronJob", pod_spec_path: JOB_TEMPLATE_SPEC },
];

/// Looks up the shape for `gvk`. `None` means the kind carries nothing this
/// webhook rewrites; callers treat it as a no-op rather than a failure.
pub fn resolve_shape(gvk: &GroupVersionKind) -> Option<&'static ResourceShape> {
    SHAPES
        .iter()
        .find(|shape| shape.group == gvk.group && shape.kind == gvk.kind)
}

impl ResourceShape {
    pub fn pointer_prefix(&self) -> PointerBuf {
        PointerBuf::from_tokens(self.pod_spec_path.to_vec())
    }

    /// `object` is the resource body as submitted (everything but
    /// `apiVersion`, `kind` and `metadata` is reachable from here).
    pub fn pod_spec<'a>(&'static self, object: &'a Value) -> Option<PodSpecView<'a>> {
        let spec = self
            .pod_spec_path
            .iter()
            .try_fold(object, |node, token| node.get(*token))?;
        spec.is_object().then_some(PodSpecView { shape: self, spec })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerList {
    Containers,
    InitContainers,
    EphemeralContainers,
}

impl ContainerList {
    pub const ALL: [ContainerList; 3] = [
        ContainerList::Containers,
        ContainerList::InitContainers,
        ContainerList::EphemeralContainers,
    ];

    pub fn field(self) -> &'static str {
        match self {
            ContainerList::Containers => "containers",
            ContainerList::InitContainers => "initContainers",
            ContainerList::EphemeralContainers => "ephemeralContainers",
        }
    }
}

/// Which container lists of a pod spec take part in rewriting. The same scope
/// applies to every resource shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerScope {
    pub init_containers: bool,
    pub ephemeral_containers: bool,
}

impl Default for ContainerScope {
    fn default() -> Self {
        Self {
            init_containers: true,
            ephemeral_containers: false,
        }
    }
}

impl ContainerScope {
    pub fn includes(self, list: ContainerList) -> bool {
        match list {
            ContainerList::Containers => true,
            ContainerList::InitContainers => self.init_containers,
            ContainerList::EphemeralContainers => self.ephemeral_containers,
        }
    }

    pub fn lists(self) -> impl Iterator<Item = ContainerList> {
        ContainerList::ALL
            .into_iter()
            .filter(move |list| self.includes(*list))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PodSpecView<'a> {
    shape: &'static ResourceShape,
    spec: &'a Value,
}

impl<'a> PodSpecView<'a> {
    pub fn shape(self) -> &'static ResourceShape {
        self.shape
    }

    /// Entries of one container list, paired with their index in the
    /// submitted array. A missing or non-array list yields nothing.
    pub fn containers(self, list: ContainerList) -> impl Iterator<Item = ContainerView<'a>> {
        let shape = self.shape;
        self.spec
            .get(list.field())
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .map(move |(index, value)| ContainerView {
                shape,
                list,
                index,
                value,
            })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContainerView<'a> {
    shape: &'static ResourceShape,
    list: ContainerList,
    index: usize,
    value: &'a Value,
}

impl<'a> ContainerView<'a> {
    pub fn name(self) -> &'a str {
        self.value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
    }

    pub fn volume_mounts(self) -> impl Iterator<Item = MountView<'a>> {
        self.value
            .get("volumeMounts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .map(move |(index, value)| MountView {
                container: self,
                index,
                value,
            })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MountView<'a> {
    container: ContainerView<'a>,
    index: usize,
    value: &'a Value,
}

impl<'a> MountView<'a> {
    pub fn container(self) -> ContainerView<'a> {
        self.container
    }

    pub fn mount_path(self) -> Option<&'a str> {
        self.value.get("mountPath").and_then(Value::as_str)
    }

    /// Pointer to this mount's `mountPath`, using indices of the object as submitted.
    pub fn mount_path_pointer(self) -> PointerBuf {
        let container_index = self.container.index.to_string();
        let mount_index = self.index.to_string();
        let mut path_parts: Vec<&str> = self.container.shape.pod_spec_path.to_vec();
        path_parts.extend_from_slice(&[
            self.container.list.field(),
            &container_index,
            "volumeMounts",
            &mount_index,
            "mountPath",
        ]);
        PointerBuf::from_tokens(path_parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gvk(group: &str, kind: &str) -> GroupVersionKind {
        GroupVersionKind::gvk(group, "v1", kind)
    }

    #[test]
    fn resolves_pod_and_template_kinds() {
        let pod = resolve_shape(&gvk("", "Pod")).expect("pod shape");
        assert_eq!(pod.pointer_prefix().as_str(), "/spec");

        for kind in ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"] {
            let shape = resolve_shape(&gvk("apps", kind)).expect("apps shape");
            assert_eq!(shape.pointer_prefix().as_str(), "/spec/template/spec");
        }

        let job = resolve_shape(&gvk("batch", "Job")).expect("job shape");
        assert_eq!(job.pointer_prefix().as_str(), "/spec/template/spec");

        let cron = resolve_shape(&gvk("batch", "CronJob")).expect("cronjob shape");
        assert_eq!(
            cron.pointer_prefix().as_str(),
            "/spec/jobTemplate/spec/template/spec"
        );
    }

    #[test]
    fn unknown_kinds_and_foreign_groups_are_unsupported() {
        assert!(resolve_shape(&gvk("", "ConfigMap")).is_none());
        assert!(resolve_shape(&gvk("", "Service")).is_none());
        assert!(resolve_shape(&gvk("example.com", "Deployment")).is_none());
        assert!(resolve_shape(&gvk("apps", "Pod")).is_none());
    }

    #[test]
    fn pod_spec_requires_an_object_at_the_prefix() {
        let shape = resolve_shape(&gvk("apps", "Deployment")).unwrap();
        assert!(shape.pod_spec(&json!({"spec": {}})).is_none());
        assert!(shape.pod_spec(&json!({"spec": {"template": {"spec": "x"}}})).is_none());
        assert!(shape.pod_spec(&json!({"spec": {"template": {"spec": {}}}})).is_some());
    }

    #[test]
    fn views_keep_original_indices() {
        let shape = resolve_shape(&gvk("", "Pod")).unwrap();
        let object = json!({
            "spec": {
                "containers": [
                    {"name": "a"},
                    {"name": "b", "volumeMounts": [
                        {"name": "x", "mountPath": "/x"},
                        {"name": "y", "mountPath": "/y"}
                    ]}
                ]
            }
        });
        let spec = shape.pod_spec(&object).unwrap();
        let mounts: Vec<_> = spec
            .containers(ContainerList::Containers)
            .flat_map(ContainerView::volume_mounts)
            .collect();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].container().name(), "b");
        assert_eq!(mounts[1].mount_path(), Some("/y"));
        assert_eq!(
            mounts[1].mount_path_pointer().as_str(),
            "/spec/containers/1/volumeMounts/1/mountPath"
        );
    }

    #[test]
    fn malformed_lists_yield_nothing() {
        let shape = resolve_shape(&gvk("", "Pod")).unwrap();
        let object = json!({
            "spec": {
                "containers": {"not": "an array"},
                "initContainers": [{"volumeMounts": "nope"}, 7]
            }
        });
        let spec = shape.pod_spec(&object).unwrap();
        assert_eq!(spec.containers(ContainerList::Containers).count(), 0);
        let mounts = spec
            .containers(ContainerList::InitContainers)
            .flat_map(ContainerView::volume_mounts)
            .count();
        assert_eq!(mounts, 0);
    }

    #[test]
    fn default_scope_covers_init_but_not_ephemeral_containers() {
        let lists: Vec<_> = ContainerScope::default().lists().collect();
        assert_eq!(
            lists,
            vec![ContainerList::Containers, ContainerList::InitContainers]
        );

        let everything = ContainerScope {
            init_containers: true,
            ephemeral_containers: true,
        };
        assert_eq!(everything.lists().count(), 3);
    }
}
