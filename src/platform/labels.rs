// ABOUTME: Resource labels used to find a component's containers on every platform

use crate::models::{ComponentRef, Mode};
use std::collections::BTreeMap;

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MODE_LABEL: &str = "devloop.dev/mode";
/// Logical container name, set on Podman containers whose engine name is prefixed.
pub const CONTAINER_NAME_LABEL: &str = "devloop.dev/container";

pub const MANAGER: &str = "devloop";

/// Labels selecting a component's resources in one mode.
pub fn selector_labels(component: &ComponentRef, mode: Mode) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(INSTANCE_LABEL.to_string(), component.name.clone());
    labels.insert(PART_OF_LABEL.to_string(), component.app.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    labels.insert(MODE_LABEL.to_string(), mode.label_value().to_string());
    labels
}

/// Kubernetes label selector string, e.g. `a=b,c=d`.
pub fn selector(component: &ComponentRef, mode: Mode) -> String {
    selector_labels(component, mode)
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Filter values for the Docker-compatible `label` list filter.
pub fn label_filters(component: &ComponentRef, mode: Mode) -> Vec<String> {
    selector_labels(component, mode)
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

/// Name prefix of Podman containers created inside the component's pod.
pub fn pod_prefix(component: &ComponentRef) -> String {
    format!("{}-{}-", component.name, component.app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_is_sorted_and_complete() {
        let component = ComponentRef::new("nodejs", "app");
        assert_eq!(
            selector(&component, Mode::Deploy),
            "app.kubernetes.io/instance=nodejs,app.kubernetes.io/managed-by=devloop,\
             app.kubernetes.io/part-of=app,devloop.dev/mode=Deploy"
        );
    }

    #[test]
    fn test_label_filters_match_selector() {
        let component = ComponentRef::new("nodejs", "app");
        let filters = label_filters(&component, Mode::Dev);
        assert_eq!(filters.len(), 4);
        assert!(filters.contains(&"devloop.dev/mode=Dev".to_string()));
        assert_eq!(pod_prefix(&component), "nodejs-app-");
    }
}
