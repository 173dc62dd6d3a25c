use std::collections::BTreeMap;

/// Create labels that can be used as a unique selector for a given app name.
pub fn selector_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![("app".to_owned(), app.to_owned())])
}

/// Selector matching every object the operator manages.
pub const MANAGED_BY_LABEL_SELECTOR: &str = "app.kubernetes.io/managed-by=rook-ceph-operator";

/// Labels that indicate the resource is managed by the operator.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "app.kubernetes.io/managed-by".to_owned(),
        "rook-ceph-operator".to_owned(),
    )]))
}

/// Managed labels plus the given extra labels.
pub fn managed_labels_extend(
    labels: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut managed = managed_labels().unwrap_or_default();
    managed.extend(labels.unwrap_or_default());
    Some(managed)
}
