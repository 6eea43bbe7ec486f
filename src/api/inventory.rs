//! Inventory of the objects an instance owns.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Reference to one cluster object.
///
/// Equality, ordering and hashing use the identity tuple
/// `(group, kind, namespace, name)`. The version is kept so deletes can address
/// the object, but an API version bump does not change identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind.
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl ResourceRef {
    /// Creates a reference from an `apiVersion` string such as `apps/v1` or `v1`.
    #[must_use]
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Returns `group/version`, or just the version for the core group.
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Returns true when the object is cluster-scoped.
    #[must_use]
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    fn identity(&self) -> (&str, &str, &str, &str) {
        (&self.group, &self.kind, &self.namespace, &self.name)
    }
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ResourceRef {}

impl std::hash::Hash for ResourceRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for ResourceRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        };
        if self.namespace.is_empty() {
            write!(f, "{kind}/{}", self.name)
        } else {
            write!(f, "{kind}/{}/{}", self.namespace, self.name)
        }
    }
}

/// Set of objects owned by an instance, persisted in its status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceInventory {
    /// Sorted entries without duplicate identities.
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

impl ResourceInventory {
    /// Builds an inventory, sorting entries and dropping duplicate identities.
    ///
    /// When an identity appears more than once the last occurrence wins, so the
    /// most recently applied version is kept.
    #[must_use]
    pub fn from_refs(refs: impl IntoIterator<Item = ResourceRef>) -> Self {
        let mut set = BTreeSet::new();
        for r in refs {
            set.replace(r);
        }
        Self {
            entries: set.into_iter().collect(),
        }
    }

    /// Returns the entries of `self` whose identity is absent from `desired`.
    #[must_use]
    pub fn difference<'a, I>(&self, desired: I) -> Vec<ResourceRef>
    where
        I: IntoIterator<Item = &'a ResourceRef>,
    {
        let desired: BTreeSet<&ResourceRef> = desired.into_iter().collect();
        self.entries
            .iter()
            .filter(|entry| !desired.contains(entry))
            .cloned()
            .collect()
    }

    /// Returns true when an entry with the same identity exists.
    #[must_use]
    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.entries.binary_search(resource).is_ok()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the inventory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> ResourceRef {
        ResourceRef::new("v1", "ConfigMap", "default", name)
    }

    #[test]
    fn test_identity_ignores_version() {
        let v1 = ResourceRef::new("autoscaling/v1", "HorizontalPodAutoscaler", "apps", "web");
        let v2 = ResourceRef::new("autoscaling/v2", "HorizontalPodAutoscaler", "apps", "web");
        assert_eq!(v1, v2);

        let inventory = ResourceInventory::from_refs([v1]);
        assert!(inventory.difference([&v2]).is_empty());
    }

    #[test]
    fn test_difference() {
        let previous = ResourceInventory::from_refs([cm("a"), cm("b"), cm("c")]);
        let desired = [cm("b"), cm("c"), cm("d")];
        assert_eq!(previous.difference(&desired), vec![cm("a")]);
    }

    #[test]
    fn test_from_refs_sorts_and_dedups() {
        let inventory = ResourceInventory::from_refs([cm("c"), cm("a"), cm("c"), cm("b")]);
        let names: Vec<&str> = inventory.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(inventory.contains(&cm("b")));
        assert!(!inventory.contains(&cm("d")));
    }

    #[test]
    fn test_api_version_split() {
        let core = ResourceRef::new("v1", "Service", "default", "web");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.to_string(), "Service/default/web");

        let apps = ResourceRef::new("apps/v1", "Deployment", "default", "web");
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.to_string(), "Deployment.apps/default/web");
    }

    #[test]
    fn test_serialized_shape() {
        let web = ResourceRef::new("apps/v1", "Deployment", "default", "web");
        let inventory = ResourceInventory::from_refs([web]);
        let json = serde_json::to_value(&inventory).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "entries": [
                    {
                        "group": "apps",
                        "version": "v1",
                        "kind": "Deployment",
                        "namespace": "default",
                        "name": "web"
                    }
                ]
            })
        );
    }
}
