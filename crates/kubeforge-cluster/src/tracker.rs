//! Resource tracker and its on-disk store
//!
//! The tracker is an append-only ledger of everything created for one
//! cluster. Ids are never removed: it answers "what was created", and teardown
//! logs what it actually managed to delete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kubeforge_common::types::{ClusterId, ResourceClass, ResourceRef};
use kubeforge_common::{Error, Result};

/// Per-cluster ledger of created resource ids, grouped by class
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTracker {
    /// Owning cluster
    pub cluster: String,
    /// Backend region the resources live in
    pub region: String,
    resources: BTreeMap<ResourceClass, Vec<String>>,
}

impl ResourceTracker {
    /// Create an empty tracker
    pub fn new(cluster: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            region: region.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Record a created resource.
    ///
    /// Returns `Ok(false)` if the id is already recorded under the same class.
    /// An id already recorded under a different class is rejected.
    pub fn record(&mut self, class: ResourceClass, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::internal_with_context(
                "tracker",
                format!("refusing to record empty {} id", class),
            ));
        }

        if let Some(existing) = self.class_of(&id) {
            if existing == class {
                return Ok(false);
            }
            return Err(Error::internal_with_context(
                "tracker",
                format!("{} already recorded as {}, not {}", id, existing, class),
            ));
        }

        debug!(cluster = %self.cluster, class = %class, resource = %id, "Recorded resource");
        self.resources.entry(class).or_default().push(id);
        Ok(true)
    }

    /// Record a resource reference
    pub fn record_ref(&mut self, resource: &ResourceRef) -> Result<bool> {
        self.record(resource.class, resource.id.clone())
    }

    /// Record every reference, stopping at the first conflict
    pub fn record_all<'a>(
        &mut self,
        resources: impl IntoIterator<Item = &'a ResourceRef>,
    ) -> Result<usize> {
        let mut added = 0;
        for resource in resources {
            if self.record_ref(resource)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Ids recorded under a class, in creation order
    pub fn ids(&self, class: ResourceClass) -> &[String] {
        self.resources.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Class an id is recorded under
    pub fn class_of(&self, id: &str) -> Option<ResourceClass> {
        self.resources
            .iter()
            .find(|(_, ids)| ids.iter().any(|i| i == id))
            .map(|(class, _)| *class)
    }

    /// Whether an id is recorded under a class
    pub fn contains(&self, class: ResourceClass, id: &str) -> bool {
        self.ids(class).iter().any(|i| i == id)
    }

    /// Total number of recorded ids
    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    /// No ids recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every recorded resource
    pub fn resources(&self) -> impl Iterator<Item = ResourceRef> + '_ {
        self.resources
            .iter()
            .flat_map(|(class, ids)| ids.iter().map(|id| ResourceRef::new(*class, id.clone())))
    }

    /// Fold another tracker's ids into this one
    ///
    /// Conflicting ids (same id, different class) are skipped with a warning.
    pub fn merge(&mut self, other: &ResourceTracker) {
        for resource in other.resources() {
            if let Err(e) = self.record_ref(&resource) {
                warn!(cluster = %self.cluster, error = %e, "Skipping conflicting resource during merge");
            }
        }
    }
}

/// JSON persistence for trackers under a state directory
///
/// Layout: `<state_dir>/<backend>/<cluster>.tracker.json`.
#[derive(Clone, Debug)]
pub struct TrackerStore {
    root: PathBuf,
}

impl TrackerStore {
    /// Store rooted at a directory (created on first save)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ClusterId) -> PathBuf {
        self.root
            .join(&id.backend)
            .join(format!("{}.tracker.json", id.name))
    }

    /// Write a tracker, replacing any previous version
    pub fn save(&self, id: &ClusterId, tracker: &ResourceTracker) -> Result<()> {
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
        }
        let data = serde_json::to_string_pretty(tracker)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| io_error("write", &tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error("rename", &path, e))?;
        debug!(cluster = %id, path = %path.display(), resources = tracker.len(), "Saved tracker");
        Ok(())
    }

    /// Read a tracker, `None` if none was persisted
    pub fn load(&self, id: &ClusterId) -> Result<Option<ResourceTracker>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path).map_err(|e| io_error("read", &path, e))?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Delete a persisted tracker; missing files are fine
    pub fn remove(&self, id: &ClusterId) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::internal_with_context(
        "tracker-store",
        format!("failed to {} {}: {}", action, path.display(), e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_same_id_twice_keeps_one_entry() {
        let mut tracker = ResourceTracker::new("dev", "us-east-1");
        assert!(tracker.record(ResourceClass::Network, "vpc-1").unwrap());
        assert!(!tracker.record(ResourceClass::Network, "vpc-1").unwrap());
        assert_eq!(tracker.ids(ResourceClass::Network), &["vpc-1".to_string()]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn id_lives_in_exactly_one_class() {
        let mut tracker = ResourceTracker::new("dev", "us-east-1");
        tracker.record(ResourceClass::Subnet, "res-1").unwrap();
        assert!(tracker.record(ResourceClass::Network, "res-1").is_err());
        assert_eq!(tracker.class_of("res-1"), Some(ResourceClass::Subnet));
        assert!(tracker.ids(ResourceClass::Network).is_empty());
    }

    #[test]
    fn empty_class_is_empty_slice() {
        let tracker = ResourceTracker::new("dev", "us-east-1");
        assert!(tracker.ids(ResourceClass::ComputeNode).is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn creation_order_is_preserved() {
        let mut tracker = ResourceTracker::new("dev", "us-east-1");
        for id in ["i-3", "i-1", "i-2"] {
            tracker.record(ResourceClass::ComputeNode, id).unwrap();
        }
        assert_eq!(tracker.ids(ResourceClass::ComputeNode), &["i-3", "i-1", "i-2"]);
    }

    #[test]
    fn merge_skips_conflicts_and_duplicates() {
        let mut a = ResourceTracker::new("dev", "us-east-1");
        a.record(ResourceClass::Network, "vpc-1").unwrap();

        let mut b = ResourceTracker::new("dev", "us-east-1");
        b.record(ResourceClass::Network, "vpc-1").unwrap();
        b.record(ResourceClass::ComputeNode, "i-1").unwrap();

        let mut c = ResourceTracker::new("dev", "us-east-1");
        c.record(ResourceClass::Volume, "vpc-1").unwrap();

        a.merge(&b);
        a.merge(&c);
        assert_eq!(a.len(), 2);
        assert_eq!(a.class_of("vpc-1"), Some(ResourceClass::Network));
    }

    #[test]
    fn store_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackerStore::new(dir.path());
        let id = ClusterId::new("aws", "dev");

        assert!(store.load(&id).unwrap().is_none());

        let mut tracker = ResourceTracker::new("dev", "us-east-1");
        tracker.record(ResourceClass::Network, "vpc-1").unwrap();
        tracker.record(ResourceClass::SecurityBoundary, "sg-1").unwrap();
        store.save(&id, &tracker).unwrap();

        assert!(dir.path().join("aws").join("dev.tracker.json").exists());
        assert_eq!(store.load(&id).unwrap(), Some(tracker));

        store.remove(&id).unwrap();
        assert!(store.load(&id).unwrap().is_none());
        store.remove(&id).unwrap();
    }

    #[test]
    fn serialized_classes_are_kebab_case() {
        let mut tracker = ResourceTracker::new("dev", "us-east-1");
        tracker.record(ResourceClass::SecurityBoundary, "sg-1").unwrap();
        let json = serde_json::to_string(&tracker).unwrap();
        assert!(json.contains("\"security-boundary\":[\"sg-1\"]"));
    }
}
