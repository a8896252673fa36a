//! Snapshot Manager: indexed, versioned store of [`CompressedContext`]
//! records per workflow.

use std::collections::HashMap;

use uuid::Uuid;

use crate::compression::CompressedContext;

/// A stored context plus the id it was saved under.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub context: CompressedContext,
}

/// Per-workflow ordered index of snapshot ids, guarded by a single lock so
/// concurrent saves never interleave an index update (spec: snapshot
/// versions per workflow are strictly monotonic).
#[derive(Default)]
pub struct SnapshotManager {
    inner: parking_lot::Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<String, Snapshot>,
    by_workflow: HashMap<String, Vec<String>>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `context` under a fresh `snap_<uuid>` id and appends it to the
    /// workflow's index.
    pub fn save(&self, context: CompressedContext) -> String {
        let id = format!("snap_{}", Uuid::new_v4());
        let mut inner = self.inner.lock();
        inner.by_workflow.entry(context.workflow_id.clone()).or_default().push(id.clone());
        inner.snapshots.insert(id.clone(), Snapshot { id: id.clone(), context });
        id
    }

    pub fn get(&self, snapshot_id: &str) -> Option<Snapshot> {
        self.inner.lock().snapshots.get(snapshot_id).cloned()
    }

    /// All snapshots for a workflow, oldest first.
    pub fn list(&self, workflow_id: &str) -> Vec<Snapshot> {
        let inner = self.inner.lock();
        inner
            .by_workflow
            .get(workflow_id)
            .map(|ids| ids.iter().filter_map(|id| inner.snapshots.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// The snapshot with the highest `version` for a workflow.
    pub fn get_latest_snapshot(&self, workflow_id: &str) -> Option<Snapshot> {
        let inner = self.inner.lock();
        inner
            .by_workflow
            .get(workflow_id)?
            .iter()
            .filter_map(|id| inner.snapshots.get(id))
            .max_by_key(|s| s.context.version)
            .cloned()
    }
}
