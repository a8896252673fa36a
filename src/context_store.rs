//! Per-workflow compressed-context table. Reads never block: each entry is
//! an `ArcSwap` so a reader clones today's `Arc` in one atomic load, while
//! writers replace it wholesale (the compressor never mutates a context in
//! place — `merge` always returns a fresh record).

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::compression::CompressedContext;

#[derive(Default)]
pub struct ContextStore {
    entries: parking_lot::Mutex<HashMap<String, Arc<ArcSwap<CompressedContext>>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<CompressedContext>> {
        let entries = self.entries.lock();
        entries.get(workflow_id).map(|slot| slot.load_full())
    }

    /// Replace (or create) the stored context for `workflow_id`.
    pub fn set(&self, workflow_id: &str, context: CompressedContext) {
        let mut entries = self.entries.lock();
        match entries.get(workflow_id) {
            Some(slot) => slot.store(Arc::new(context)),
            None => {
                entries.insert(workflow_id.to_string(), Arc::new(ArcSwap::new(Arc::new(context))));
            }
        }
    }

    pub fn remove(&self, workflow_id: &str) {
        self.entries.lock().remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let store = ContextStore::new();
        store.set("wf-1", CompressedContext { workflow_id: "wf-1".into(), version: 1, ..Default::default() });
        assert_eq!(store.get("wf-1").unwrap().version, 1);
    }

    #[test]
    fn set_again_replaces_without_removing_entry_slot() {
        let store = ContextStore::new();
        store.set("wf-1", CompressedContext { version: 1, ..Default::default() });
        store.set("wf-1", CompressedContext { version: 2, ..Default::default() });
        assert_eq!(store.get("wf-1").unwrap().version, 2);
    }
}
