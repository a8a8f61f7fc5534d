//! Replicated metadata store
//!
//! An in-memory map `(namespace, entity key) → attributes`, mutated only by
//! committed log entries. Every node holds a replica; reads are served from it.

use crate::common::meta::{AttrMap, MetaEntries, MetaNamespace};
use crate::common::raft::{LogEntry, Operation};
use crate::common::Result;
use crate::server::raft_node::StateMachine;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataStore {
    applied_index: u64,
    server_meta: MetaEntries,
    process_meta: MetaEntries,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last log entry reflected in the store
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Apply the operation committed at `index`.
    ///
    /// Indices at or below the applied index are ignored, which makes replay
    /// after a restart or a snapshot install harmless. Returns whether the
    /// store changed.
    pub fn apply(&mut self, index: u64, op: &Operation) -> bool {
        if index <= self.applied_index {
            return false;
        }
        self.applied_index = index;
        match op {
            Operation::Put {
                namespace,
                key,
                attrs,
            } => match self.put(*namespace, key, attrs) {
                Ok(()) => true,
                Err(e) => {
                    // Every replica rejects the same entry
                    tracing::warn!("Skipping invalid entry {} for {}: {}", index, key, e);
                    false
                }
            },
            Operation::Delete { namespace, key } => self.delete(*namespace, key),
            Operation::Noop | Operation::AddVoter { .. } | Operation::RemoveVoter { .. } => false,
        }
    }

    /// Merge attributes into an entry, creating it if absent
    pub fn put(&mut self, namespace: MetaNamespace, key: &str, attrs: &AttrMap) -> Result<()> {
        namespace.validate(attrs)?;
        let entry = self.entries_mut(namespace).entry(key.to_string()).or_default();
        for (name, value) in attrs {
            entry.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Remove a whole entry; returns whether it existed
    pub fn delete(&mut self, namespace: MetaNamespace, key: &str) -> bool {
        self.entries_mut(namespace).remove(key).is_some()
    }

    /// Entries matching `key`, or the whole namespace when `key` is empty.
    /// An absent key yields an empty map.
    pub fn query(&self, namespace: MetaNamespace, key: &str) -> MetaEntries {
        let entries = self.entries(namespace);
        if key.is_empty() {
            return entries.clone();
        }
        entries
            .get(key)
            .map(|attrs| MetaEntries::from([(key.to_string(), attrs.clone())]))
            .unwrap_or_default()
    }

    pub fn get(&self, namespace: MetaNamespace, key: &str) -> Option<&AttrMap> {
        self.entries(namespace).get(key)
    }

    pub fn entries(&self, namespace: MetaNamespace) -> &MetaEntries {
        match namespace {
            MetaNamespace::ServerMeta => &self.server_meta,
            MetaNamespace::ProcessMeta => &self.process_meta,
        }
    }

    fn entries_mut(&mut self, namespace: MetaNamespace) -> &mut MetaEntries {
        match namespace {
            MetaNamespace::ServerMeta => &mut self.server_meta,
            MetaNamespace::ProcessMeta => &mut self.process_meta,
        }
    }

    pub fn len(&self) -> usize {
        self.server_meta.len() + self.process_meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Drives a shared [`MetadataStore`] from the Raft apply path
#[derive(Clone, Default)]
pub struct MetaStateMachine {
    store: Arc<RwLock<MetadataStore>>,
}

impl MetaStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MetadataStore> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateMachine for MetaStateMachine {
    fn apply(&self, entry: &LogEntry) {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.apply(entry.index, &entry.op);
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.read().to_bytes()
    }

    fn restore(&self, data: &[u8]) -> Result<()> {
        let restored = MetadataStore::from_bytes(data)?;
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::meta::{attrs, keys, MetaValue};

    fn put(key: &str, attrs: AttrMap) -> Operation {
        Operation::Put {
            namespace: MetaNamespace::ProcessMeta,
            key: key.to_string(),
            attrs,
        }
    }

    #[test]
    fn test_put_merges_attributes() {
        let mut store = MetadataStore::new();
        store.apply(1, &put("W1", attrs([(keys::CPU_USED, 1i64)])));
        store.apply(2, &put("W1", attrs([(keys::MEMORY_USED, 2i64)])));
        store.apply(3, &put("W1", attrs([(keys::CPU_USED, 5i64)])));

        let entry = store.get(MetaNamespace::ProcessMeta, "W1").unwrap();
        assert_eq!(entry[keys::CPU_USED], MetaValue::Int(5));
        assert_eq!(entry[keys::MEMORY_USED], MetaValue::Int(2));
        assert_eq!(store.applied_index(), 3);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut store = MetadataStore::new();
        assert!(store.apply(1, &put("W1", attrs([(keys::CPU_USED, 1i64)]))));
        assert!(store.apply(2, &put("W1", attrs([(keys::CPU_USED, 2i64)]))));
        // Replaying an old entry must not roll the value back
        assert!(!store.apply(1, &put("W1", attrs([(keys::CPU_USED, 1i64)]))));
        assert_eq!(
            store.get(MetaNamespace::ProcessMeta, "W1").unwrap()[keys::CPU_USED],
            MetaValue::Int(2)
        );
    }

    #[test]
    fn test_delete_and_absent_query() {
        let mut store = MetadataStore::new();
        store.apply(1, &put("W1", attrs([(keys::STATUS, keys::ONLINE_STATUS)])));
        store.apply(
            2,
            &Operation::Delete {
                namespace: MetaNamespace::ProcessMeta,
                key: "W1".into(),
            },
        );
        assert!(store.query(MetaNamespace::ProcessMeta, "W1").is_empty());
        assert!(store.query(MetaNamespace::ProcessMeta, "missing").is_empty());
    }

    #[test]
    fn test_query_empty_key_returns_namespace() {
        let mut store = MetadataStore::new();
        store.apply(1, &put("W1", attrs([(keys::CPU_USED, 1i64)])));
        store.apply(2, &put("W2", attrs([(keys::CPU_USED, 2i64)])));
        store.apply(
            3,
            &Operation::Put {
                namespace: MetaNamespace::ServerMeta,
                key: "s1".into(),
                attrs: attrs([(keys::NODE_NAME, "s1")]),
            },
        );
        let all = store.query(MetaNamespace::ProcessMeta, "");
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("W1") && all.contains_key("W2"));
        assert_eq!(store.query(MetaNamespace::ServerMeta, "").len(), 1);
    }

    #[test]
    fn test_schema_violation_is_skipped() {
        let mut store = MetadataStore::new();
        assert!(!store.apply(1, &put("W1", attrs([("bogus", 1i64)]))));
        assert!(store.is_empty());
        assert_eq!(store.applied_index(), 1);
        assert!(store
            .put(MetaNamespace::ProcessMeta, "W1", &attrs([(keys::CPU_USED, "lots")]))
            .is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_store() {
        let sm = MetaStateMachine::new();
        sm.apply(&LogEntry {
            term: 1,
            index: 1,
            op: put("W1", attrs([(keys::CPU_USED, 1.5f64)])),
        });
        let data = sm.snapshot().unwrap();

        let restored = MetaStateMachine::new();
        restored.restore(&data).unwrap();
        assert_eq!(*restored.read(), *sm.read());
        assert_eq!(restored.read().applied_index(), 1);
    }
}
