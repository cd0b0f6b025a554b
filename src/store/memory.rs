//! In-memory object store used for dry runs and tests

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use super::error::{StoreError, StoreResult};
use super::{KeyEntry, ObjectStore, PutResponse};

#[derive(Debug, Clone)]
struct StoredObject {
    value: Vec<u8>,
    metadata: serde_json::Value,
}

/// Object store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    rejected: Mutex<HashSet<String>>,
    puts: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every future write to `key` with `success: false`
    pub fn reject(&self, key: impl Into<String>) {
        self.rejected.lock().unwrap().insert(key.into());
    }

    /// Keys written so far, in write order (rejected writes included)
    pub fn put_log(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    /// Metadata stored with `key`
    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.metadata.clone())
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        metadata: &serde_json::Value,
    ) -> StoreResult<PutResponse> {
        self.puts.lock().unwrap().push(key.to_string());
        if self.rejected.lock().unwrap().contains(key) {
            return Ok(PutResponse::rejected(format!("write to {} rejected", key)));
        }
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                value,
                metadata: metadata.clone(),
            },
        );
        Ok(PutResponse::ok())
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.value.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list_keys(&self) -> StoreResult<Vec<KeyEntry>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(name, object)| KeyEntry {
                name: name.clone(),
                metadata: Some(object.metadata.clone()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_list() {
        let store = MemoryStore::new();
        let response = store.put("k", b"v".to_vec(), &json!({"hash": "k"})).unwrap();
        assert!(response.success);
        assert_eq!(store.get("k").unwrap(), b"v");
        assert!(matches!(store.get("missing"), Err(StoreError::NotFound(_))));

        let keys = store.list_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].metadata, Some(json!({"hash": "k"})));
    }

    #[test]
    fn test_rejected_key() {
        let store = MemoryStore::new();
        store.reject("bad");
        let response = store.put("bad", Vec::new(), &json!({})).unwrap();
        assert!(!response.success);
        assert_eq!(response.errors.len(), 1);
        assert!(store.is_empty());
        assert_eq!(store.put_log(), vec!["bad".to_string()]);
    }
}
