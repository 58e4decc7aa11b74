use super::{ObjectStore, StoredObject};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process object store, handy for tests and local experiments.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), i64>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object as uploaded at `uploaded_at_ms`.
    pub fn put(&self, bucket: &str, key: &str, uploaded_at_ms: i64) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert((bucket.to_string(), key.to_string()), uploaded_at_ms);
        }
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(&(bucket.to_string(), key.to_string())))
            .unwrap_or(false)
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|(b, _)| b == bucket)
                    .map(|(_, k)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("object map poisoned"))?;
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, key), uploaded_at_ms)| StoredObject {
                key: key.clone(),
                uploaded_at_ms: *uploaded_at_ms,
            })
            .collect())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("object map poisoned"))?;
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
