//! In-process object store

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{ObjectHead, ObjectStore, PutOptions, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub options: PutOptions,
}

/// A write or delete observed by the store, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put(String),
    Delete(String),
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    ops: Vec<StoreOp>,
}

#[derive(Debug)]
pub struct MemoryObjectStore {
    public_host: String,
    state: Mutex<State>,
}

impl MemoryObjectStore {
    pub fn new(public_host: impl Into<String>) -> Self {
        Self {
            public_host: public_host.into().trim_end_matches('/').to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object without recording an operation
    pub fn insert(&self, key: &str, body: impl Into<Bytes>, options: PutOptions) {
        self.state().objects.insert(
            key.to_string(),
            StoredObject {
                body: body.into(),
                options,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.state().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        self.state().ops.clone()
    }

    pub fn put_count(&self) -> usize {
        self.state()
            .ops
            .iter()
            .filter(|op| matches!(op, StoreOp::Put(_)))
            .count()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("http://localhost/token-content")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes, options: PutOptions) -> Result<(), StorageError> {
        let mut state = self.state();
        state.ops.push(StoreOp::Put(key.to_string()));
        state
            .objects
            .insert(key.to_string(), StoredObject { body, options });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state();
        state.ops.push(StoreOp::Delete(key.to_string()));
        state.objects.remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectHead>, StorageError> {
        Ok(self.state().objects.get(key).map(|object| ObjectHead {
            key: key.to_string(),
            size: object.body.len() as i64,
            content_type: Some(object.options.content_type.clone()),
            content_encoding: object.options.content_encoding.clone(),
            checksum: object.options.checksum.clone(),
        }))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_host, key)
    }
}
