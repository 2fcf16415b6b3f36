use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::StateStore;

#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    entries: Arc<RwLock<HashMap<String, Value>>>,
    writes: Arc<RwLock<usize>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls observed so far.
    pub async fn write_count(&self) -> usize {
        *self.writes.read().await
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        *self.writes.write().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::{load_as, save_as};
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let store = InMemoryStateStore::new();
        assert!(store.load("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = InMemoryStateStore::new();
        store.save("k", &json!({"a": 1})).await.unwrap();
        store.save("k", &json!({"a": 2})).await.unwrap();

        let value = store.load("k").await.unwrap().unwrap();
        assert_eq!(value["a"], 2);
        assert_eq!(store.write_count().await, 2);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let store = InMemoryStateStore::new();
        let data: HashMap<String, u32> = [("x".to_string(), 3)].into_iter().collect();
        save_as(&store, "typed", &data).await.unwrap();

        let loaded: HashMap<String, u32> = load_as(&store, "typed").await.unwrap().unwrap();
        assert_eq!(loaded.get("x"), Some(&3));
    }
}
