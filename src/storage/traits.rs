use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Keys used by the services that persist warm state.
pub const CIRCUIT_BREAKER_KEY: &str = "circuit_breaker";
pub const REPUTATION_KEY: &str = "reputation";
pub const PRICE_CACHE_KEY: &str = "price_cache";

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>>;
    async fn save(&self, key: &str, value: &Value) -> Result<()>;
}

pub async fn load_as<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn save_as<T: Serialize + Sync>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.save(key, &value).await
}
