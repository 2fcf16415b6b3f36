use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProviderConfig,
    pub storage: StorageConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub reputation: ReputationConfig,
    pub pricing: PricingConfig,
    pub ranking: RankingConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from(".arbiter/state"),
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub half_life_hours: f64,
    pub success_weight: f64,
    pub latency_weight: f64,
    pub latency_threshold_ms: f64,
    pub cold_start_tasks: u64,
    pub min_volume_for_confidence: u64,
    pub cold_start_score: f64,
    pub neutral_latency_score: f64,
    pub max_latency_samples: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 168.0,
            success_weight: 0.7,
            latency_weight: 0.3,
            latency_threshold_ms: 30_000.0,
            cold_start_tasks: 5,
            min_volume_for_confidence: 20,
            cold_start_score: 0.5,
            neutral_latency_score: 0.8,
            max_latency_samples: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub default_price: f64,
    pub cache_ttl_secs: i64,
    /// Reference prices per capability id, merged with what agents advertise.
    pub builtin_prices: HashMap<String, f64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_price: 0.01,
            cache_ttl_secs: 300,
            builtin_prices: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub similarity_threshold: f32,
    pub health_staleness_secs: i64,
    pub similarity_weight: f64,
    pub reputation_weight: f64,
    pub price_weight: f64,
    pub slow_latency_ms: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            health_staleness_secs: 300,
            similarity_weight: 0.4,
            reputation_weight: 0.3,
            price_weight: 0.3,
            slow_latency_ms: 30_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub step_timeout_ms: u64,
    pub fallback_timeout_ms: u64,
    pub max_retries: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            fallback_timeout_ms: 30_000,
            max_retries: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// File settings (if any) with environment overrides layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.providers.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.providers.anthropic_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.storage.database_url = Some(url);
            self.storage.backend = StorageBackend::Postgres;
        }
        if let Ok(dir) = std::env::var("ARBITER_STATE_DIR") {
            self.storage.path = PathBuf::from(dir);
            if self.storage.backend == StorageBackend::Memory {
                self.storage.backend = StorageBackend::File;
            }
        }
    }
}
