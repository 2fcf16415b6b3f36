use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::PricingConfig;
use crate::registry::AgentRegistry;
use crate::storage::traits::{load_as, save_as, StateStore, PRICE_CACHE_KEY};
use crate::types::{BudgetCheckResult, BudgetLineItem, CapabilityId, DagPlan};

/// Score in [0,1] rewarding prices below the market average.
///
/// At the market average the score is 0.5; twice as cheap or better scores 1.0;
/// five times as expensive or worse scores 0.0.
pub fn calculate_price_efficiency(price: f64, market_average: f64) -> f64 {
    if price <= 0.0 {
        return 1.0;
    }
    let ratio = market_average / price;
    let score = if ratio >= 2.0 {
        1.0
    } else if ratio <= 0.2 {
        0.0
    } else if ratio >= 1.0 {
        0.5 + (ratio - 1.0) * 0.5
    } else {
        (ratio - 0.2) * (0.5 / 0.8)
    };
    score.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedMarketData {
    data: MarketData,
    computed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PriceCache {
    entries: HashMap<CapabilityId, CachedMarketData>,
    dirty: bool,
}

pub struct PriceRouter {
    config: PricingConfig,
    registry: Arc<dyn AgentRegistry>,
    cache: Mutex<PriceCache>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl PriceRouter {
    pub fn new(
        config: PricingConfig,
        registry: Arc<dyn AgentRegistry>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            cache: Mutex::new(PriceCache::default()),
            store,
            clock,
        }
    }

    /// Build a router whose cache starts from the last flushed warm state.
    /// Expired entries are simply recomputed on first use.
    pub async fn load(
        config: PricingConfig,
        registry: Arc<dyn AgentRegistry>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let entries: HashMap<CapabilityId, CachedMarketData> =
            load_as(store.as_ref(), PRICE_CACHE_KEY)
                .await?
                .unwrap_or_default();
        let router = Self::new(config, registry, store, clock);
        router.cache.lock().await.entries = entries;
        Ok(router)
    }

    pub fn calculate_price_efficiency(&self, price: f64, market_average: f64) -> f64 {
        calculate_price_efficiency(price, market_average)
    }

    pub async fn get_market_data(&self, capability_id: &str) -> Result<MarketData> {
        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.cache_ttl_secs);
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.entries.get(capability_id) {
                if now - cached.computed_at < ttl {
                    return Ok(cached.data);
                }
            }
        }

        let data = self.compute_market_data(capability_id).await?;
        log::debug!(
            "Market data for {}: avg={:.4} min={:.4} over {} prices",
            capability_id,
            data.average,
            data.min,
            data.samples
        );

        let mut cache = self.cache.lock().await;
        cache.entries.insert(
            capability_id.to_string(),
            CachedMarketData {
                data,
                computed_at: now,
            },
        );
        cache.dirty = true;
        Ok(data)
    }

    pub async fn get_market_average(&self, capability_id: &str) -> Result<f64> {
        Ok(self.get_market_data(capability_id).await?.average)
    }

    async fn compute_market_data(&self, capability_id: &str) -> Result<MarketData> {
        let mut prices: Vec<f64> = Vec::new();
        if let Some(price) = self.config.builtin_prices.get(capability_id) {
            prices.push(*price);
        }
        for agent in self.registry.agents_with_capability(capability_id).await? {
            if let Some(price) = agent.price_for(capability_id) {
                prices.push(price);
            }
        }

        if prices.is_empty() {
            let fallback = self.config.default_price;
            return Ok(MarketData {
                average: fallback,
                min: fallback,
                max: fallback,
                samples: 0,
            });
        }

        let sum: f64 = prices.iter().sum();
        Ok(MarketData {
            average: sum / prices.len() as f64,
            min: prices.iter().copied().fold(f64::INFINITY, f64::min),
            max: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            samples: prices.len(),
        })
    }

    pub fn default_price(&self) -> f64 {
        self.config.default_price
    }

    /// Sum every step's estimated cost against `max_budget`. Pure computation.
    pub fn check_budget(&self, plan: &DagPlan, max_budget: f64) -> BudgetCheckResult {
        let breakdown: Vec<BudgetLineItem> = plan
            .steps
            .iter()
            .map(|step| BudgetLineItem {
                agent_id: step.specialist.clone(),
                capability_id: step.capability.clone(),
                estimated_cost: step.estimated_cost,
            })
            .collect();
        let total_cost: f64 = breakdown.iter().map(|item| item.estimated_cost).sum();

        BudgetCheckResult {
            within_budget: total_cost <= max_budget,
            total_cost,
            max_budget,
            breakdown,
        }
    }

    /// Drop cached market data for one capability, or for all of them.
    pub async fn invalidate(&self, capability_id: Option<&str>) {
        let mut cache = self.cache.lock().await;
        match capability_id {
            Some(id) => {
                cache.entries.remove(id);
            }
            None => cache.entries.clear(),
        }
        cache.dirty = true;
    }

    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if !cache.dirty {
            return Ok(());
        }
        save_as(self.store.as_ref(), PRICE_CACHE_KEY, &cache.entries).await?;
        cache.dirty = false;
        Ok(())
    }
}
