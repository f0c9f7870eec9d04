//! Model pricing lookups.
//!
//! Prices are in USD per 1 million tokens. The table is filled from the
//! endpoint's model catalog the first time a price is needed; custom
//! pricing from the `[telemetry.custom_pricing]` config section always
//! takes precedence over catalog prices.
//!
//! Lookups are exact: a model id never borrows the price of a similarly
//! named model.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parlance_config::TelemetryConfig;
use parlance_core::provider::{ModelCatalog, ModelInfo, ModelPricing};
use tracing::{debug, warn};

/// Thread-safe pricing table keyed by exact model id.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
    overrides: HashMap<String, ModelPricing>,
    catalog_loaded: AtomicBool,
}

impl PricingTable {
    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            overrides: HashMap::new(),
            catalog_loaded: AtomicBool::new(false),
        }
    }

    /// Create a table seeded with the configured custom pricing.
    pub fn from_config(config: &TelemetryConfig) -> Self {
        let overrides: HashMap<String, ModelPricing> = config
            .custom_pricing
            .iter()
            .map(|(model, p)| {
                (
                    model.clone(),
                    ModelPricing::new(p.prompt_per_m, p.completion_per_m),
                )
            })
            .collect();

        Self {
            prices: RwLock::new(overrides.clone()),
            overrides,
            catalog_loaded: AtomicBool::new(false),
        }
    }

    /// Look up pricing for a model. Returns None if not found.
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        self.read().get(model).copied()
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.write().insert(model.into(), pricing);
    }

    /// Copy catalog prices into the table, leaving configured overrides
    /// untouched. Returns how many entries were written.
    pub fn fill_from_catalog(&self, models: &[ModelInfo]) -> usize {
        let mut prices = self.write();
        let mut written = 0;
        for model in models {
            if self.overrides.contains_key(&model.id) {
                continue;
            }
            if let Some(pricing) = model.pricing {
                prices.insert(model.id.clone(), pricing);
                written += 1;
            }
        }
        self.catalog_loaded.store(true, Ordering::Release);
        written
    }

    /// Whether catalog prices have been loaded.
    pub fn is_catalog_loaded(&self) -> bool {
        self.catalog_loaded.load(Ordering::Acquire)
    }

    /// Resolve pricing for `model`, fetching the catalog once if needed.
    ///
    /// A failed catalog fetch is logged and retried on the next call.
    pub async fn resolve(
        &self,
        model: &str,
        catalog: &dyn ModelCatalog,
        credential: Option<&str>,
    ) -> Option<ModelPricing> {
        if let Some(pricing) = self.get(model) {
            return Some(pricing);
        }
        if self.is_catalog_loaded() {
            return None;
        }

        match catalog.get_models(credential).await {
            Ok(models) => {
                let written = self.fill_from_catalog(&models);
                debug!(models = models.len(), priced = written, "Pricing table filled from catalog");
            }
            Err(e) => {
                warn!(error = %e, "Model catalog unavailable; cost will be reported as 0");
            }
        }
        self.get(model)
    }

    /// List all known model names.
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of models in the pricing table.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModelPricing>> {
        self.prices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ModelPricing>> {
        self.prices.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::empty()
    }
}
