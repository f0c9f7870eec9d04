//! Per-model usage bookkeeping.
//!
//! One [`UsageRecord`] per model id, updated additively after every
//! completed request and persisted under the `usage` store key. Session
//! counters live only in memory.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parlance_core::error::StoreError;
use parlance_core::provider::{ModelPricing, Usage};
use parlance_core::store::{self, KeyValueStore, StoreKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cumulative usage of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model_id: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub last_used: DateTime<Utc>,
    /// Latest pricing observed for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
}

impl UsageRecord {
    fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            request_count: 0,
            total_tokens: 0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            last_used: Utc::now(),
            pricing: None,
        }
    }
}

/// Counters for the lifetime of one accountant. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionUsage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

/// Cost of a token split under `pricing`.
///
/// With a prompt/completion breakdown each side is billed at its own rate;
/// with only a total, the average of the two rates applies. No pricing
/// means no cost.
pub fn token_cost(
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    pricing: Option<&ModelPricing>,
) -> f64 {
    let Some(pricing) = pricing else {
        return 0.0;
    };
    if prompt_tokens + completion_tokens > 0 {
        pricing.cost(prompt_tokens, completion_tokens)
    } else {
        total_tokens as f64 / 1_000_000.0 * pricing.blended_rate()
    }
}

pub struct UsageAccountant {
    store: Arc<dyn KeyValueStore>,
    records: BTreeMap<String, UsageRecord>,
    session: SessionUsage,
}

impl UsageAccountant {
    /// Load the persisted usage table. A missing key starts empty.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let records: BTreeMap<String, UsageRecord> = store::load(store.as_ref(), &StoreKey::Usage)
            .await?
            .unwrap_or_default();
        debug!(models = records.len(), "Usage table loaded");
        Ok(Self {
            store,
            records,
            session: SessionUsage::default(),
        })
    }

    /// Add one completed request to the record for `model_id` and persist
    /// the table. Supplied pricing replaces whatever was stored.
    ///
    /// The in-memory update happens even if persisting fails.
    pub async fn record(
        &mut self,
        model_id: &str,
        usage: Usage,
        pricing: Option<ModelPricing>,
    ) -> Result<UsageRecord, StoreError> {
        let record = self
            .records
            .entry(model_id.to_string())
            .or_insert_with(|| UsageRecord::new(model_id));

        record.request_count += 1;
        record.total_tokens += u64::from(usage.total_tokens);
        record.total_prompt_tokens += u64::from(usage.prompt_tokens);
        record.total_completion_tokens += u64::from(usage.completion_tokens);
        record.last_used = Utc::now();
        if pricing.is_some() {
            record.pricing = pricing;
        }
        let snapshot = record.clone();

        let request_cost = token_cost(
            u64::from(usage.prompt_tokens),
            u64::from(usage.completion_tokens),
            u64::from(usage.total_tokens),
            snapshot.pricing.as_ref(),
        );
        self.session.requests += 1;
        self.session.prompt_tokens += u64::from(usage.prompt_tokens);
        self.session.completion_tokens += u64::from(usage.completion_tokens);
        self.session.total_tokens += u64::from(usage.total_tokens);
        self.session.cost += request_cost;

        debug!(
            model = model_id,
            total_tokens = usage.total_tokens,
            cost = request_cost,
            "Usage recorded"
        );

        store::save(self.store.as_ref(), &StoreKey::Usage, &self.records).await?;
        Ok(snapshot)
    }

    /// Cumulative cost of a record, priced with its own stored pricing only.
    pub fn cost(record: &UsageRecord) -> f64 {
        token_cost(
            record.total_prompt_tokens,
            record.total_completion_tokens,
            record.total_tokens,
            record.pricing.as_ref(),
        )
    }

    pub fn get(&self, model_id: &str) -> Option<&UsageRecord> {
        self.records.get(model_id)
    }

    /// All records, ordered by model id.
    pub fn records(&self) -> impl Iterator<Item = &UsageRecord> {
        self.records.values()
    }

    pub fn total_cost(&self) -> f64 {
        self.records.values().map(Self::cost).sum()
    }

    pub fn session(&self) -> SessionUsage {
        self.session
    }

    pub fn reset_session(&mut self) {
        self.session = SessionUsage::default();
    }
}
