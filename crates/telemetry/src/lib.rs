//! Usage and cost accounting for Parlance.
//!
//! Tracks cumulative token usage per model, prices it with an exact-id
//! pricing table, and keeps running totals for the current session.

pub mod pricing;
pub mod usage;

pub use pricing::PricingTable;
pub use usage::{SessionUsage, UsageAccountant, UsageRecord, token_cost};
