// SPDX-License-Identifier: MIT OR Apache-2.0
//! Static model pricing and cost computation.

use crate::message::TokenUsage;
use serde::{Deserialize, Serialize};

/// Price of one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    /// USD per million input tokens.
    pub input_per_million: f64,
    /// USD per million output tokens.
    pub output_per_million: f64,
}

/// Known model prices. Unknown models cost zero; pricing gaps must never
/// fail a request, only under-report cost.
const PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o", ModelPrice { input_per_million: 2.50, output_per_million: 10.00 }),
    ("gpt-4o-mini", ModelPrice { input_per_million: 0.15, output_per_million: 0.60 }),
    ("gpt-4.1", ModelPrice { input_per_million: 2.00, output_per_million: 8.00 }),
    ("gpt-4.1-mini", ModelPrice { input_per_million: 0.40, output_per_million: 1.60 }),
    ("gpt-4.1-nano", ModelPrice { input_per_million: 0.10, output_per_million: 0.40 }),
    ("o3-mini", ModelPrice { input_per_million: 1.10, output_per_million: 4.40 }),
    ("claude-sonnet-4", ModelPrice { input_per_million: 3.00, output_per_million: 15.00 }),
    ("claude-3-5-haiku", ModelPrice { input_per_million: 0.80, output_per_million: 4.00 }),
];

/// Look up the price for `model`, if known.
///
/// Accepts either a bare model name or a `provider/model` string; only the
/// final segment is matched against the table.
#[must_use]
pub fn price_for(model: &str) -> Option<ModelPrice> {
    let bare = model.rsplit('/').next().unwrap_or(model);
    PRICES
        .iter()
        .find(|(name, _)| *name == bare)
        .map(|(_, price)| *price)
}

/// Itemized cost of one or more model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Model the cost was computed for (preserved even when unpriced).
    pub model: String,
    /// Input tokens billed.
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    /// Output tokens billed.
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    /// Input-side cost in USD.
    #[serde(rename = "inputCost")]
    pub input_cost: f64,
    /// Output-side cost in USD.
    #[serde(rename = "outputCost")]
    pub output_cost: f64,
    /// Total cost in USD.
    #[serde(rename = "totalCost")]
    pub total_cost: f64,
    /// Always `"USD"`.
    pub currency: String,
}

/// Compute the cost of `usage` against `model`.
///
/// Unknown models yield a zero-cost breakdown that still names the model, so
/// downstream accounting can flag the gap.
#[must_use]
pub fn cost_for(model: &str, usage: &TokenUsage) -> CostBreakdown {
    let price = price_for(model).unwrap_or(ModelPrice {
        input_per_million: 0.0,
        output_per_million: 0.0,
    });
    let input_cost = usage.prompt_tokens as f64 * price.input_per_million / 1_000_000.0;
    let output_cost = usage.completion_tokens as f64 * price.output_per_million / 1_000_000.0;
    CostBreakdown {
        model: model.to_string(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
        currency: "USD".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_is_priced() {
        let cost = cost_for("gpt-4o-mini", &TokenUsage::new(1_000_000, 1_000_000));
        assert!((cost.input_cost - 0.15).abs() < 1e-9);
        assert!((cost.output_cost - 0.60).abs() < 1e-9);
        assert!((cost.total_cost - 0.75).abs() < 1e-9);
        assert_eq!(cost.currency, "USD");
    }

    #[test]
    fn unknown_model_costs_zero_but_keeps_name() {
        let cost = cost_for("totally-new-model", &TokenUsage::new(500, 500));
        assert_eq!(cost.total_cost, 0.0);
        assert_eq!(cost.model, "totally-new-model");
    }

    #[test]
    fn provider_prefix_is_stripped_for_lookup() {
        assert!(price_for("openai/gpt-4o").is_some());
        assert!(price_for("anthropic/claude-sonnet-4").is_some());
    }

    #[test]
    fn zero_usage_costs_nothing() {
        let cost = cost_for("gpt-4o", &TokenUsage::default());
        assert_eq!(cost.total_cost, 0.0);
    }
}
