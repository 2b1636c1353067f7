//! Token-cost estimation (§4.C).

use std::collections::HashMap;

/// Per-million-token pricing, in dollars, for one provider.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

const DEFAULT_PRICING: Pricing = Pricing {
    input_per_1k: 0.01,
    output_per_1k: 0.01,
};

/// Pricing table keyed by provider name. Unknown providers fall back to
/// the documented $10/M-in + $10/M-out default.
pub struct PricingTable {
    table: HashMap<String, Pricing>,
}

impl PricingTable {
    pub fn with_defaults() -> Self {
        let mut table = HashMap::new();
        table.insert(
            "anthropic".to_string(),
            Pricing {
                input_per_1k: 0.03,
                output_per_1k: 0.06,
            },
        );
        table.insert(
            "openai".to_string(),
            Pricing {
                input_per_1k: 0.03,
                output_per_1k: 0.06,
            },
        );
        Self { table }
    }

    pub fn pricing_for(&self, provider: &str) -> Pricing {
        self.table.get(provider).copied().unwrap_or(DEFAULT_PRICING)
    }

    pub fn estimate_cost_usd(&self, provider: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let pricing = self.pricing_for(provider);
        (tokens_in as f64 / 1000.0) * pricing.input_per_1k + (tokens_out as f64 / 1000.0) * pricing.output_per_1k
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
