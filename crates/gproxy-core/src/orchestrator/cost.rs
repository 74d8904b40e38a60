//! Tier resolution against a model's tiered price schedule, and the cost
//! formula that turns token counts into surface/actual USD amounts.

use gproxy_storage::{BillingType, CredentialRow, ModelRow, PriceTier};

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    fn context_size(&self) -> i64 {
        self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EffectivePrices {
    pub input_price: f64,
    pub output_price: f64,
    pub cache_creation_price: f64,
    pub cache_read_price: f64,
}

/// First tier whose `up_to` is at or above the context size; the open-ended
/// last tier (`up_to = None`) always matches.
fn resolve_tier(tiers: &[PriceTier], context_size: i64) -> Option<&PriceTier> {
    tiers
        .iter()
        .find(|t| t.up_to.map(|up_to| up_to >= context_size).unwrap_or(true))
}

pub fn effective_prices(model: &ModelRow, usage: &TokenUsage) -> EffectivePrices {
    if let Some(tiers) = &model.tiered_pricing
        && let Some(tier) = resolve_tier(tiers, usage.context_size())
    {
        return EffectivePrices {
            input_price: tier.input_price,
            output_price: tier.output_price,
            cache_creation_price: tier.cache_creation_price,
            cache_read_price: tier.cache_read_price,
        };
    }

    EffectivePrices {
        input_price: model.override_input_price.unwrap_or(0.0),
        output_price: model.override_output_price.unwrap_or(0.0),
        cache_creation_price: model.override_cache_creation_price.unwrap_or(0.0),
        cache_read_price: model.override_cache_read_price.unwrap_or(0.0),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CostBreakdown {
    pub surface_cost: f64,
    pub actual_cost: f64,
}

/// Whether the attempt reached a terminal state that should be billed at
/// all (a successful request, as opposed to one that failed or was
/// skipped before delivering tokens).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    FailedOrSkipped,
}

pub fn compute_cost(
    usage: &TokenUsage,
    prices: &EffectivePrices,
    price_per_request: f64,
    outcome: AttemptOutcome,
    credential: &CredentialRow,
    billing_type: BillingType,
) -> CostBreakdown {
    if outcome == AttemptOutcome::FailedOrSkipped {
        return CostBreakdown::default();
    }

    let token_cost = usage.input_tokens as f64 * prices.input_price / 1_000_000.0
        + usage.output_tokens as f64 * prices.output_price / 1_000_000.0
        + usage.cache_creation_tokens as f64 * prices.cache_creation_price / 1_000_000.0
        + usage.cache_read_tokens as f64 * prices.cache_read_price / 1_000_000.0;

    let surface_cost = token_cost + price_per_request;
    let actual_cost = if billing_type == BillingType::FreeTier {
        0.0
    } else {
        surface_cost * credential.rate_multiplier
    };

    CostBreakdown {
        surface_cost,
        actual_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_storage::{ModelRow, PriceTier};

    fn credential_row() -> CredentialRow {
        CredentialRow {
            id: 1,
            provider_id: 1,
            endpoint_id: 1,
            name: None,
            settings_json: serde_json::Value::Null,
            secret_json: serde_json::Value::Null,
            enabled: true,
            max_concurrent: None,
            learned_max_concurrent: None,
            rate_multiplier: 1.0,
            allowed_models: None,
            capabilities: serde_json::json!({}),
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            updated_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn model_row(tiered: Option<Vec<PriceTier>>) -> ModelRow {
        ModelRow {
            id: 1,
            provider_id: 1,
            global_model_id: 1,
            provider_model_name: "m".to_string(),
            is_active: true,
            override_input_price: Some(3.0),
            override_output_price: Some(15.0),
            override_cache_creation_price: Some(3.75),
            override_cache_read_price: Some(0.3),
            tiered_pricing: tiered,
        }
    }

    #[test]
    fn flat_pricing_matches_worked_example() {
        let model = model_row(None);
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        };
        let prices = effective_prices(&model, &usage);
        let cost = compute_cost(
            &usage,
            &prices,
            0.0,
            AttemptOutcome::Success,
            &credential_row(),
            BillingType::PayAsYouGo,
        );
        let expected = 1000.0 * 3.0 / 1_000_000.0 + 500.0 * 15.0 / 1_000_000.0;
        assert!((cost.surface_cost - expected).abs() < 1e-9);
    }

    #[test]
    fn tiered_pricing_picks_matching_band() {
        let tiers = vec![
            PriceTier {
                up_to: Some(200_000),
                input_price: 3.0,
                output_price: 15.0,
                cache_creation_price: 3.75,
                cache_read_price: 0.3,
            },
            PriceTier {
                up_to: None,
                input_price: 6.0,
                output_price: 22.5,
                cache_creation_price: 7.5,
                cache_read_price: 0.6,
            },
        ];
        let model = model_row(Some(tiers));
        let usage = TokenUsage {
            input_tokens: 300_000,
            output_tokens: 1000,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        };
        let prices = effective_prices(&model, &usage);
        assert_eq!(prices.input_price, 6.0);
    }

    #[test]
    fn failed_attempt_is_free() {
        let model = model_row(None);
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            ..Default::default()
        };
        let prices = effective_prices(&model, &usage);
        let cost = compute_cost(
            &usage,
            &prices,
            1.0,
            AttemptOutcome::FailedOrSkipped,
            &credential_row(),
            BillingType::PayAsYouGo,
        );
        assert_eq!(cost.surface_cost, 0.0);
        assert_eq!(cost.actual_cost, 0.0);
    }

    #[test]
    fn free_tier_provider_zeroes_actual_cost() {
        let model = model_row(None);
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            ..Default::default()
        };
        let prices = effective_prices(&model, &usage);
        let cost = compute_cost(
            &usage,
            &prices,
            0.0,
            AttemptOutcome::Success,
            &credential_row(),
            BillingType::FreeTier,
        );
        assert!(cost.surface_cost > 0.0);
        assert_eq!(cost.actual_cost, 0.0);
    }
}
