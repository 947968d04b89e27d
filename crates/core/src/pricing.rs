//! Turn Cost Estimation
//!
//! Converts per-turn token deltas into an estimated cost. The engine only
//! reports these numbers; nothing in the session state depends on them.

use crate::generic_types::TokenUsage;
use serde::Serialize;

/// Estimated cost of one completion turn, in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCost {
    /// Cost with every counter billed at its own modality rate.
    pub speech_mode_cost: f64,
    /// Cost if the same tokens had all been billed as text.
    pub text_mode_cost: f64,
}

/// A pure function from token delta to cost.
pub trait PricingModel: Send + Sync {
    fn cost_of(&self, delta: &TokenUsage) -> TurnCost;
}

/// Flat per-1000-token pricing for each of the four counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPricing {
    pub speech_input_per_1k: f64,
    pub speech_output_per_1k: f64,
    pub text_input_per_1k: f64,
    pub text_output_per_1k: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            speech_input_per_1k: 0.0034,
            speech_output_per_1k: 0.0136,
            text_input_per_1k: 0.00006,
            text_output_per_1k: 0.00024,
        }
    }
}

fn per_1k(tokens: u64, rate: f64) -> f64 {
    tokens as f64 / 1000.0 * rate
}

impl PricingModel for TokenPricing {
    fn cost_of(&self, delta: &TokenUsage) -> TurnCost {
        let speech_mode_cost = per_1k(delta.input_speech, self.speech_input_per_1k)
            + per_1k(delta.output_speech, self.speech_output_per_1k)
            + per_1k(delta.input_text, self.text_input_per_1k)
            + per_1k(delta.output_text, self.text_output_per_1k);
        let text_mode_cost = per_1k(delta.total_input(), self.text_input_per_1k)
            + per_1k(delta.total_output(), self.text_output_per_1k);
        TurnCost {
            speech_mode_cost,
            text_mode_cost,
        }
    }
}
