//! Usage/Cost Tracker
//!
//! Keeps the session's running token totals and turns completion start/end
//! markers into per-turn deltas.

use crate::inbound::UsageEvent;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;
use voicebridge_core::{TokenUsage, TurnCost};

/// Token accounting for one completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnUsage {
    pub completion_id: String,
    pub delta: TokenUsage,
    pub totals: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<TurnCost>,
}

#[derive(Debug, Default)]
pub struct UsageTracker {
    totals: TokenUsage,
    open_turns: HashMap<String, TokenUsage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> TokenUsage {
        self.totals
    }

    /// Applies one usage message and returns the new running totals.
    ///
    /// Cumulative totals replace the counters outright; an incremental delta is
    /// only added when the message carries no cumulative totals.
    pub fn record(&mut self, event: &UsageEvent) -> TokenUsage {
        if let Some(total) = &event.details.total {
            self.totals = total.to_usage();
        } else if let Some(delta) = &event.details.delta {
            self.totals = self.totals.saturating_add(&delta.to_usage());
        }
        self.totals
    }

    /// Snapshots the current totals as the start of `completion_id`.
    pub fn begin_turn(&mut self, completion_id: &str) {
        self.open_turns.insert(completion_id.to_string(), self.totals);
    }

    /// Closes `completion_id` and returns its delta. An unknown id yields a
    /// zero delta.
    pub fn end_turn(&mut self, completion_id: &str) -> TurnUsage {
        let delta = match self.open_turns.remove(completion_id) {
            Some(snapshot) => self.totals.saturating_sub(&snapshot),
            None => {
                debug!(completion_id, "Completion end without a matching start");
                TokenUsage::default()
            }
        };
        TurnUsage {
            completion_id: completion_id.to_string(),
            delta,
            totals: self.totals,
            cost: None,
        }
    }

    pub fn open_turn_count(&self) -> usize {
        self.open_turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::{TokenCounts, UsageBreakdown, UsageDetails};

    fn breakdown(input_speech: u64, input_text: u64, output_speech: u64, output_text: u64) -> UsageBreakdown {
        UsageBreakdown {
            input: TokenCounts {
                speech_tokens: input_speech,
                text_tokens: input_text,
            },
            output: TokenCounts {
                speech_tokens: output_speech,
                text_tokens: output_text,
            },
        }
    }

    fn total_event(input_speech: u64) -> UsageEvent {
        UsageEvent {
            details: UsageDetails {
                delta: Some(breakdown(1, 1, 1, 1)),
                total: Some(breakdown(input_speech, 0, 0, 0)),
            },
            ..Default::default()
        }
    }

    fn delta_event(input_text: u64) -> UsageEvent {
        UsageEvent {
            details: UsageDetails {
                delta: Some(breakdown(0, input_text, 0, 0)),
                total: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_totals_replace_rather_than_accumulate() {
        let mut tracker = UsageTracker::new();
        tracker.record(&total_event(10));
        let totals = tracker.record(&total_event(12));
        assert_eq!(totals, TokenUsage::new(12, 0, 0, 0));
    }

    #[test]
    fn test_delta_only_accumulates() {
        let mut tracker = UsageTracker::new();
        tracker.record(&delta_event(3));
        let totals = tracker.record(&delta_event(4));
        assert_eq!(totals, TokenUsage::new(0, 7, 0, 0));
    }

    #[test]
    fn test_consecutive_turn_deltas() {
        let mut tracker = UsageTracker::new();

        tracker.begin_turn("c1");
        tracker.record(&total_event(10));
        let first = tracker.end_turn("c1");
        assert_eq!(first.delta, TokenUsage::new(10, 0, 0, 0));

        tracker.begin_turn("c1");
        tracker.record(&total_event(25));
        let second = tracker.end_turn("c1");
        assert_eq!(second.delta, TokenUsage::new(15, 0, 0, 0));
        assert_eq!(second.totals, TokenUsage::new(25, 0, 0, 0));
        assert_eq!(tracker.open_turn_count(), 0);
    }

    #[test]
    fn test_unmatched_end_is_zero() {
        let mut tracker = UsageTracker::new();
        tracker.record(&total_event(40));
        let turn = tracker.end_turn("never-started");
        assert!(turn.delta.is_zero());
        assert_eq!(turn.totals, TokenUsage::new(40, 0, 0, 0));
    }

    #[test]
    fn test_empty_usage_event_changes_nothing() {
        let mut tracker = UsageTracker::new();
        tracker.record(&total_event(5));
        assert_eq!(tracker.record(&UsageEvent::default()), TokenUsage::new(5, 0, 0, 0));
    }
}
