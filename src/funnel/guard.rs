//! Transition guard: decides whether a stage change proposed by the model
//! is committed.
//!
//! The funnel only moves forward. A proposal must clear the confidence
//! threshold, name a known stage, and point past the current one.

use tracing::{debug, warn};

use super::stage::Stage;

/// Default minimum confidence for a stage change.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.70;

/// Outcome of evaluating one proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardVerdict {
    /// Commit the move to this stage.
    Advance(Stage),
    LowConfidence,
    UnknownStage,
    /// Proposed stage equals the current one.
    Unchanged,
    /// Proposed stage lies behind the current one; ignored.
    Backward(Stage),
}

impl GuardVerdict {
    pub fn approved(&self) -> Option<Stage> {
        match self {
            GuardVerdict::Advance(stage) => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionGuard {
    threshold: f64,
}

impl TransitionGuard {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate(&self, current: Stage, proposed: &str, confidence: f64) -> GuardVerdict {
        // NaN fails this comparison too.
        if !(confidence >= self.threshold) {
            debug!(
                "Stage change to '{}' rejected: confidence {:.2} below {:.2}",
                proposed, confidence, self.threshold
            );
            return GuardVerdict::LowConfidence;
        }

        let Some(target) = Stage::parse_loose(proposed) else {
            warn!("Model proposed unknown stage '{}', keeping {}", proposed, current);
            return GuardVerdict::UnknownStage;
        };

        if target == current {
            return GuardVerdict::Unchanged;
        }

        if target.order() < current.order() {
            warn!(
                "Ignoring backward stage proposal {} -> {} (confidence {:.2})",
                current, target, confidence
            );
            return GuardVerdict::Backward(target);
        }

        GuardVerdict::Advance(target)
    }
}

impl Default for TransitionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advances_forward_with_enough_confidence() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::LinkToSend, "link_sent", 0.9),
            GuardVerdict::Advance(Stage::LinkSent)
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::Tagged, "qualified", 0.70),
            GuardVerdict::Advance(Stage::Qualified)
        );
    }

    #[test]
    fn test_low_confidence_rejected_even_for_valid_stage() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::Tagged, "qualified", 0.69),
            GuardVerdict::LowConfidence
        );
        assert_eq!(
            guard.evaluate(Stage::Tagged, "nonsense", 0.1),
            GuardVerdict::LowConfidence
        );
    }

    #[test]
    fn test_nan_confidence_rejected() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::Tagged, "qualified", f64::NAN),
            GuardVerdict::LowConfidence
        );
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::Tagged, "closed_won", 0.95),
            GuardVerdict::UnknownStage
        );
    }

    #[test]
    fn test_same_stage_is_noop() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::Qualified, "QUALIFIED", 0.95),
            GuardVerdict::Unchanged
        );
    }

    #[test]
    fn test_backward_rejected() {
        let guard = TransitionGuard::default();
        let verdict = guard.evaluate(Stage::LinkToSend, "tagged", 0.99);
        assert_eq!(verdict, GuardVerdict::Backward(Stage::Tagged));
        assert_eq!(verdict.approved(), None);
    }

    #[test]
    fn test_skipping_ahead_is_allowed() {
        let guard = TransitionGuard::default();
        assert_eq!(
            guard.evaluate(Stage::Tagged, "link_to_send", 0.8).approved(),
            Some(Stage::LinkToSend)
        );
    }

    #[test]
    fn test_committed_sequence_never_decreases() {
        // Walk every (current, proposed, confidence) sequence drawn from a
        // fixed pseudo-random stream and check the committed stage order.
        let guard = TransitionGuard::default();
        let names = ["new_lead", "tagged", "qualified", "link_to_send", "link_sent", "bogus"];
        let confidences = [0.2, 0.69, 0.7, 0.85, 1.0];

        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..200 {
            let mut current = Stage::NewLead;
            for _ in 0..12 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let name = names[(seed % names.len() as u64) as usize];
                let conf = confidences[((seed >> 8) % confidences.len() as u64) as usize];

                if let Some(next) = guard.evaluate(current, name, conf).approved() {
                    assert!(next.order() > current.order());
                    assert!(conf >= DEFAULT_CONFIDENCE_THRESHOLD);
                    current = next;
                }
            }
        }
    }

    #[test]
    fn test_custom_threshold() {
        let guard = TransitionGuard::new(0.9);
        assert_eq!(
            guard.evaluate(Stage::Tagged, "qualified", 0.85),
            GuardVerdict::LowConfidence
        );
        assert_eq!(guard.threshold(), 0.9);
    }
}
