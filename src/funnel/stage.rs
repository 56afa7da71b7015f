//! The five funnel stages and their fixed order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stage of the sales funnel, in the order a lead moves through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NewLead,
    Tagged,
    Qualified,
    LinkToSend,
    LinkSent,
}

impl Stage {
    /// Every stage, first to last.
    pub const ALL: [Stage; 5] = [
        Stage::NewLead,
        Stage::Tagged,
        Stage::Qualified,
        Stage::LinkToSend,
        Stage::LinkSent,
    ];

    /// Position in the funnel (0 = first contact).
    pub fn order(self) -> usize {
        match self {
            Stage::NewLead => 0,
            Stage::Tagged => 1,
            Stage::Qualified => 2,
            Stage::LinkToSend => 3,
            Stage::LinkSent => 4,
        }
    }

    /// The stage after this one, or `None` at the end of the funnel.
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.order() + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::LinkSent
    }

    /// Canonical storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::NewLead => "new_lead",
            Stage::Tagged => "tagged",
            Stage::Qualified => "qualified",
            Stage::LinkToSend => "link_to_send",
            Stage::LinkSent => "link_sent",
        }
    }

    /// Map free text (usually a model's `new_lifecycle` value) to a stage.
    ///
    /// Case, surrounding whitespace, and `-`/space separators are ignored.
    /// The legacy Italian names used by earlier deployments are accepted
    /// so that imported rows and older prompts keep resolving.
    pub fn parse_loose(text: &str) -> Option<Stage> {
        let key: String = text
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        match key.as_str() {
            "new_lead" | "nuova_lead" => Some(Stage::NewLead),
            "tagged" | "contrassegnato" => Some(Stage::Tagged),
            "qualified" | "in_target" => Some(Stage::Qualified),
            "link_to_send" | "link_da_inviare" => Some(Stage::LinkToSend),
            "link_sent" | "link_inviato" => Some(Stage::LinkSent),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_strictly_increasing() {
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0].order() < pair[1].order());
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(Stage::LinkSent.next(), None);
    }

    #[test]
    fn test_only_link_sent_is_terminal() {
        let terminal: Vec<Stage> = Stage::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![Stage::LinkSent]);
    }

    #[test]
    fn test_parse_loose_accepts_variants() {
        assert_eq!(Stage::parse_loose("LINK_SENT"), Some(Stage::LinkSent));
        assert_eq!(Stage::parse_loose("  link-to-send "), Some(Stage::LinkToSend));
        assert_eq!(Stage::parse_loose("Qualified"), Some(Stage::Qualified));
        assert_eq!(Stage::parse_loose("in_target"), Some(Stage::Qualified));
        assert_eq!(Stage::parse_loose("link inviato"), Some(Stage::LinkSent));
    }

    #[test]
    fn test_parse_loose_rejects_unknown() {
        assert_eq!(Stage::parse_loose("closed_won"), None);
        assert_eq!(Stage::parse_loose(""), None);
    }

    #[test]
    fn test_as_str_round_trips_through_parse() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse_loose(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Stage::LinkToSend).unwrap();
        assert_eq!(json, "\"link_to_send\"");
    }
}
