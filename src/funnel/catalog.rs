//! Stage catalog: per-stage script guidance, objective, transition
//! indicators and reusable snippets.
//!
//! The catalog is built once at startup (either the built-in content or a
//! JSON override) and never mutated afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use super::stage::Stage;

/// Static definition of one funnel stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Script guidance, as an ordered list of message parts.
    pub script: Vec<String>,
    pub objective: String,
    /// Human-readable signals that the lead is ready for the next stage.
    #[serde(default)]
    pub indicators: Vec<String>,
    pub next: Option<Stage>,
    /// Reusable phrases the model may quote at this stage (id -> text).
    #[serde(default)]
    pub snippets: BTreeMap<String, String>,
    /// Suggested next actions for an operator watching the conversation.
    #[serde(default)]
    pub next_actions: Vec<String>,
}

/// On-disk shape of a catalog override file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    stages: BTreeMap<Stage, StageDefinition>,
    #[serde(default)]
    generic_snippets: BTreeMap<String, String>,
}

/// Immutable stage -> definition map.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    /// Indexed by `Stage::order()`.
    definitions: Vec<StageDefinition>,
    generic_snippets: BTreeMap<String, String>,
}

impl StageCatalog {
    /// Build a catalog, checking that every stage is defined and that the
    /// `next` pointers follow the fixed funnel order.
    pub fn new(
        mut stages: BTreeMap<Stage, StageDefinition>,
        generic_snippets: BTreeMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut definitions = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let Some(def) = stages.remove(&stage) else {
                bail!("catalog is missing stage '{}'", stage);
            };
            if def.next != stage.next() {
                bail!(
                    "stage '{}' must point to {:?}, found {:?}",
                    stage,
                    stage.next().map(Stage::as_str),
                    def.next.map(Stage::as_str)
                );
            }
            if def.script.is_empty() {
                bail!("stage '{}' has an empty script", stage);
            }
            definitions.push(def);
        }
        Ok(Self {
            definitions,
            generic_snippets,
        })
    }

    /// Load a catalog override from a JSON file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading stage catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing stage catalog {}", path.display()))?;
        Self::new(file.stages, file.generic_snippets)
    }

    pub fn get(&self, stage: Stage) -> &StageDefinition {
        &self.definitions[stage.order()]
    }

    /// Snippets usable at any stage (objections, cost questions, ...).
    pub fn generic_snippets(&self) -> &BTreeMap<String, String> {
        &self.generic_snippets
    }

    /// Look up a snippet by id across every stage and the generic set.
    pub fn snippet(&self, id: &str) -> Option<&str> {
        self.definitions
            .iter()
            .find_map(|d| d.snippets.get(id))
            .or_else(|| self.generic_snippets.get(id))
            .map(String::as_str)
    }

    /// The fixed welcome message sent on a lead's very first message.
    pub fn welcome_text(&self) -> String {
        self.get(Stage::NewLead).script.join("\n\n")
    }

    /// The content shipped with the binary.
    pub fn builtin() -> Self {
        let mut stages = BTreeMap::new();

        stages.insert(
            Stage::NewLead,
            StageDefinition {
                script: lines(&[
                    "Hi! Thanks for writing to me!",
                    "This is an automatic message I wrote myself so I could thank you right away for your trust 🙏",
                    "I get hundreds of requests every day and I want to give you the personal attention you deserve.",
                    "In the meantime, could you tell me:\n1) The goal you would like to reach, in detail\n2) What you have tried in the past to reach it\n3) Your age",
                    "Ps. Your name too, so I don't make any gaffes 😅",
                    "As soon as I read your answer I'll reply to you personally!",
                ]),
                objective: "Thank the lead and collect the basics: name, specific goal, past attempts, age".into(),
                indicators: lines(&[
                    "The user writes first, e.g. \"Hi! I saw you on Facebook, I'd like more information\"",
                ]),
                next: Some(Stage::Tagged),
                snippets: BTreeMap::new(),
                next_actions: lines(&[
                    "Collect information about the lead's problems",
                    "Show empathy and understanding",
                    "Ask open questions about their needs",
                ]),
            },
        );

        stages.insert(
            Stage::Tagged,
            StageDefinition {
                script: lines(&[
                    "Here I am, sorry for the late reply, how are you? I get a lot of requests and I care about answering personally. Shall we continue our conversation?",
                    "[If any information is missing, ask for it here]",
                    "Your choice of [goal] is a great starting point, especially at [age], and shows your determination to take care of yourself consciously.",
                ]),
                objective: "Dig deeper into the lead's information and confirm interest".into(),
                indicators: lines(&[
                    "You have all the information you need (name, goal, past attempts, age)",
                    "The lead confirmed they want to continue",
                    "The lead gave additional details about their goal",
                ]),
                next: Some(Stage::Qualified),
                snippets: snippets(&[
                    ("level_2", "Great! :)"),
                    (
                        "level_2_b",
                        "To help you as best I can, let me ask:\n1) What result would you like to achieve?\n2) What have you tried in the past?\n3) May I ask your age?",
                    ),
                    ("level_2_c", "Ps. May I ask your name so I don't make any gaffes? 🙏"),
                ]),
                next_actions: lines(&[
                    "Explore the lead's motivation",
                    "Ask how important solving the problem is for them",
                    "Gauge urgency on a 1-10 scale",
                ]),
            },
        );

        stages.insert(
            Stage::Qualified,
            StageDefinition {
                script: lines(&[
                    "Perfect, now I have a clearer picture of your situation.",
                    "With a balanced and sustainable approach you can reach your goal without extreme sacrifices, keeping your well-being and peace of mind. Your motivation is precious and deserves all the support it needs to turn into lasting results.",
                    "Our personalised nutrition and psychology programme has helped hundreds of people in your same situation. We work on:\n✓ A personalised nutrition plan\n✓ Targeted psychological support\n✓ Practical strategies for everyday life\n✓ Constant progress monitoring",
                    "The nice thing is that we always start with a free consultation to understand exactly which path is best for you.",
                ]),
                objective: "Present the benefits of the integrated programme and introduce the free consultation".into(),
                indicators: lines(&[
                    "The lead showed interest in the free consultation",
                    "The lead asked questions about the services",
                    "The lead confirmed they want to know more",
                ]),
                next: Some(Stage::LinkToSend),
                snippets: snippets(&[
                    ("level_3_a", "Thanks for sharing 🙏"),
                    (
                        "level_3_b",
                        "But I'd like to understand your motivation: what makes you want to change right now?",
                    ),
                    ("level_3_c", "And your age, please 😊🙏"),
                ]),
                next_actions: lines(&[
                    "Present the benefits of the integrated programme",
                    "Explain the nutrition + psychology approach",
                    "Introduce the free consultation",
                ]),
            },
        );

        stages.insert(
            Stage::LinkToSend,
            StageDefinition {
                script: lines(&[
                    "Fantastic! I'm really happy to hear you so determined.",
                    "The first free consultation lasts about 45 minutes and during the call:\n- We'll look at your current situation together\n- We'll define the goals you want to reach\n- We'll show you how our method can help you\n- We'll answer all your questions",
                    "It is completely free and with no commitment. If you then decide to continue with us, we'll be happy to walk with you on your path.",
                    "Are you ready to book your free consultation?",
                ]),
                objective: "Explain the consultation and get the go-ahead to send the booking link".into(),
                indicators: lines(&[
                    "The lead confirmed interest with words like 'yes', 'maybe', 'ok', 'sounds good'",
                    "The lead mentioned when they are available ('morning', 'afternoon', 'evening')",
                    "The lead asked any positive question about the process",
                    "The lead showed any sign of wanting to proceed",
                    "MOVE TO link_sent AT THE FIRST POSITIVE SIGN - DO NOT ASK FOR FURTHER CONFIRMATION",
                ]),
                next: Some(Stage::LinkSent),
                snippets: snippets(&[
                    (
                        "level_4_a_no_availability",
                        "How about this plan... let's book a free call whenever you have a moment and see how I can help you",
                    ),
                    (
                        "level_4_b",
                        "We can discuss your goals in more detail and design an action plan to reach them! What do you think?",
                    ),
                ]),
                next_actions: lines(&[
                    "Explain what happens in the free consultation",
                    "Reassure that it comes with no commitment",
                    "Ask for confirmation before sending the link",
                ]),
            },
        );

        stages.insert(
            Stage::LinkSent,
            StageDefinition {
                script: lines(&[
                    "Perfect! Here is the link to book your free consultation:\n👉 https://calendly.com/free-consultation-nutrition-psychology",
                    "Pick the time you prefer among the available ones. You'll receive a confirmation email with all the details of the appointment.",
                    "I suggest you prepare by thinking about:\n- Your main goals\n- The difficulties you are facing\n- Any questions you want to ask",
                    "I'm sure it will be the start of a great journey for you! Talk soon! 🌟",
                ]),
                objective: "Send the link and complete the conversion".into(),
                indicators: Vec::new(),
                next: None,
                snippets: snippets(&[
                    (
                        "level_5_a",
                        "Perfect!🔥 I'm sending you the booking link so you can pick the day and time that suit you best. You'll also find a few questions that help me prepare for our call",
                    ),
                    (
                        "level_5_b",
                        "The booking link expires after 10 minutes, would you have 30 seconds to complete it now? It only takes a moment :)",
                    ),
                ]),
                next_actions: lines(&[
                    "Goal reached!",
                    "Help with the booking if needed",
                ]),
            },
        );

        let generic = snippets(&[
            (
                "budget",
                "I completely understand that the investment may feel important. My commitment is to offer a path that brings real value and lasting results for your health. I remain available for any doubt or if you want to talk about it again in the future. Talk soon! 💚",
            ),
            (
                "budget_objection",
                "Do you think the investment would be sustainable for you, if it matched what you are looking for? :)",
            ),
            (
                "cost_a",
                "The consultation is completely free, while the 1-to-1 programme starts from 150 €/month, but everything depends on what you need so that I can guarantee you results",
            ),
            (
                "cost_b",
                "Shall I send you the link to book the free consultation so you can pick the day and time that suit you best?",
            ),
            (
                "info",
                "I work in integrative nutrition online: with my team we help people transform their body and eating habits through a personalised combination of nutrition, sport and food psychology.",
            ),
            (
                "not_now",
                "I understand, and thank you for being open. Don't worry, we'll be here. When the time is right, let me know and I'll be here to help 🙏",
            ),
            ("under18", "Thanks for sharing, but I only work with people over 18 🙏"),
            (
                "late_reply",
                "Here I am, sorry for the late reply, how are you? I get a lot of requests and I care about answering personally.",
            ),
        ]);

        Self {
            definitions: Stage::ALL
                .iter()
                .filter_map(|s| stages.remove(s))
                .collect(),
            generic_snippets: generic,
        }
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn snippets(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
