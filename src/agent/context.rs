//! Prompt assembly for one funnel turn.
//!
//! Everything the model needs is packed into a single prompt: who it is,
//! where the lead stands in the funnel, what the stage is trying to achieve,
//! the recent conversation, the new message, and the exact JSON shape to
//! answer with.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::funnel::{Stage, StageCatalog};
use crate::store::conversation::{MessageRow, Role};

/// Builds the per-turn prompt from the stage catalog.
pub struct PromptBuilder {
    catalog: Arc<StageCatalog>,
    persona: String,
    confidence_threshold: f64,
}

impl PromptBuilder {
    pub fn new(catalog: Arc<StageCatalog>, persona: &str, confidence_threshold: f64) -> Self {
        Self {
            catalog,
            persona: persona.trim().to_string(),
            confidence_threshold,
        }
    }

    /// Build the prompt for a lead at `stage`.
    ///
    /// `history` must be chronological and must not include `new_message`.
    pub fn build(&self, stage: Stage, history: &[MessageRow], new_message: &str) -> String {
        let def = self.catalog.get(stage);
        let mut parts: Vec<String> = Vec::new();

        if !self.persona.is_empty() {
            parts.push(self.persona.clone());
        }

        parts.push(format!("# Current Stage\n{}", stage.as_str().to_uppercase()));
        parts.push(format!("# Objective\n{}", def.objective));
        parts.push(format!("# Script Guidance\n{}", bullet_list(&def.script)));

        let snippets = self.snippet_section(stage);
        if !snippets.is_empty() {
            parts.push(format!(
                "# Reusable Phrases\nQuote or adapt these when they fit.\n{}",
                snippets
            ));
        }

        match def.next {
            Some(next) => {
                let indicators = &self.catalog.get(next).indicators;
                let body = if indicators.is_empty() {
                    "(none listed)".to_string()
                } else {
                    bullet_list(indicators)
                };
                parts.push(format!(
                    "# Signals for Moving to {}\n{}",
                    next.as_str().to_uppercase(),
                    body
                ));
            }
            None => parts.push(
                "# Final Stage\nThe lead already received the link. Keep helping, do not propose another stage."
                    .to_string(),
            ),
        }

        parts.push(format!("# Conversation History\n{}", render_history(history)));
        parts.push(format!("# New User Message\n{}", new_message.trim()));
        parts.push(self.instructions(stage));
        parts.push(response_format());

        parts.join("\n\n")
    }

    fn snippet_section(&self, stage: Stage) -> String {
        let mut out = String::new();
        let stage_snippets = &self.catalog.get(stage).snippets;
        for (id, text) in stage_snippets.iter().chain(self.catalog.generic_snippets()) {
            let _ = writeln!(out, "- [{}] {}", id, text);
        }
        out.trim_end().to_string()
    }

    fn instructions(&self, stage: Stage) -> String {
        let allowed: Vec<&str> = Stage::ALL
            .iter()
            .filter(|s| s.order() > stage.order())
            .map(|s| s.as_str())
            .collect();
        let allowed = if allowed.is_empty() {
            "none".to_string()
        } else {
            allowed.join(", ")
        };

        format!(
            "# Instructions\n\
             - Reply in the lead's language, with short chat-style messages.\n\
             - Follow the script guidance and the objective of the current stage.\n\
             - Propose a stage change only when the signals above are clearly present. \
             Stages only move forward; valid targets from here: {allowed}.\n\
             - A stage change is applied only if your confidence is at least {threshold:.1}; \
             use a lower confidence when unsure.\n\
             - If you cannot answer (medical questions, complaints, payments, anything outside the script), \
             set requires_human to true, leave messages empty and describe the issue in human_task.\n\
             - Put any new facts about the lead (name, age, goal, city...) in user_info.",
            threshold = self.confidence_threshold,
        )
    }
}

/// `USER: ...` / `ASSISTANT: ...` lines, or a placeholder when empty.
pub fn render_history(history: &[MessageRow]) -> String {
    if history.is_empty() {
        return "No previous conversation.".to_string();
    }
    history
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
            };
            format!("{}: {}", who, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("- {}", s.replace('\n', "\n  ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn response_format() -> String {
    concat!(
        "# Response Format\n",
        "Answer with ONE JSON object and nothing else:\n",
        "{\n",
        "  \"messages\": [{\"text\": \"first message\", \"delay_ms\": 0}, {\"text\": \"second message\", \"delay_ms\": 1500}],\n",
        "  \"should_change_lifecycle\": false,\n",
        "  \"new_lifecycle\": \"stage name or null\",\n",
        "  \"reasoning\": \"why you answered this way and why the stage should or should not change\",\n",
        "  \"confidence\": 0.0,\n",
        "  \"requires_human\": false,\n",
        "  \"human_task\": {\"title\": \"...\", \"description\": \"...\", \"assigned_to\": null, \"metadata\": {}},\n",
        "  \"user_info\": {}\n",
        "}\n",
        "Escape double quotes inside text values. human_task may be null when requires_human is false.",
    )
    .to_string()
}
