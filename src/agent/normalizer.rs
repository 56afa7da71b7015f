//! Model response parsing, repair and normalization.
//!
//! The model is asked for a single JSON object. What comes back is usually
//! close: sometimes wrapped in a markdown fence, sometimes with unescaped
//! quotes inside natural-language values. This module turns that text into
//! a [`ModelDecision`] or fails with [`ChatError::Parsing`].
//!
//! The quote repair is a best-effort heuristic, not a JSON parser. It only
//! touches string values of a fixed set of text-bearing keys and only fixes
//! unescaped `"` characters. Raw newlines and trailing commas are not
//! repaired.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::ChatError;

/// Keys whose string values may contain free text written by the model.
const REPAIR_KEYS: &[&str] = &[
    "messages",
    "message",
    "reply",
    "text",
    "reasoning",
    "title",
    "description",
];

/// Delay for list elements that do not carry their own `delay_ms`.
const LIST_DEFAULT_DELAY_MS: u64 = 1000;

/// One unit of a multi-part reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFragment {
    pub text: String,
    /// Pause before showing the next fragment.
    pub delay_ms: u64,
}

impl ReplyFragment {
    pub fn new(text: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            text: text.into(),
            delay_ms,
        }
    }
}

/// Escalation details as proposed by the model. Every field is optional;
/// the orchestrator fills in defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HumanTaskDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub assigned_to: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Structured form of one model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDecision {
    pub fragments: Vec<ReplyFragment>,
    pub should_change_stage: bool,
    /// Free-text stage name, mapped later by the transition guard.
    pub target_stage: Option<String>,
    pub reasoning: String,
    pub confidence: f64,
    pub requires_human: bool,
    pub human_task: Option<HumanTaskDraft>,
    /// Profile facts the model picked up (name, age, city...).
    pub user_info: Option<Map<String, Value>>,
}

/// Parse raw model output into a [`ModelDecision`].
pub fn parse_model_response(raw: &str) -> Result<ModelDecision, ChatError> {
    debug!("Raw model response: {}", raw);

    let candidate = json_candidate(raw);
    let value = match serde_json::from_str::<Value>(candidate) {
        Ok(v) => v,
        Err(first_err) => {
            let repaired = repair_json_quotes(candidate);
            warn!("Model response is not valid JSON ({}), applying quote repair", first_err);
            debug!("Repaired model response: {}", repaired);
            serde_json::from_str::<Value>(&repaired).map_err(|e| ChatError::Parsing {
                message: format!("invalid JSON after repair: {}", e),
                raw: raw.to_string(),
            })?
        }
    };

    let Value::Object(obj) = value else {
        return Err(ChatError::Parsing {
            message: "expected a JSON object".to_string(),
            raw: raw.to_string(),
        });
    };

    Ok(decision_from_object(&obj))
}

fn decision_from_object(obj: &Map<String, Value>) -> ModelDecision {
    let reply = ["messages", "message", "reply"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null());

    let target_stage = ["new_lifecycle", "new_stage"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    ModelDecision {
        fragments: normalize_reply(reply),
        should_change_stage: flag(obj.get("should_change_lifecycle").or(obj.get("should_change_stage"))),
        target_stage,
        reasoning: obj
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        confidence: parse_confidence(obj.get("confidence")),
        requires_human: flag(obj.get("requires_human")),
        human_task: obj.get("human_task").and_then(Value::as_object).map(task_draft),
        user_info: obj
            .get("user_info")
            .and_then(Value::as_object)
            .filter(|m| !m.is_empty())
            .cloned(),
    }
}

fn task_draft(obj: &Map<String, Value>) -> HumanTaskDraft {
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    HumanTaskDraft {
        title: text("title"),
        description: text("description"),
        assigned_to: text("assigned_to").or_else(|| text("assignee")),
        metadata: obj
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

/// Accepts `true`/`false` and their string spellings.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        _ => false,
    }
}

/// Number or numeric string, clamped to [0, 1]. Anything else is 0.0.
fn parse_confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// Normalize the reply field into fragments.
///
/// - string: one fragment, no delay
/// - object: one fragment keeping its `delay_ms` (default 0)
/// - array: one fragment per element, missing `delay_ms` defaults to 1000
/// - anything else: stringified
pub fn normalize_reply(value: Option<&Value>) -> Vec<ReplyFragment> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![ReplyFragment::new(s.as_str(), 0)],
        Some(Value::Object(obj)) => vec![fragment_from_object(obj, 0)],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(obj) => fragment_from_object(obj, LIST_DEFAULT_DELAY_MS),
                Value::String(s) => ReplyFragment::new(s.as_str(), LIST_DEFAULT_DELAY_MS),
                Value::Null => ReplyFragment::new("", LIST_DEFAULT_DELAY_MS),
                other => ReplyFragment::new(other.to_string(), LIST_DEFAULT_DELAY_MS),
            })
            .collect(),
        Some(other) => vec![ReplyFragment::new(other.to_string(), 0)],
    }
}

fn fragment_from_object(obj: &Map<String, Value>, default_delay: u64) -> ReplyFragment {
    let text = match obj.get("text") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let delay_ms = match obj.get("delay_ms") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    ReplyFragment::new(text, delay_ms.unwrap_or(default_delay))
}

// ---------------------------------------------------------------------------
// Text cleanup
// ---------------------------------------------------------------------------

/// Remove a surrounding markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`...) up to the first newline.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Fence-stripped text, narrowed to the outermost `{...}` when the model
/// wrapped the object in prose.
fn json_candidate(raw: &str) -> &str {
    let text = strip_code_fence(raw);
    if text.starts_with('{') {
        return text;
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Escape stray quotes inside the string values of [`REPAIR_KEYS`].
///
/// Inside such a value, a `"` only closes the string when the next
/// non-whitespace character is `,`, `}`, `]` or the end of input. Any other
/// `"` is escaped. Backslash escapes are copied through untouched.
pub fn repair_json_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '"' {
            if let Some(value_start) = repair_key_value_start(&chars, i) {
                out.extend(&chars[i..value_start]);
                i = copy_string_value(&chars, value_start, &mut out);
                continue;
            }
            // Any other string literal is copied verbatim so keys and values
            // that merely contain a repair key's name are not mistaken for one.
            i = copy_plain_string(&chars, i, &mut out);
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// If `"key": "` starts at `at` for a repair key, return the index just
/// past the value's opening quote.
fn repair_key_value_start(chars: &[char], at: usize) -> Option<usize> {
    let key = REPAIR_KEYS.iter().find(|key| {
        let end = at + 1 + key.chars().count();
        end < chars.len()
            && chars[at + 1..end].iter().copied().eq(key.chars())
            && chars[end] == '"'
    })?;
    let mut j = at + 2 + key.chars().count();
    j = skip_whitespace(chars, j);
    if chars.get(j) != Some(&':') {
        return None;
    }
    j = skip_whitespace(chars, j + 1);
    (chars.get(j) == Some(&'"')).then_some(j + 1)
}

/// Copy a string value starting after its opening quote, escaping stray
/// quotes. Returns the index after the closing quote.
fn copy_string_value(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                out.push('\\');
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
            }
            '"' => {
                let after = skip_whitespace(chars, i + 1);
                if matches!(chars.get(after), None | Some(',' | '}' | ']')) {
                    out.push('"');
                    return i + 1;
                }
                out.push_str("\\\"");
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    i
}

/// Copy a well-formed string literal starting at its opening quote.
fn copy_plain_string(chars: &[char], at: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = at + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        match c {
            '\\' => {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
            }
            '"' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_bare_string() {
        assert_eq!(
            normalize_reply(Some(&json!("hello"))),
            vec![ReplyFragment::new("hello", 0)]
        );
    }

    #[test]
    fn test_normalize_list_fills_missing_delay_only() {
        let value = json!([{"text": "a"}, {"text": "b", "delay_ms": 500}]);
        assert_eq!(
            normalize_reply(Some(&value)),
            vec![ReplyFragment::new("a", 1000), ReplyFragment::new("b", 500)]
        );
    }

    #[test]
    fn test_normalize_single_object_keeps_delay() {
        assert_eq!(
            normalize_reply(Some(&json!({"text": "x", "delay_ms": 250}))),
            vec![ReplyFragment::new("x", 250)]
        );
        assert_eq!(
            normalize_reply(Some(&json!({"text": "x"}))),
            vec![ReplyFragment::new("x", 0)]
        );
    }

    #[test]
    fn test_normalize_odd_shapes() {
        assert!(normalize_reply(None).is_empty());
        assert!(normalize_reply(Some(&Value::Null)).is_empty());
        assert_eq!(normalize_reply(Some(&json!(42))), vec![ReplyFragment::new("42", 0)]);
        assert_eq!(
            normalize_reply(Some(&json!([{"delay_ms": 10}, "plain"]))),
            vec![ReplyFragment::new("", 10), ReplyFragment::new("plain", 1000)]
        );
    }

    #[test]
    fn test_repair_unescaped_inner_quotes() {
        let raw = r#"{"reasoning": "the user said "ok" to me"}"#;
        assert!(serde_json::from_str::<Value>(raw).is_err());

        let repaired = repair_json_quotes(raw);
        let parsed: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["reasoning"], "the user said \"ok\" to me");
    }

    #[test]
    fn test_repair_leaves_escaped_backslash_before_quote() {
        let raw = r#"{"text": "folder C:\\", "reasoning": "fine"}"#;
        let repaired = repair_json_quotes(raw);
        assert_eq!(repaired, raw);
        let parsed: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["text"], "folder C:\\");
    }

    #[test]
    fn test_repair_keeps_already_escaped_quotes() {
        let raw = r#"{"text": "say \"hi\" now"}"#;
        assert_eq!(repair_json_quotes(raw), raw);
    }

    #[test]
    fn test_repair_nested_braces_inside_value() {
        let raw = r#"{"messages": [{"text": "use {braces} and "quotes"", "delay_ms": 0}], "confidence": 0.8}"#;
        let repaired = repair_json_quotes(raw);
        let parsed: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(parsed["messages"][0]["text"], "use {braces} and \"quotes\"");
        assert_eq!(parsed["confidence"], 0.8);
    }

    #[test]
    fn test_repair_ignores_other_keys() {
        let raw = r#"{"new_lifecycle": "tagged", "note": "text"}"#;
        assert_eq!(repair_json_quotes(raw), raw);
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_full_response() {
        let raw = r#"```json
{
  "messages": [{"text": "Great!", "delay_ms": 0}, {"text": "Here is the link"}],
  "should_change_lifecycle": true,
  "new_lifecycle": "link_sent",
  "reasoning": "user accepted",
  "confidence": 0.9,
  "requires_human": false,
  "human_task": null,
  "user_info": {"name": "Marco"}
}
```"#;
        let d = parse_model_response(raw).unwrap();
        assert_eq!(d.fragments.len(), 2);
        assert_eq!(d.fragments[1].delay_ms, 1000);
        assert!(d.should_change_stage);
        assert_eq!(d.target_stage.as_deref(), Some("link_sent"));
        assert_eq!(d.confidence, 0.9);
        assert!(!d.requires_human);
        assert!(d.human_task.is_none());
        assert_eq!(d.user_info.unwrap()["name"], "Marco");
    }

    #[test]
    fn test_parse_reply_field_fallbacks() {
        let d = parse_model_response(r#"{"message": "one"}"#).unwrap();
        assert_eq!(d.fragments, vec![ReplyFragment::new("one", 0)]);

        let d = parse_model_response(r#"{"messages": null, "reply": "two"}"#).unwrap();
        assert_eq!(d.fragments, vec![ReplyFragment::new("two", 0)]);

        let d = parse_model_response(r#"{"reasoning": "nothing to say"}"#).unwrap();
        assert!(d.fragments.is_empty());
    }

    #[test]
    fn test_parse_confidence_variants() {
        assert_eq!(parse_model_response(r#"{"confidence": "0.75"}"#).unwrap().confidence, 0.75);
        assert_eq!(parse_model_response(r#"{"confidence": 7}"#).unwrap().confidence, 1.0);
        assert_eq!(parse_model_response(r#"{"confidence": "high"}"#).unwrap().confidence, 0.0);
        assert_eq!(parse_model_response(r#"{}"#).unwrap().confidence, 0.0);
    }

    #[test]
    fn test_parse_human_task_with_assignee_alias() {
        let raw = r#"{"requires_human": true, "human_task": {"title": "Call back", "assignee": "anna", "metadata": {"topic": "refund"}}}"#;
        let d = parse_model_response(raw).unwrap();
        assert!(d.requires_human);
        let task = d.human_task.unwrap();
        assert_eq!(task.title.as_deref(), Some("Call back"));
        assert_eq!(task.description, None);
        assert_eq!(task.assigned_to.as_deref(), Some("anna"));
        assert_eq!(task.metadata["topic"], "refund");
    }

    #[test]
    fn test_parse_prose_wrapped_object() {
        let d = parse_model_response("Sure! {\"messages\": \"hi\"} hope this helps").unwrap();
        assert_eq!(d.fragments, vec![ReplyFragment::new("hi", 0)]);
    }

    #[test]
    fn test_parse_unrepairable_is_parsing_error() {
        let err = parse_model_response("I cannot answer that").unwrap_err();
        match err {
            ChatError::Parsing { raw, .. } => assert_eq!(raw, "I cannot answer that"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            parse_model_response("[1, 2]"),
            Err(ChatError::Parsing { .. })
        ));
    }

    #[test]
    fn test_parse_repairs_message_text() {
        let raw = r#"{"messages": "Write "YES" to continue", "confidence": 0.4}"#;
        let d = parse_model_response(raw).unwrap();
        assert_eq!(d.fragments[0].text, "Write \"YES\" to continue");
        assert_eq!(d.confidence, 0.4);
    }
}
