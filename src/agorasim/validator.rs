//! Validation of raw LM output against an action grammar.
//!
//! Small models wrap their JSON in markdown fences, leak thinking spans,
//! capitalise action names, and answer integer questions with prose. The
//! validator absorbs all of that:
//!
//! 1. Strip known wrappers (markdown fences, reasoning spans).
//! 2. Parse the payload as a JSON object; failure → skip with
//!    `invalid_json`.
//! 3. Require the grammar's output field; absence → skip with
//!    `missing_field`.
//! 4. Discrete: exact case-insensitive match, then substring match in either
//!    direction ("listening" → "listen"); no match → skip with
//!    `unknown_action`.
//! 5. Integer: accept the number or extract the first integer from a string,
//!    then clamp into `[min, max]`; numeric values are always repairable.
//! 6. Freeform: any required parameter missing → one retry restating only
//!    the missing parameters; a second miss is a skip.
//!
//! A skip is recorded as an event but never poisons the branch.
//!
//! # Example
//!
//! ```rust
//! use agorasim::scenario::ActionGrammar;
//! use agorasim::validator::{validate, Validation};
//!
//! let grammar = ActionGrammar::integer("effort", 1, 7);
//! match validate("```json\n{\"effort\": \"15 tokens\"}\n```", &grammar) {
//!     Validation::Ok(values) => assert_eq!(values["effort"], 7),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

use crate::scenario::ActionGrammar;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a turn was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The response was not parseable JSON.
    InvalidJson,
    /// The grammar's output field was absent.
    MissingField,
    /// A discrete value matched no declared action.
    UnknownAction,
    /// A freeform response was still missing required parameters after the
    /// retry budget.
    MissingParameters,
    /// The LM transport failed beyond the retry budget.
    LlmUnavailable,
    /// The turn was cancelled mid-flight.
    Cancelled,
}

impl SkipReason {
    /// Stable identifier recorded in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InvalidJson => "invalid_json",
            SkipReason::MissingField => "missing_field",
            SkipReason::UnknownAction => "unknown_action",
            SkipReason::MissingParameters => "missing_parameters",
            SkipReason::LlmUnavailable => "llm_unavailable",
            SkipReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one LM response.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// The response maps onto the grammar; the values map holds the
    /// normalised output field (and freeform parameters).
    Ok(serde_json::Map<String, serde_json::Value>),
    /// Required freeform parameters are missing; re-prompt once for exactly
    /// these. `values` holds what the response did carry (including the
    /// output field) so the re-prompt can restate the chosen action.
    Retry {
        missing: Vec<String>,
        values: serde_json::Map<String, serde_json::Value>,
    },
    /// Unrecoverable for this turn.
    Skip { reason: SkipReason },
}

/// Remove ```` ```json ... ``` ```` wrapping that some models output.
pub fn strip_markdown_fences(text: &str) -> &str {
    let mut text = text.trim();
    if text.starts_with("```") {
        // Opening fence with optional language tag (```json).
        text = &text[3..];
        let tag_len = text
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric())
            .count();
        text = &text[tag_len..];
        text = text.trim_end();
        if text.ends_with("```") {
            text = &text[..text.len() - 3];
        }
    }
    text.trim()
}

/// Remove reasoning spans some models emit before the actual JSON.
///
/// Handles both `<think>…</think>` and `<|thinking|>…<|/thinking|>` forms.
pub fn strip_think_tags(text: &str) -> String {
    let without = strip_span(text, "<think>", "</think>");
    let without = strip_span(&without, "<|thinking|>", "<|/thinking|>");
    without.trim().to_string()
}

fn strip_span(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(open) {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after_open = &rest[start + open.len()..];
                match after_open.find(close) {
                    Some(end) => rest = &after_open[end + close.len()..],
                    None => {
                        // Unterminated span: drop everything from the opener.
                        rest = "";
                    }
                }
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// Extract the first (optionally signed) integer from free text.
/// Returns 0 when the text carries no digits, matching the clamp-always
/// contract for integer grammars.
pub fn extract_first_integer(text: &str) -> i64 {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let negative = i > 0 && bytes[i - 1] == b'-';
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(value) = text[start..i].parse::<i64>() {
                return if negative { -value } else { value };
            }
        }
        i += 1;
    }
    0
}

/// Validate a raw LM response against a grammar.
///
/// See the module docs for the rule order. The returned values map is the
/// parsed object with the output field normalised (canonical discrete
/// casing, clamped integers).
pub fn validate(raw: &str, grammar: &ActionGrammar) -> Validation {
    let cleaned = strip_think_tags(strip_markdown_fences(raw));

    let mut values = match serde_json::from_str::<serde_json::Value>(&cleaned) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            return Validation::Skip {
                reason: SkipReason::InvalidJson,
            }
        }
    };

    let field = grammar.output_field();
    let raw_value = match values.get(field) {
        Some(value) => value.clone(),
        None => {
            return Validation::Skip {
                reason: SkipReason::MissingField,
            }
        }
    };

    match grammar {
        ActionGrammar::Discrete { actions, .. } => {
            let raw_action = value_as_text(&raw_value).trim().to_lowercase();

            // Exact match (case-insensitive).
            let matched = actions
                .iter()
                .find(|valid| raw_action == valid.to_lowercase())
                // Fuzzy: a valid action as substring, in either direction.
                // Handles "listening" -> "listen".
                .or_else(|| {
                    actions.iter().find(|valid| {
                        let lower = valid.to_lowercase();
                        raw_action.contains(&lower) || lower.contains(&raw_action)
                    })
                });

            match matched {
                Some(canonical) => {
                    values.insert(
                        field.to_string(),
                        serde_json::Value::String(canonical.clone()),
                    );
                    Validation::Ok(values)
                }
                None => Validation::Skip {
                    reason: SkipReason::UnknownAction,
                },
            }
        }
        ActionGrammar::Integer { min, max, .. } => {
            let value = match raw_value.as_i64() {
                Some(n) => n,
                None => extract_first_integer(&value_as_text(&raw_value)),
            };
            let clamped = value.max(*min).min(*max);
            values.insert(field.to_string(), serde_json::Value::Number(clamped.into()));
            Validation::Ok(values)
        }
        ActionGrammar::Freeform { params, .. } => {
            let missing: Vec<String> = params
                .iter()
                .filter(|p| p.required)
                .filter(|p| match values.get(&p.name) {
                    None | Some(serde_json::Value::Null) => true,
                    Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                    Some(_) => false,
                })
                .map(|p| p.name.clone())
                .collect();

            if missing.is_empty() {
                Validation::Ok(values)
            } else {
                Validation::Retry { missing, values }
            }
        }
    }
}

fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences_without_language_tag() {
        assert_eq!(strip_markdown_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_fences_with_tag_but_no_newline() {
        assert_eq!(strip_markdown_fences("```json{\"a\": 1}```"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_fences_leaves_inner_backticks_alone() {
        assert_eq!(strip_markdown_fences("say `hi` to them"), "say `hi` to them");
    }

    #[test]
    fn test_strip_think_tags_removes_multiple_spans() {
        let text = "<think>one</think>{\"a\": 1}<think>two</think>";
        assert_eq!(strip_think_tags(text), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_think_tags_keeps_text_between_spans() {
        let text = "<think>a</think>left<think>b</think>right";
        assert_eq!(strip_think_tags(text), "leftright");
    }

    #[test]
    fn test_extract_first_integer_ignores_later_numbers() {
        assert_eq!(extract_first_integer("send 3 coins, keep 7"), 3);
    }

    #[test]
    fn test_extract_first_integer_minus_must_be_adjacent() {
        assert_eq!(extract_first_integer("a - 4"), 4);
        assert_eq!(extract_first_integer("-4"), -4);
    }

    #[test]
    fn test_integer_grammar_accepts_float_by_extraction() {
        let grammar = ActionGrammar::integer("effort", 1, 7);
        match validate(r#"{"effort": 4.9}"#, &grammar) {
            Validation::Ok(values) => assert_eq!(values["effort"], 4),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_value_as_text_renders_non_strings() {
        assert_eq!(value_as_text(&serde_json::json!(12)), "12");
        assert_eq!(value_as_text(&serde_json::json!("abc")), "abc");
    }
}
