//! System prompts and lenient parsers for agent replies.
//!
//! Prompts are compile-time constants: they are part of the binary and are
//! never mutated at runtime. The parsers in this module are deliberately
//! forgiving. LLM backends frequently wrap structured replies in prose or
//! code fences, so every parser scans for the payload instead of demanding
//! that the whole reply be well formed, and falls back to a safe default
//! when nothing usable is found.

use crate::makerflow::task::{Intent, Verdict};

/// Primes the preprocessor to normalize input and classify intent.
pub const PREPROCESSOR_PROMPT: &str = "\
You normalize incoming coding requests. Given the raw user message, respond \
with a JSON object of the form \
{\"task\": \"<clean one-paragraph task description>\", \
\"intent\": \"question\" | \"simple_code\" | \"complex_code\"}. \
Use \"question\" for requests answerable with prose and no code, \
\"simple_code\" for single-function tasks, and \"complex_code\" otherwise. \
Respond with the JSON object only.";

/// Primes the preprocessor when it acts as the context summarizer.
pub const SUMMARIZER_PROMPT: &str = "\
You compress conversation history. Given a transcript excerpt, write a \
concise summary that preserves every decision, requirement, constraint, and \
open question, in at most one quarter of the original length. Respond with \
the summary text only.";

/// Primes the planner for both plan production and direct answers.
pub const PLANNER_PROMPT: &str = "\
You are a senior software planner. For coding tasks, produce an ordered list \
of subtasks, each with a short description and the modules it touches. For \
pure questions, answer directly and concisely in prose. \
If codebase tools are listed in the message, you may call one by replying \
with {\"tool_call\": {\"name\": \"<tool>\", \"args\": {...}}} and nothing \
else; the result will be provided and you can continue. Produce your final \
plan or answer as plain text.";

/// Primes the coder for candidate generation.
pub const CODER_PROMPT: &str = "\
You are an expert programmer. Implement exactly what the plan describes. \
Respond with the complete code only, no commentary outside of code comments.";

/// Primes a voter to select one candidate label.
pub const VOTER_PROMPT: &str = "\
You judge code candidates. You will be shown a task and several candidates \
labeled with single letters. Reply with the single letter of the best \
candidate and nothing else.";

/// Primes the dedicated validator.
pub const VALIDATOR_PROMPT: &str = "\
You review generated code against its task and plan. Respond with a JSON \
object of the form {\"status\": \"approved\" | \"failed\", \"feedback\": \
\"<what must change, empty when approved>\"}. Respond with the JSON object \
only.";

/// Reflection prompt for the low-mode validator (planner reflection).
pub const REFLECTION_PROMPT: &str = "\
You wrote the plan below; now review whether the generated code fulfils it. \
Respond with a JSON object of the form {\"status\": \"approved\" | \
\"failed\", \"feedback\": \"<what must change, empty when approved>\"}. \
Respond with the JSON object only.";

/// Scan `text` for the first balanced `{...}` object and return it.
///
/// Uses brace counting rather than whole-document parsing so that payloads
/// wrapped in prose or code fences are still found. Returns `None` when no
/// balanced object exists.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the preprocessor reply into a normalized task and an intent.
///
/// Lenient: on any parse failure the raw reply (trimmed) becomes the task
/// description and the intent defaults to `complex_code`, the safest route
/// through the pipeline.
pub fn parse_preprocess(raw: &str, original_input: &str) -> (String, Intent) {
    if let Some(json) = extract_json_object(raw) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
            let task = value
                .get("task")
                .and_then(|t| t.as_str())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| original_input.trim().to_string());
            let intent = value
                .get("intent")
                .and_then(|i| i.as_str())
                .map(parse_intent)
                .unwrap_or(Intent::ComplexCode);
            return (task, intent);
        }
    }
    let fallback = raw.trim();
    let task = if fallback.is_empty() {
        original_input.trim().to_string()
    } else {
        fallback.to_string()
    };
    (task, Intent::ComplexCode)
}

fn parse_intent(s: &str) -> Intent {
    match s.trim().to_ascii_lowercase().as_str() {
        "question" => Intent::Question,
        "simple_code" => Intent::SimpleCode,
        _ => Intent::ComplexCode,
    }
}

/// Parse a reviewer reply into a [`Verdict`].
///
/// Tries the JSON shape first. When that fails, a literal `approved` token
/// anywhere in the reply counts as approval; otherwise the whole reply is
/// treated as rejection feedback.
pub fn parse_verdict(raw: &str) -> Verdict {
    if let Some(json) = extract_json_object(raw) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
            if let Some(status) = value.get("status").and_then(|s| s.as_str()) {
                let approved = status.trim().eq_ignore_ascii_case("approved");
                let feedback = value
                    .get("feedback")
                    .and_then(|f| f.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                return Verdict { approved, feedback };
            }
        }
    }
    if raw.to_ascii_lowercase().contains("approved") {
        Verdict {
            approved: true,
            feedback: String::new(),
        }
    } else {
        Verdict {
            approved: false,
            feedback: raw.trim().to_string(),
        }
    }
}

/// Parse a voter reply into a candidate label.
///
/// Accepts the first standalone letter that matches a known label,
/// case-insensitively, so replies like `"B"`, `"b."`, or
/// `"I choose B because..."` all count. Returns `None` (an abstention) when
/// no known label appears standalone.
pub fn parse_vote(raw: &str, labels: &[char]) -> Option<char> {
    let chars: Vec<char> = raw.chars().collect();
    for (i, ch) in chars.iter().enumerate() {
        let upper = ch.to_ascii_uppercase();
        if !labels.contains(&upper) {
            continue;
        }
        let prev_ok = i == 0 || !chars[i - 1].is_alphanumeric();
        let next_ok = i + 1 >= chars.len() || !chars[i + 1].is_alphanumeric();
        if prev_ok && next_ok {
            return Some(upper);
        }
    }
    None
}

/// Parse a planner tool call of the form
/// `{"tool_call": {"name": "...", "args": {...}}}`.
///
/// Returns the tool name and its argument object, or `None` when the reply
/// contains no tool call.
pub fn parse_tool_call(raw: &str) -> Option<(String, serde_json::Value)> {
    let start = raw.find("{\"tool_call\"")?;
    let json = extract_json_object(&raw[start..])?;
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let call = value.get("tool_call")?;
    let name = call.get("name")?.as_str()?.to_string();
    let args = call.get("args").cloned().unwrap_or(serde_json::json!({}));
    Some((name, args))
}
