//! Classifying model output as a tool call, a plan or a review.
//!
//! Models wrap their JSON in prose and markdown fences, so extraction collects candidate
//! blobs in priority order (fenced tool calls, fenced plans, fenced reviews, balanced objects
//! carrying a known root key, any fence, the raw text) and classifies the first one that parses.

use patchwright_core::ChangeRequest;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;

const TOOL_KEY: &str = "tool_name";
const PLAN_KEY: &str = "plan_title";
const REVIEW_KEY: &str = "review_decision";
const ROOT_KEYS: [&str; 3] = [TOOL_KEY, PLAN_KEY, REVIEW_KEY];
const VALID_TOOLS: [&str; 3] = ["write_to_files", "fetch_files", "ask_followup_question"];
const MAX_BALANCED_CANDIDATES: usize = 6;

// ═══════════════════════════════════════════════════════════════════════════
//  RESPONSE TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool_name", content = "parameters")]
pub enum ToolCall {
    #[serde(rename = "fetch_files")]
    FetchFiles {
        #[serde(rename = "filePaths")]
        file_paths: Vec<String>,
    },
    #[serde(rename = "write_to_files")]
    WriteToFiles(WriteParams),
    #[serde(rename = "ask_followup_question")]
    AskFollowupQuestion { question: String },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::FetchFiles { .. } => "fetch_files",
            ToolCall::WriteToFiles(_) => "write_to_files",
            ToolCall::AskFollowupQuestion { .. } => "ask_followup_question",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteParams {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub changes: Vec<ChangeRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_title: String,
    #[serde(default)]
    pub overview: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_files: Vec<String>,
    /// Existing files the step builds on; pre-fetched into the coder prompt.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default, deserialize_with = "criteria_text")]
    pub acceptance_criteria: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub review_decision: ReviewDecision,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub files_to_revise: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelResponse {
    Tool(ToolCall),
    Plan(Plan),
    Review(Review),
}

impl ModelResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelResponse::Tool(_) => "tool",
            ModelResponse::Plan(_) => "plan",
            ModelResponse::Review(_) => "review",
        }
    }
}

/// Why a reply could not be used. The message goes back to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    NoJson,
    Malformed(String),
    UnknownShape(Vec<String>),
    InvalidToolName(String),
    Invalid(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Verification failed: ")?;
        match self {
            ParseError::NoJson => write!(f, "No valid JSON blob found in response"),
            ParseError::Malformed(err) => write!(f, "invalid JSON: {}", err),
            ParseError::UnknownShape(keys) => write!(
                f,
                "Cannot determine response type. Available keys: [{}]",
                keys.join(", ")
            ),
            ParseError::InvalidToolName(name) => write!(f, "Invalid tool name: {}", name),
            ParseError::Invalid(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for ParseError {}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "step id must be a string or number, got {}",
            other
        ))),
    }
}

/// Acceptance criteria arrive as prose or as a list of bullet strings.
fn criteria_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => format!("- {}", s),
                    other => format!("- {}", other),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Some(other) => Some(other.to_string()),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════

/// Classify a model reply. The first candidate that parses as a JSON object decides the
/// outcome: a known shape is validated, anything else is an error.
pub fn extract_structured_response(text: &str) -> Result<ModelResponse, ParseError> {
    if !text.contains('{') {
        return Err(ParseError::NoJson);
    }

    let mut first_error: Option<String> = None;
    for candidate in json_candidates(text) {
        let parsed = serde_json::from_str::<Value>(&candidate).or_else(|err| {
            serde_json::from_str::<Value>(&repair_json(&candidate)).map_err(|_| err)
        });
        match parsed {
            Ok(Value::Object(map)) => return classify(map),
            Ok(_) => continue,
            Err(err) => {
                first_error.get_or_insert_with(|| err.to_string());
            }
        }
    }

    match first_error {
        Some(err) => Err(ParseError::Malformed(err)),
        None => Err(ParseError::NoJson),
    }
}

fn classify(map: Map<String, Value>) -> Result<ModelResponse, ParseError> {
    if let Some(name) = map.get(TOOL_KEY) {
        let name = name.as_str().unwrap_or_default().to_string();
        if !VALID_TOOLS.contains(&name.as_str()) {
            return Err(ParseError::InvalidToolName(name));
        }
        if !map.contains_key("parameters") {
            return Err(ParseError::Invalid(
                "JSON is valid but missing required keys for a tool call.".to_string(),
            ));
        }
        let call: ToolCall = serde_json::from_value(Value::Object(map))
            .map_err(|e| ParseError::Invalid(format!("{} parameters are malformed: {}", name, e)))?;
        validate_tool(&call)?;
        return Ok(ModelResponse::Tool(call));
    }

    if map.contains_key(PLAN_KEY) {
        let plan: Plan = serde_json::from_value(Value::Object(map))
            .map_err(|e| ParseError::Invalid(format!("Plan is malformed: {}", e)))?;
        validate_plan(&plan)?;
        return Ok(ModelResponse::Plan(plan));
    }

    if map.contains_key(REVIEW_KEY) {
        let review: Review = serde_json::from_value(Value::Object(map)).map_err(|e| {
            ParseError::Invalid(format!(
                "review_decision must be one of: approved, rejected ({})",
                e
            ))
        })?;
        if review.review_decision == ReviewDecision::Rejected && review.feedback.trim().is_empty()
        {
            return Err(ParseError::Invalid(
                "Rejected reviews must include a non-empty 'feedback' field".to_string(),
            ));
        }
        return Ok(ModelResponse::Review(review));
    }

    Err(ParseError::UnknownShape(map.keys().cloned().collect()))
}

fn validate_tool(call: &ToolCall) -> Result<(), ParseError> {
    match call {
        ToolCall::FetchFiles { file_paths } if file_paths.is_empty() => Err(ParseError::Invalid(
            "filePaths must be a non-empty list.".to_string(),
        )),
        ToolCall::AskFollowupQuestion { question } if question.trim().is_empty() => Err(
            ParseError::Invalid("question must be a non-empty string.".to_string()),
        ),
        _ => Ok(()),
    }
}

fn validate_plan(plan: &Plan) -> Result<(), ParseError> {
    if plan.plan_title.trim().is_empty() {
        return Err(ParseError::Invalid(
            "plan_title must be a non-empty string".to_string(),
        ));
    }
    if plan.steps.is_empty() {
        return Err(ParseError::Invalid("steps must be a non-empty list".to_string()));
    }
    for (i, step) in plan.steps.iter().enumerate() {
        if step.title.trim().is_empty() {
            return Err(ParseError::Invalid(format!(
                "Step #{} title must be a non-empty string",
                i + 1
            )));
        }
    }
    Ok(())
}

/// Best-effort fix for the JSON mistakes models make most: escapes JSON doesn't know
/// (`\``, `\$`), raw newlines inside strings, smart quotes and trailing commas.
fn repair_json(candidate: &str) -> String {
    let normalized = candidate.replace(['\u{201C}', '\u{201D}'], "\"");
    let mut out = String::with_capacity(normalized.len());
    let mut in_string = false;
    let mut chars = normalized.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.peek().copied() {
                    Some(next @ ('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u')) => {
                        out.push('\\');
                        out.push(next);
                        chars.next();
                    }
                    // Unknown escape: keep the character, drop the backslash.
                    Some(_) => {}
                    None => out.push_str("\\\\"),
                },
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let mut rest = chars.clone();
                while rest.peek().is_some_and(|n| n.is_whitespace()) {
                    rest.next();
                }
                if !matches!(rest.peek(), Some(']' | '}')) {
                    out.push(c);
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

fn fenced_blocks(text: &str) -> Vec<String> {
    let Some(re) = fence_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

fn mentions_key(candidate: &str, key: &str) -> bool {
    candidate.contains(&format!("\"{}\"", key))
}

fn json_candidates(text: &str) -> Vec<String> {
    let fenced = fenced_blocks(text);
    let mut candidates = Vec::new();

    for key in ROOT_KEYS {
        for block in fenced.iter().filter(|b| mentions_key(b, key)) {
            push_unique_candidate(&mut candidates, block.as_str());
        }
    }
    for extracted in extract_json_candidates(text, MAX_BALANCED_CANDIDATES) {
        if ROOT_KEYS.iter().any(|key| mentions_key(&extracted, key)) {
            push_unique_candidate(&mut candidates, extracted);
        }
    }
    for block in &fenced {
        push_unique_candidate(&mut candidates, block.as_str());
    }
    push_unique_candidate(&mut candidates, text);
    if let Some(stripped) = strip_markdown_fences(text) {
        push_unique_candidate(&mut candidates, stripped);
    }
    if let Some(unwrapped) = unwrap_outer_wrapper(text) {
        push_unique_candidate(&mut candidates, unwrapped);
    }
    candidates
}

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

fn strip_markdown_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    let without_open = trimmed.strip_prefix("```")?;
    let after_header = if let Some(newline_idx) = without_open.find('\n') {
        &without_open[newline_idx + 1..]
    } else {
        without_open
    };
    let end_idx = after_header.rfind("```")?;
    Some(after_header[..end_idx].trim().to_string())
}

/// `{{ ... }}` and `[{ ... }]` wrappers some models add around the real object.
fn unwrap_outer_wrapper(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.len() < 3 {
        return None;
    }
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        let inner = &trimmed[1..trimmed.len() - 1];
        if inner.trim_start().starts_with('{') {
            return Some(inner.trim().to_string());
        }
    } else if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let inner = &trimmed[1..trimmed.len() - 1];
        if inner.trim_start().starts_with('{') {
            return Some(inner.trim().to_string());
        }
    }
    None
}

fn extract_balanced_json_from(content: &str, start: usize) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_json_candidates(content: &str, max_candidates: usize) -> Vec<String> {
    let mut out = Vec::new();
    if max_candidates == 0 {
        return out;
    }
    for (idx, ch) in content.char_indices() {
        if ch == '{' {
            if let Some(candidate) = extract_balanced_json_from(content, idx) {
                push_unique_candidate(&mut out, candidate);
                if out.len() >= max_candidates {
                    break;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_write_call() {
        let text = r#"{"tool_name":"write_to_files","parameters":{"title":"Add header","summary":"s","implementation":"i","changes":[{"type":"create","path":"src/Header.tsx","content":"export default function Header() { return null; }\n"}]}}"#;
        match extract_structured_response(text).unwrap() {
            ModelResponse::Tool(ToolCall::WriteToFiles(params)) => {
                assert_eq!(params.title, "Add header");
                assert_eq!(params.changes.len(), 1);
                assert_eq!(params.changes[0].path.as_deref(), Some("src/Header.tsx"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prose_and_fences_around_tool_call() {
        let text = "I'll look first.\n\n```tsx\nconst x = {a: 1};\n```\n\n```json\n{\"tool_name\": \"fetch_files\", \"parameters\": {\"filePaths\": [\"src/App.tsx\"]}}\n```\nThanks!";
        assert_eq!(
            extract_structured_response(text).unwrap(),
            ModelResponse::Tool(ToolCall::FetchFiles {
                file_paths: vec!["src/App.tsx".to_string()]
            })
        );
    }

    #[test]
    fn test_unfenced_object_inside_prose() {
        let text = "Sure: {\"tool_name\":\"ask_followup_question\",\"parameters\":{\"question\":\"Which color?\"}} done";
        assert_eq!(
            extract_structured_response(text).unwrap(),
            ModelResponse::Tool(ToolCall::AskFollowupQuestion {
                question: "Which color?".to_string()
            })
        );
    }

    #[test]
    fn test_tool_call_with_backticks_inside_strings() {
        let text = "```json\n{\"tool_name\":\"write_to_files\",\"parameters\":{\"title\":\"t\",\"summary\":\"s\",\"implementation\":\"i\",\"changes\":[{\"type\":\"create\",\"path\":\"README.md\",\"content\":\"```bash\\nnpm i\\n```\\n\"}]}}\n```";
        match extract_structured_response(text).unwrap() {
            ModelResponse::Tool(ToolCall::WriteToFiles(params)) => {
                assert_eq!(params.changes[0].content.as_deref(), Some("```bash\nnpm i\n```\n"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_single_difference_string_is_accepted() {
        let text = r#"{"tool_name":"write_to_files","parameters":{"changes":[{"type":"modify","path":"a.ts","differences":"<<<<<<< SEARCH\na\n=======\nb\n>>>>>>> REPLACE"}]}}"#;
        match extract_structured_response(text).unwrap() {
            ModelResponse::Tool(ToolCall::WriteToFiles(params)) => {
                assert_eq!(params.changes[0].differences.as_ref().map(|d| d.len()), Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plan_with_numeric_ids_and_list_criteria() {
        let text = r#"{"plan_title":"Landing","overview":"Build it","steps":[{"id":1,"title":"Hero","description":"d","expected_files":["src/Hero.tsx"],"requires":[],"acceptance_criteria":["Has heading","Has CTA"]}]}"#;
        match extract_structured_response(text).unwrap() {
            ModelResponse::Plan(plan) => {
                assert_eq!(plan.steps[0].id, "1");
                assert_eq!(
                    plan.steps[0].acceptance_criteria.as_deref(),
                    Some("- Has heading\n- Has CTA")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plan_without_steps_is_invalid() {
        let err = extract_structured_response(r#"{"plan_title":"x","overview":"y","steps":[]}"#)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Verification failed: steps must be a non-empty list"
        );
    }

    #[test]
    fn test_review_shapes() {
        assert_eq!(
            extract_structured_response(r#"{"review_decision":"approved"}"#).unwrap(),
            ModelResponse::Review(Review {
                review_decision: ReviewDecision::Approved,
                feedback: String::new(),
                files_to_revise: Vec::new(),
            })
        );
        assert!(matches!(
            extract_structured_response(r#"{"review_decision":"rejected"}"#),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(
            extract_structured_response(r#"{"review_decision":"maybe"}"#),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            extract_structured_response("no json here").unwrap_err().to_string(),
            "Verification failed: No valid JSON blob found in response"
        );
        assert_eq!(
            extract_structured_response(r#"{"tool_name":"rm_rf","parameters":{}}"#)
                .unwrap_err()
                .to_string(),
            "Verification failed: Invalid tool name: rm_rf"
        );
        assert!(matches!(
            extract_structured_response(r#"{"answer": 42}"#),
            Err(ParseError::UnknownShape(keys)) if keys == vec!["answer".to_string()]
        ));
        assert!(matches!(
            extract_structured_response(r#"{"tool_name": "fetch_files", "parameters": {"filePaths": [}"#),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_fetch_is_invalid() {
        assert!(matches!(
            extract_structured_response(r#"{"tool_name":"fetch_files","parameters":{"filePaths":[]}}"#),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_escapes_are_repaired() {
        let text = r#"{"tool_name":"write_to_files","parameters":{"title":"t","summary":"s","implementation":"i","changes":[{"type":"modify","path":"src/a.ts","differences":["<<<<<<< SEARCH\nconst a = \`x\`;\n=======\nconst a = \`y\`;\n>>>>>>> REPLACE"]}]}}"#;
        match extract_structured_response(text).unwrap() {
            ModelResponse::Tool(ToolCall::WriteToFiles(params)) => {
                assert_eq!(
                    params.changes[0].differences.as_ref().map(|d| d[0].as_str()),
                    Some("<<<<<<< SEARCH\nconst a = `x`;\n=======\nconst a = `y`;\n>>>>>>> REPLACE")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_trailing_commas_and_raw_newlines_are_repaired() {
        let text = "{\"tool_name\": \"ask_followup_question\", \"parameters\": {\"question\": \"Which\ncolor?\",},}";
        assert_eq!(
            extract_structured_response(text).unwrap(),
            ModelResponse::Tool(ToolCall::AskFollowupQuestion {
                question: "Which\ncolor?".to_string()
            })
        );
    }

    #[test]
    fn test_repair_keeps_commas_inside_strings() {
        assert_eq!(repair_json(r#"{"a": "x,}", "b": [1, 2,]}"#), r#"{"a": "x,}", "b": [1, 2]}"#);
    }

    #[test]
    fn test_double_brace_wrapper_is_unwrapped() {
        let text = r#"{{"tool_name":"fetch_files","parameters":{"filePaths":["a.ts"]}}}"#;
        assert!(matches!(
            extract_structured_response(text),
            Ok(ModelResponse::Tool(ToolCall::FetchFiles { .. }))
        ));
    }
}
