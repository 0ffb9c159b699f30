use crate::util::truncate;
use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
//  CONVERSATION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage and cost for one or more model calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Cost in USD. Providers report it as either `cost` or `total_cost`.
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost = match (self.cost, other.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
    }
}

/// Merge two optional `Usage` values, summing their token counts and costs.
pub fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(mut p), Some(s)) => {
            p.add(&s);
            Some(p)
        }
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

/// A finished model call.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub text: String,
    pub usage: Usage,
    pub duration: Duration,
    pub stop_reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
//  CHANGES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ChangeKind::Create),
            "modify" => Some(ChangeKind::Modify),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One entry of a `write_to_files` batch, as the model sent it.
///
/// Every field is optional so that a malformed entry becomes a per-change error instead of
/// rejecting the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(rename = "type", default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub differences: Option<Vec<String>>,
}

impl ChangeRequest {
    pub fn create(path: &str, content: &str) -> Self {
        Self {
            change_type: Some("create".to_string()),
            path: Some(path.to_string()),
            content: Some(content.to_string()),
            differences: None,
        }
    }

    pub fn modify(path: &str, differences: Vec<String>) -> Self {
        Self {
            change_type: Some("modify".to_string()),
            path: Some(path.to_string()),
            content: None,
            differences: Some(differences),
        }
    }

    pub fn delete(path: &str) -> Self {
        Self {
            change_type: Some("delete".to_string()),
            path: Some(path.to_string()),
            content: None,
            differences: None,
        }
    }
}

/// Models sometimes send a single diff document instead of a list of them.
fn string_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(doc)) => Some(vec![doc]),
        Some(OneOrMany::Many(docs)) => Some(docs),
        None => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub index: usize,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub change_type: Option<String>,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Which part of the repair context a failed batch needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureScope {
    /// At least one change could not be applied.
    File,
    /// Every change applied but the project no longer type-checks.
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub status: ApplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<FailureScope>,
    pub errors: String,
    pub error_files: Vec<String>,
    pub results: Vec<ChangeOutcome>,
}

impl ApplyReport {
    pub fn success(results: Vec<ChangeOutcome>) -> Self {
        Self {
            status: ApplyStatus::Success,
            scope: None,
            errors: String::new(),
            error_files: Vec::new(),
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ApplyStatus::Success
    }

    /// Paths of changes that landed on disk, sorted and deduplicated.
    pub fn applied_paths(&self) -> Vec<String> {
        sorted_unique(
            self.results
                .iter()
                .filter(|r| r.status == ChangeStatus::Success)
                .filter_map(|r| r.path.clone()),
        )
    }

    /// Paths to repair: the reported error files, or every non-successful change.
    pub fn failed_paths(&self) -> Vec<String> {
        if !self.error_files.is_empty() {
            return sorted_unique(self.error_files.iter().cloned());
        }
        sorted_unique(
            self.results
                .iter()
                .filter(|r| r.status != ChangeStatus::Success)
                .filter_map(|r| r.path.clone()),
        )
    }
}

fn sorted_unique(paths: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = paths.collect();
    out.sort();
    out.dedup();
    out
}

/// Result of a whole-project check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    pub errors: String,
    pub error_files: Vec<String>,
}

impl ValidationReport {
    pub fn passed() -> Self {
        Self {
            success: true,
            errors: String::new(),
            error_files: Vec::new(),
        }
    }

    pub fn failed(errors: impl Into<String>, error_files: Vec<String>) -> Self {
        Self {
            success: false,
            errors: errors.into(),
            error_files,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  ATTEMPTS
// ═══════════════════════════════════════════════════════════════════════════

const SUMMARY_TITLE_MAX: usize = 160;
const SUMMARY_BODY_MAX: usize = 400;
const SUMMARY_IMPLEMENTATION_MAX: usize = 800;

/// What the model said a `write_to_files` batch does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub title: String,
    pub summary: String,
    pub implementation: String,
}

impl ChangeSummary {
    pub fn clipped(title: &str, summary: &str, implementation: &str) -> Self {
        Self {
            title: truncate(title.trim(), SUMMARY_TITLE_MAX),
            summary: truncate(summary.trim(), SUMMARY_BODY_MAX),
            implementation: truncate(implementation.trim(), SUMMARY_IMPLEMENTATION_MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_index: u32,
    pub apply_report: ApplyReport,
    pub change_summary: ChangeSummary,
}

// ═══════════════════════════════════════════════════════════════════════════
//  COLLABORATORS
// ═══════════════════════════════════════════════════════════════════════════

/// Sends a conversation to a model and returns the full reply.
pub trait ModelInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        messages: &'a [Message],
    ) -> Pin<Box<dyn Future<Output = Result<ModelReply>> + Send + 'a>>;
}

/// Checks the whole project after a batch of edits.
pub trait ProjectValidator: Send + Sync {
    fn validate(&self) -> ValidationReport;
}

/// Answers a clarifying question from the model.
pub trait UserPrompter: Send + Sync {
    fn ask(&self, question: &str) -> Result<String>;
}
