//! Per-request run logs under `<project>/.patchwright/runs/<run-id>/`.
//!
//! `conversation.md` holds every model turn (messages as fenced JSON, reply, tokens,
//! duration) and `events.jsonl` holds one JSON object per notable event. Write failures are
//! never fatal.

use crate::util::debug_stderr_enabled;
use chrono::Local;
use patchwright_core::{Message, ModelReply};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const RUNS_DIR: &str = ".patchwright/runs";
const CONVERSATION_FILE: &str = "conversation.md";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    ModelCall {
        agent: String,
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        cost: f64,
        duration_secs: f64,
        stop_reason: Option<String>,
    },
    CoderErrors {
        step: String,
        attempt: u32,
        scope: String,
        errors: String,
        error_files: Vec<String>,
    },
    ReviewRejection {
        step: String,
        round: u32,
        feedback: String,
        files_to_revise: Vec<String>,
    },
    RequestSummary {
        request: String,
        status: String,
        planner_tokens: u64,
        coder_tokens: u64,
        reviewer_tokens: u64,
        total_tokens: u64,
        total_time: String,
        total_cost: f64,
    },
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a RunEvent,
}

#[derive(Debug, Clone)]
pub struct RunLog {
    id: String,
    dir: Option<PathBuf>,
}

impl RunLog {
    /// Open a fresh run directory inside `project_root`.
    pub fn create(project_root: &Path) -> anyhow::Result<Self> {
        let id = new_run_id();
        let dir = project_root.join(RUNS_DIR).join(&id);
        fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("Failed to create run log dir {}: {}", dir.display(), e))?;
        Ok(Self { id, dir: Some(dir) })
    }

    /// A log that drops everything.
    pub fn disabled() -> Self {
        Self {
            id: new_run_id(),
            dir: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn record_turn(&self, agent: &str, messages: &[Message], reply: &ModelReply) {
        let Some(dir) = &self.dir else {
            return;
        };
        let mut entry = format!(
            "## {} · {}\n\n### Messages\n\n```json\n",
            agent,
            Local::now().format("%H:%M:%S")
        );
        entry.push_str(
            &serde_json::to_string_pretty(messages).unwrap_or_else(|_| "[]".to_string()),
        );
        entry.push_str("\n```\n\n### Response\n\n");
        entry.push_str(&reply.text);
        entry.push_str(&format!(
            "\n\n- Tokens: {} (prompt {}, completion {})\n- Duration: {:.2}s\n\n---\n\n",
            reply.usage.total_tokens,
            reply.usage.prompt_tokens,
            reply.usage.completion_tokens,
            reply.duration.as_secs_f64()
        ));
        append(&dir.join(CONVERSATION_FILE), &entry);
    }

    pub fn record_event(&self, event: &RunEvent) {
        let Some(dir) = &self.dir else {
            return;
        };
        let line = EventLine {
            timestamp: Local::now().to_rfc3339(),
            event,
        };
        match serde_json::to_string(&line) {
            Ok(json) => append(&dir.join(EVENTS_FILE), &format!("{}\n", json)),
            Err(e) => {
                if debug_stderr_enabled() {
                    eprintln!("  Warning: Failed to serialize run event: {}", e);
                }
            }
        }
    }
}

fn new_run_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), &uuid[..8])
}

fn append(path: &Path, text: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(text.as_bytes()));
    if let Err(e) = result {
        if debug_stderr_enabled() {
            eprintln!("  Warning: Failed to write run log {}: {}", path.display(), e);
        }
    }
}

/// `HH:MM:SS`, hours not wrapped at 24.
pub fn format_hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwright_core::Usage;

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_hms(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_hms(Duration::from_secs(90_000)), "25:00:00");
    }

    #[test]
    fn test_run_id_shape() {
        let log = RunLog::disabled();
        let parts: Vec<&str> = log.id().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_records_turns_and_events() {
        let root = tempfile::tempdir().unwrap();
        let log = RunLog::create(root.path()).unwrap();
        let dir = log.dir().unwrap().to_path_buf();
        assert!(dir.starts_with(root.path().join(RUNS_DIR)));

        let reply = ModelReply {
            text: "{\"tool_name\":\"fetch_files\"}".to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
                cost: None,
            },
            duration: Duration::from_millis(1500),
            stop_reason: Some("stop".to_string()),
        };
        log.record_turn("coder", &[Message::user("hi")], &reply);
        log.record_event(&RunEvent::ReviewRejection {
            step: "1".to_string(),
            round: 1,
            feedback: "missing aria label".to_string(),
            files_to_revise: vec!["src/App.tsx".to_string()],
        });

        let conversation = fs::read_to_string(dir.join(CONVERSATION_FILE)).unwrap();
        assert!(conversation.contains("\"role\": \"user\""));
        assert!(conversation.contains("- Tokens: 12"));
        assert!(conversation.contains("- Duration: 1.50s"));

        let events = fs::read_to_string(dir.join(EVENTS_FILE)).unwrap();
        let first: serde_json::Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(first["event"], "review_rejection");
        assert_eq!(first["files_to_revise"][0], "src/App.tsx");
        assert!(first["timestamp"].is_string());
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let log = RunLog::disabled();
        assert!(log.dir().is_none());
        log.record_event(&RunEvent::CoderErrors {
            step: "1".to_string(),
            attempt: 0,
            scope: "file".to_string(),
            errors: String::new(),
            error_files: Vec::new(),
        });
    }
}
