//! Read-only tools the model can call between edits: `fetch_files` and
//! `ask_followup_question`. `write_to_files` goes through [`crate::apply`].

use patchwright_adapters::workspace::{FetchStatus, FetchedFile, Workspace};
use patchwright_core::UserPrompter;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

#[derive(Clone)]
pub struct ToolExecutor {
    workspace: Workspace,
    prompter: Arc<dyn UserPrompter>,
}

impl ToolExecutor {
    pub fn new(workspace: Workspace, prompter: Arc<dyn UserPrompter>) -> Self {
        Self {
            workspace,
            prompter,
        }
    }

    pub fn fetch_files(&self, paths: &[String]) -> Vec<FetchedFile> {
        paths.iter().map(|p| self.workspace.fetch_file(p)).collect()
    }

    /// Fetch and render the result as the message handed back to the model.
    pub fn fetch_files_report(&self, paths: &[String]) -> String {
        eprintln!("  + Fetching {} file(s)", paths.len());
        format_fetch_result(&self.fetch_files(paths))
    }

    /// Ask the user and render the answer for the model. A failed prompt is reported, not raised.
    pub fn ask_report(&self, question: &str) -> String {
        match self.prompter.ask(question) {
            Ok(answer) => format!(
                "Tool: ask_followup_question\n  Status: success\n  Answer: {}",
                answer.trim()
            ),
            Err(e) => format!(
                "Tool: ask_followup_question\n  Status: error\n  Result: {}",
                e
            ),
        }
    }
}

pub fn format_fetch_result(files: &[FetchedFile]) -> String {
    let mut lines = vec!["Tool: fetch_files".to_string()];
    for file in files {
        lines.push(format!("  File: {}", file.file_path));
        match file.status {
            FetchStatus::Success => {
                lines.push("  Status: success".to_string());
                lines.push(format!(
                    "  Content: {}",
                    file.content.as_deref().unwrap_or_default()
                ));
                if let Some(meta) = &file.metadata {
                    lines.push(format!("    File Size: {} bytes", meta.file_size));
                    lines.push(format!("    Encoding: {}", meta.encoding));
                    lines.push(format!("    Last Modified: {}", meta.last_modified));
                }
            }
            FetchStatus::Error => {
                lines.push("  Status: error".to_string());
                lines.push(format!(
                    "    Error: {}",
                    file.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }
    lines.join("\n")
}

/// Asks on stdout and reads one line from stdin.
pub struct StdinPrompter;

impl UserPrompter for StdinPrompter {
    fn ask(&self, question: &str) -> anyhow::Result<String> {
        let mut out = io::stdout();
        writeln!(out, "\n{}", question)
            .and_then(|_| write!(out, ">>> "))
            .and_then(|_| out.flush())
            .map_err(|e| anyhow::anyhow!("Failed to write question: {}", e))?;

        let mut answer = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| anyhow::anyhow!("Failed to read answer: {}", e))?;
        if read == 0 {
            return Err(anyhow::anyhow!("No answer: input closed"));
        }
        Ok(answer.trim_end().to_string())
    }
}
