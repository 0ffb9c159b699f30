use crate::response::{Plan, PlanStep};
use patchwright_adapters::workspace::{FileBlob, Workspace};
use patchwright_core::util::clip_output;
use patchwright_core::ChangeSummary;
use std::fs;
use std::path::Path;

/// Per-project overrides live in `<project>/.patchwright/prompts/{coder,planner,reviewer}.md`.
const PROMPT_OVERRIDE_DIR: &str = ".patchwright/prompts";
const MAX_ERROR_CHARS: usize = 5000;
const HISTORY_LINES: usize = 5;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

const TOOL_PROTOCOL: &str = r#"TOOLS (reply with exactly ONE JSON object, no prose around it):
- Read files:
  {"tool_name": "fetch_files", "parameters": {"filePaths": ["src/App.tsx"]}}
- Ask the user a clarifying question:
  {"tool_name": "ask_followup_question", "parameters": {"question": "..."}}
- Write all changes for the task in one call:
  {"tool_name": "write_to_files", "parameters": {
    "title": "short commit-style title",
    "summary": "what changed and why",
    "implementation": "how it was implemented",
    "changes": [
      {"type": "create", "path": "src/components/Card.tsx", "content": "<full file>"},
      {"type": "modify", "path": "src/App.tsx", "differences": ["<SEARCH/REPLACE block>"]},
      {"type": "delete", "path": "src/old.ts"}
    ]}}"#;

const DIFF_RULES: &str = r#"MODIFY FORMAT:
Each `differences` entry holds SEARCH/REPLACE blocks with markers on their own lines:
<<<<<<< SEARCH
<exact original lines>
=======
<replacement lines>
>>>>>>> REPLACE
- SEARCH must match the current file byte-for-byte. Fetch a file before modifying it.
- Blocks apply top to bottom; keep them in file order and never overlap them.
- An empty REPLACE deletes the matched lines."#;

pub const CODER_SYSTEM: &str = r#"You are Patchwright-Coder, a senior React + TypeScript engineer working inside an existing Vite project.

You implement exactly what the task asks, with complete, strictly typed, accessible code and no placeholders.
Never use `any`. Components, pages and hooks use `export default`; helpers and types use named exports."#;

pub const PLANNER_SYSTEM: &str = r#"You are Patchwright-Planner, a senior frontend architect. Break the user's request into a short, ordered plan the coder can execute one step at a time.

You may first read files with:
{"tool_name": "fetch_files", "parameters": {"filePaths": ["src/App.tsx"]}}

When ready, reply with exactly ONE JSON object and nothing else:
{
  "plan_title": "...",
  "overview": "...",
  "steps": [
    {
      "id": 1,
      "title": "...",
      "description": "...",
      "expected_files": ["src/components/Hero.tsx"],
      "requires": ["src/App.tsx"],
      "acceptance_criteria": ["..."]
    }
  ]
}
`requires` lists existing files the step needs to read. Keep each step small enough for a single write."#;

pub const REVIEWER_SYSTEM: &str = r#"You are Patchwright-Reviewer, a senior frontend architect reviewing one plan step implemented by Patchwright-Coder. The files you see already passed the type checker.

Judge the step against its description and acceptance criteria: visual quality and layout, correctness of the logic, completeness (no dead buttons or missing states), accessibility (semantic HTML, keyboard access, labels, contrast) and React + TypeScript practice.

Approve only when every acceptance criterion is met and nothing needs fixing. Reply with exactly ONE JSON object:
{"review_decision": "approved"}
or
{"review_decision": "rejected", "feedback": "<actionable changes grouped by severity>", "files_to_revise": ["src/..."]}"#;

const REVIEW_FORMAT_REMINDER: &str = "Your previous message was not a single valid JSON object following the review schema. Please respond with ONLY one JSON object, no prose, using exactly one of:\n{\"review_decision\":\"approved\"}\nOR\n{\"review_decision\":\"rejected\",\"feedback\":\"...\",\"files_to_revise\":[\"path1\",\"path2\"]}";

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

/// Assembles every prompt the agents see from the live workspace.
#[derive(Clone)]
pub struct PromptBuilder {
    workspace: Workspace,
    coder_system: String,
    planner_system: String,
    reviewer_system: String,
}

impl PromptBuilder {
    pub fn new(workspace: Workspace) -> Self {
        let dir = workspace.root().join(PROMPT_OVERRIDE_DIR);
        Self {
            coder_system: load_override(&dir, "coder.md").unwrap_or_else(|| CODER_SYSTEM.to_string()),
            planner_system: load_override(&dir, "planner.md")
                .unwrap_or_else(|| PLANNER_SYSTEM.to_string()),
            reviewer_system: load_override(&dir, "reviewer.md")
                .unwrap_or_else(|| REVIEWER_SYSTEM.to_string()),
            workspace,
        }
    }

    fn project_tree(&self) -> String {
        let tree = self.workspace.project_tree();
        if tree.is_empty() {
            "(empty project)".to_string()
        } else {
            tree
        }
    }

    fn dependencies(&self) -> String {
        self.workspace
            .dependency_summary()
            .unwrap_or_else(|_| "Dependencies: Not available.".to_string())
    }

    fn project_context(&self) -> String {
        format!(
            "## Project Context\n\n### File Tree\n{}\n\n### Installed dependencies\n{}",
            self.project_tree(),
            self.dependencies()
        )
    }

    /// Coder system message: role, tool protocol and diff rules.
    pub fn coder_system(&self) -> String {
        format!("{}\n\n{}\n\n{}", self.coder_system, TOOL_PROTOCOL, DIFF_RULES)
    }

    /// Single-agent task: project context, recent commits and the request itself.
    pub fn direct_task(&self, request: &str, history: &[ChangeSummary]) -> String {
        let mut out = self.project_context();
        let history_lines = format_history_lines(history);
        if history_lines != "(none)" {
            out.push_str(&format!(
                "\n\n### Previous Coder commits\nThe following is a compact history of previous Coder implementations in this project:\n{}",
                history_lines
            ));
        }
        out.push_str(&format!(
            "\n\n## TASK: What you must produce\n\"{}\"\n\n\
             1. **Plan**: first list the minimal set of files you will read to implement this change and why each is needed, and how you will implement each feature. Every component must be fully functional and accessible; pages must have real content.\n\
             2. **Fetch**: then call `fetch_files` to obtain those files (only the files you listed).\n\
             3. Fully implement the request in a single `write_to_files` tool call that includes all file operations.",
            request.trim()
        ));
        out
    }

    /// Planner system message with project context and recent commits.
    pub fn planner_system(&self, history: &[ChangeSummary]) -> String {
        let mut out = format!("{}\n\n{}", self.planner_system, self.project_context());
        let history_lines = format_history_lines(history);
        if history_lines != "(none)" {
            out.push_str(&format!("\n\n### Previous Coder commits\n{}", history_lines));
        }
        out
    }

    /// `(system, task)` for coding `plan.steps[index]`, with the step's required files attached.
    pub fn coder_step_prompt(
        &self,
        plan: &Plan,
        index: usize,
        prefetched: &[FileBlob],
    ) -> (String, String) {
        let system = format!(
            "{}\n\n# Project context & constraints\n\n## File Tree\n{}\n\n## Installed dependencies\n{}",
            self.coder_system(),
            self.project_tree(),
            self.dependencies()
        );

        let step = &plan.steps[index];
        let task = format!(
            "## Overall plan overview:\n{}\n\n## Plan Progress\n\n### Previously Executed Steps\nThese steps have already been completed by you. Assume the code for these exists.\n{}\n\n### Future Steps (To Be Done)\n{}\n\n{}\n\n### Pre-fetched content of relevant files:\nIMPORTANT: If you need the contents of a file that is not listed in these files, you MUST first fetch its content using the fetch_files tool.\n{}",
            plan.overview,
            past_steps(plan, index),
            future_steps(plan, index),
            format_step(step, plan.steps.len()),
            format_file_blobs(prefetched)
        );
        (system, task)
    }

    /// Reviewer system message for one step: role, project context and plan progress.
    pub fn reviewer_system(&self, plan: &Plan, index: usize) -> String {
        format!(
            "{}\n\n# Project Context\n\n## File Tree\n{}\n\n## Installed dependencies\n{}\n\n# Plan overview\n{}\n\n## Previously Executed Steps\n{}\n\n## Future Steps\n{}",
            self.reviewer_system,
            self.project_tree(),
            self.dependencies(),
            plan.overview,
            past_steps(plan, index),
            future_steps(plan, index)
        )
    }

    /// Project-scope repair: the whole context is replaced by `[system, this]`.
    #[allow(clippy::too_many_arguments)]
    pub fn build_repair(
        &self,
        step_id: &str,
        txn_id: &str,
        history: &[ChangeSummary],
        applied_paths: &[String],
        scope_paths: &[String],
        errors: &str,
        blobs: &[FileBlob],
    ) -> String {
        format!(
            "REPAIR MODE: BUILD (TypeScript compile errors)\n\n\
             STEP: {} • TXN: {}\n\
             RECENT CHANGES:\n{}\n\
             WHAT HAPPENED:\n\
             - Prior changes were applied to the workspace (see paths):{}\n\
             - Then we ran: tsc --b --noEmit\n\n\
             TSC OUTPUT (relevant excerpts):\n{}\n\n\
             CONSTRAINTS:\n\
             - SCOPE: Modify only the following files to resolve the compiler errors:\n{}\n\
             - Return exactly one valid JSON tool call using the schema provided by the system.\n\
             - Prefer minimal changes that resolve the errors; preserve public APIs unless necessary.\n\
             - Avoid creating/deleting files unless essential; prefer 'modify'.\n\
             - If you need to know how other files are implemented (props, interfaces), use the project structure below and fetch them with the `fetch_files` tool.\n\n\
             Current Project File Structure:\n {}\n\
             FILES:\n{}\n",
            step_id,
            txn_id,
            format_history_lines(history),
            path_list(applied_paths),
            stringify_errors(errors),
            path_list(scope_paths),
            self.project_tree(),
            format_file_blobs(blobs)
        )
    }
}

fn load_override(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .filter(|text| !text.trim().is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPORTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Corrective message after a reply that could not be classified.
pub fn invalid_json(error: &str) -> String {
    [
        "SYSTEM: ATTENTION - Your previous response was not a valid JSON tool call and failed verification.",
        &format!("The specific error was: **{}**", error),
        "",
        "Please review your last message and provide a corrected and valid JSON tool call.",
        "Your response MUST be a single, valid JSON object that strictly adheres to the structure provided by the system. Do NOT add any explanations, apologies, or conversational text before or after the JSON object.",
    ]
    .join("\n")
}

/// File-scope repair, appended to the running conversation.
pub fn edit_repair(
    step_id: &str,
    txn_id: &str,
    applied_paths: &[String],
    failed_paths: &[String],
    errors: &str,
) -> String {
    format!(
        "ERROR NOTICE: The previous write_to_files request failed validation.\n\n\
         STEP: {} • TXN: {}\n\
         WHAT HAPPENED:\n\
         - Applied (in prior attempt):{}\n\
         - Failed validation / not applied:{}\n\
         Validator message:\n{}\n\
         Please regenerate exactly ONE JSON `write_to_files` tool call (no extra text). Follow these rules precisely:\n\n\
         1. For each file to modify produce exactly one `differences` entry containing a single SEARCH/REPLACE block with these markers on their own lines:\n   \
         <<<<<<< SEARCH\n   \
         <exact original code as it appears in the fetched file, byte-for-byte>\n   \
         =======\n   \
         <replacement code>\n   \
         >>>>>>> REPLACE\n\n\
         2. The SEARCH block MUST match the fetched file content exactly (including whitespace and punctuation). If you are not sure of the exact original text, fetch the file first using the `fetch_files` tool and build the SEARCH block from that response.\n\
         3. Only modify the target lines; keep the surrounding code inside the SEARCH block exactly as in the fetched file so it can be matched.\n\
         4. Do not include extra `>>>>>>> REPLACE` lines or duplicate markers. Use exactly one `<<<<<<< SEARCH`, one `=======` and one `>>>>>>> REPLACE` per `differences` string.\n\
         5. Return exactly one valid JSON tool call object using the schema the system expects and nothing else.\n\
         6. If a SEARCH block was not found, you most likely edited a file without its latest contents. You MUST fetch these files with `fetch_files` before modifying them again.\n",
        step_id,
        txn_id,
        path_list(applied_paths),
        path_list(failed_paths),
        stringify_errors(errors)
    )
}

/// Reviewer rejection turned into a coder task scoped to the files it named.
pub fn review_repair(feedback: &str, blobs: &[FileBlob]) -> String {
    format!(
        "Your previous implementation was subject to review and was rejected. Feedback:\n{}\n\n\
         ## Pre-fetched contents of files the Reviewer requested to modify:\n{}\n\n\
         ## Workflow:\n\
         1. Understand the review and address it only\n\
         2. Do not reimplement the whole step from scratch, address only the review\n\
         3. Think well, plan the set of changes needed and address the review.\n",
        feedback.trim(),
        format_file_blobs(blobs)
    )
}

/// The reviewer's per-round request: the step and the current content of every file it touched.
pub fn review_request(step: &PlanStep, artifacts: &[FileBlob]) -> String {
    let files = if artifacts.is_empty() {
        "No files were created or modified.".to_string()
    } else {
        artifacts
            .iter()
            .map(|a| {
                format!(
                    "FILE: {} (sha256: {})\n```tsx\n{}\n```\n",
                    a.path, a.sha256, a.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Step Implementation Review\nYou are now to review the coder's attempt to complete step {}\n\n\
         ## Completed Step Details:\n\
         **Step Title:** {}\n\
         **Step Description:** {}\n\
         **Expected files:** {}\n\
         **Acceptance criteria:**\n{}\n\n\
         ## Coder's Implementation (Final file contents from this step):\n{}\n\n\
         You must respond with a single valid JSON object.",
        step.id,
        step.title,
        or_placeholder(&step.description, "No description provided"),
        if step.expected_files.is_empty() {
            "None".to_string()
        } else {
            step.expected_files.join(", ")
        },
        step.acceptance_criteria
            .as_deref()
            .unwrap_or("No acceptance criteria specified for the step"),
        files
    )
}

pub fn review_format_reminder() -> &'static str {
    REVIEW_FORMAT_REMINDER
}

// ═══════════════════════════════════════════════════════════════════════════════
// FORMATTING HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn format_file_blobs(blobs: &[FileBlob]) -> String {
    if blobs.is_empty() {
        return "(no files to display)".to_string();
    }
    blobs
        .iter()
        .map(|b| format!("FILE: {}\n```tsx\n{}\n```\n", b.path, b.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last few change-ledger entries, numbered, or "(none)".
pub fn format_history_lines(history: &[ChangeSummary]) -> String {
    if history.is_empty() {
        return "(none)".to_string();
    }
    let start = history.len().saturating_sub(HISTORY_LINES);
    history[start..]
        .iter()
        .enumerate()
        .map(|(i, h)| {
            format!(
                "{}. {}\n   - {}\n   - {}",
                i + 1,
                h.title,
                h.summary,
                h.implementation
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn stringify_errors(errors: &str) -> String {
    clip_output(errors, MAX_ERROR_CHARS)
}

fn path_list(paths: &[String]) -> String {
    if paths.is_empty() {
        return " (none)".to_string();
    }
    let mut sorted: Vec<&str> = paths.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    format!("\n  - {}", sorted.join("\n  - "))
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

fn past_steps(plan: &Plan, index: usize) -> String {
    if index == 0 {
        return "- None (This is the first step)".to_string();
    }
    plan.steps[..index]
        .iter()
        .map(|s| format!("- [x] Step {}: {}", s.id, s.title))
        .collect::<Vec<_>>()
        .join("\n")
}

fn future_steps(plan: &Plan, index: usize) -> String {
    let rest = &plan.steps[index + 1..];
    if rest.is_empty() {
        return "- None (This is the final step)".to_string();
    }
    rest.iter()
        .map(|s| format!("- [ ] Step {}: {} - {}", s.id, s.title, s.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_step(step: &PlanStep, step_count: usize) -> String {
    let files = if step.expected_files.is_empty() {
        "- None".to_string()
    } else {
        step.expected_files
            .iter()
            .map(|f| format!("- `{}`", f))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "## Step {}/{}: {}\n\n**Description:**\n{}\n\n**Files that must be produced in this step:**\n{}\n\n**Acceptance Criteria:**\n{}\n\n## Task:\nFully implement the step in one single `write_to_files` tool call.",
        step.id,
        step_count,
        step.title,
        or_placeholder(&step.description, "N/A"),
        files,
        step.acceptance_criteria.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        let step = |id: &str, title: &str| PlanStep {
            id: id.to_string(),
            title: title.to_string(),
            description: format!("{} description", title),
            expected_files: vec![format!("src/{}.tsx", title)],
            requires: Vec::new(),
            acceptance_criteria: Some("- renders".to_string()),
        };
        Plan {
            plan_title: "Landing".to_string(),
            overview: "Build a landing page".to_string(),
            steps: vec![step("1", "Hero"), step("2", "Pricing"), step("3", "Footer")],
        }
    }

    fn blob(path: &str, content: &str) -> FileBlob {
        FileBlob {
            path: path.to_string(),
            sha256: "abc".to_string(),
            content: content.to_string(),
        }
    }

    fn summary(n: usize) -> ChangeSummary {
        ChangeSummary::clipped(&format!("t{}", n), &format!("s{}", n), &format!("i{}", n))
    }

    #[test]
    fn test_history_keeps_last_five() {
        assert_eq!(format_history_lines(&[]), "(none)");
        let history: Vec<_> = (1..=7).map(summary).collect();
        let lines = format_history_lines(&history);
        assert!(lines.starts_with("1. t3\n   - s3\n   - i3"));
        assert!(lines.ends_with("5. t7\n   - s7\n   - i7"));
    }

    #[test]
    fn test_file_blobs_format() {
        assert_eq!(format_file_blobs(&[]), "(no files to display)");
        assert_eq!(
            format_file_blobs(&[blob("a.ts", "x"), blob("b.ts", "y")]),
            "FILE: a.ts\n```tsx\nx\n```\n\nFILE: b.ts\n```tsx\ny\n```\n"
        );
    }

    #[test]
    fn test_edit_repair_lists_paths() {
        let report = edit_repair(
            "step-1",
            "step-1-txn-1",
            &["b.ts".to_string(), "a.ts".to_string()],
            &[],
            "SEARCH block not found",
        );
        assert!(report.starts_with("ERROR NOTICE: The previous write_to_files request failed validation."));
        assert!(report.contains("STEP: step-1 • TXN: step-1-txn-1"));
        assert!(report.contains("- Applied (in prior attempt):\n  - a.ts\n  - b.ts\n"));
        assert!(report.contains("- Failed validation / not applied: (none)\n"));
        assert!(report.contains("Validator message:\nSEARCH block not found\n"));
    }

    #[test]
    fn test_errors_are_clipped() {
        let long = "e".repeat(6000);
        let clipped = stringify_errors(&long);
        assert!(clipped.ends_with("…(truncated)"));
        assert_eq!(clipped, format!("{}\n…(truncated)", "e".repeat(5000)));
    }

    #[test]
    fn test_build_repair_scopes_to_flagged_files() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write_file("src/a.ts", "x").unwrap();
        let prompts = PromptBuilder::new(ws);
        let report = prompts.build_repair(
            "step-2",
            "step-2-txn-3",
            &[summary(1)],
            &["src/a.ts".to_string(), "src/b.ts".to_string()],
            &["src/a.ts".to_string()],
            "src/a.ts(1,1): error TS2304: Cannot find name 'x'.",
            &[blob("src/a.ts", "x")],
        );
        assert!(report.starts_with("REPAIR MODE: BUILD (TypeScript compile errors)\n\nSTEP: step-2 • TXN: step-2-txn-3\n"));
        assert!(report.contains("to resolve the compiler errors:\n\n  - src/a.ts\n"));
        assert!(report.contains("Current Project File Structure:\n src/\n  a.ts\n"));
        assert!(report.contains("FILES:\nFILE: src/a.ts\n```tsx\nx\n```\n"));
        assert!(report.contains("1. t1"));
    }

    #[test]
    fn test_review_repair_and_request() {
        let repair = review_repair("Add alt text", &[blob("src/Hero.tsx", "<img/>")]);
        assert!(repair.starts_with(
            "Your previous implementation was subject to review and was rejected. Feedback:\nAdd alt text\n"
        ));
        assert!(repair.contains("FILE: src/Hero.tsx\n```tsx\n<img/>\n```"));

        let plan = plan();
        let request = review_request(&plan.steps[0], &[blob("src/Hero.tsx", "<img/>")]);
        assert!(request.starts_with("# Step Implementation Review"));
        assert!(request.contains("FILE: src/Hero.tsx (sha256: abc)\n```tsx\n<img/>\n```\n"));
        assert!(review_request(&plan.steps[0], &[]).contains("No files were created or modified."));
    }

    #[test]
    fn test_coder_step_prompt_partitions_steps() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = PromptBuilder::new(Workspace::new(dir.path()).unwrap());
        let plan = plan();

        let (system, first) = prompts.coder_step_prompt(&plan, 0, &[]);
        assert!(system.contains("write_to_files"));
        assert!(first.contains("- None (This is the first step)"));
        assert!(first.contains("- [ ] Step 2: Pricing - Pricing description"));
        assert!(first.contains("## Step 1/3: Hero"));
        assert!(first.contains("(no files to display)"));

        let (_, last) = prompts.coder_step_prompt(&plan, 2, &[]);
        assert!(last.contains("- [x] Step 1: Hero\n- [x] Step 2: Pricing"));
        assert!(last.contains("- None (This is the final step)"));
    }

    #[test]
    fn test_project_prompt_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join(PROMPT_OVERRIDE_DIR)).unwrap();
        fs::write(dir.path().join(PROMPT_OVERRIDE_DIR).join("planner.md"), "Custom planner").unwrap();
        let prompts = PromptBuilder::new(ws);
        assert!(prompts.planner_system(&[]).starts_with("Custom planner"));
        assert!(prompts.coder_system().starts_with(CODER_SYSTEM));
    }

    #[test]
    fn test_direct_task_mentions_history_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = PromptBuilder::new(Workspace::new(dir.path()).unwrap());
        let without = prompts.direct_task("Add a navbar", &[]);
        assert!(!without.contains("Previous Coder commits"));
        assert!(without.contains("## TASK: What you must produce\n\"Add a navbar\""));
        assert!(without.contains("Dependencies: Not available."));
        let with = prompts.direct_task("Add a navbar", &[summary(1)]);
        assert!(with.contains("Previous Coder commits"));
    }

    #[test]
    fn test_invalid_json_prompt() {
        let text = invalid_json("Verification failed: No valid JSON blob found in response");
        assert!(text.starts_with("SYSTEM: ATTENTION"));
        assert!(text.contains("**Verification failed: No valid JSON blob found in response**"));
    }
}
