//! The coder's attempt loop: ask the model, run its tools, apply its writes and repair
//! failures with a narrowed context until the batch validates or the budget runs out.

use crate::apply::ChangeApplier;
use crate::prompts::{edit_repair, invalid_json, PromptBuilder};
use crate::response::{extract_structured_response, ModelResponse, ParseError, ToolCall, WriteParams};
use crate::tools::ToolExecutor;
use patchwright_adapters::config::Config;
use patchwright_adapters::run_log::{RunEvent, RunLog};
use patchwright_adapters::util::debug_stderr_enabled;
use patchwright_adapters::workspace::Workspace;
use patchwright_core::{
    ApplyReport, AttemptRecord, ChangeSummary, FailureScope, Message, ModelInvoker, ModelReply,
    Usage,
};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";
pub const INVALID_FORMAT: &str = "Invalid response format";
pub const TOOL_TURNS_EXCEEDED: &str = "Tool turn limit exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    /// Repairs after the first apply.
    pub max_retries: u32,
    /// Consecutive replies that are not a tool call.
    pub max_format_retries: u32,
    /// fetch/ask turns between two applies.
    pub max_tool_turns: u32,
}

impl RetryLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            max_format_retries: config.max_format_retries,
            max_tool_turns: config.max_tool_turns,
        }
    }
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub reason: Option<String>,
    pub details: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    /// Every path a batch touched on disk during this run, sorted.
    pub changed_paths: Vec<String>,
    /// Summary of the write that finished the run.
    pub summary: Option<ChangeSummary>,
    pub usage: Usage,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}

/// Mutable bookkeeping for one `run`.
#[derive(Default)]
struct RunState {
    attempts: Vec<AttemptRecord>,
    changed: BTreeSet<String>,
    summaries: Vec<ChangeSummary>,
    usage: Usage,
}

impl RunState {
    fn finish(
        self,
        status: AttemptStatus,
        reason: Option<String>,
        details: Option<String>,
        summary: Option<ChangeSummary>,
    ) -> AttemptOutcome {
        AttemptOutcome {
            status,
            reason,
            details,
            attempts: self.attempts,
            changed_paths: self.changed.into_iter().collect(),
            summary,
            usage: self.usage,
        }
    }

    fn fail(self, reason: &str, details: impl Into<String>) -> AttemptOutcome {
        self.finish(
            AttemptStatus::Failure,
            Some(reason.to_string()),
            Some(details.into()),
            None,
        )
    }
}

pub struct RetryController {
    model: Arc<dyn ModelInvoker>,
    applier: ChangeApplier,
    tools: ToolExecutor,
    prompts: PromptBuilder,
    workspace: Workspace,
    run_log: RunLog,
    limits: RetryLimits,
    agent: &'static str,
}

impl RetryController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ModelInvoker>,
        applier: ChangeApplier,
        tools: ToolExecutor,
        prompts: PromptBuilder,
        workspace: Workspace,
        run_log: RunLog,
        limits: RetryLimits,
    ) -> Self {
        Self {
            model,
            applier,
            tools,
            prompts,
            workspace,
            run_log,
            limits,
            agent: "coder",
        }
    }

    /// Drive `context` (system message first) until a batch validates or the budget is spent.
    ///
    /// File-scope failures are reported into `context`. A project-scope failure moves the
    /// conversation to a fresh `[system, report]` context and leaves `context` as it was, so
    /// later repairs of the same step can start from it again.
    pub async fn run(
        &self,
        step_id: &str,
        context: &mut Vec<Message>,
        history: &[ChangeSummary],
    ) -> anyhow::Result<AttemptOutcome> {
        let mut state = RunState::default();
        let mut repair: Option<Vec<Message>> = None;
        let mut format_failures: u32 = 0;
        let mut tool_turns: u32 = 0;

        loop {
            let messages = active(context, &mut repair);
            let reply = self.model.invoke(messages).await?;
            record_model_call(&self.run_log, self.agent, messages, &reply);
            state.usage.add(&reply.usage);
            messages.push(Message::assistant(reply.text.clone()));

            let parsed = match extract_structured_response(&reply.text) {
                Ok(ModelResponse::Tool(call)) => Ok(call),
                Ok(other) => Err(ParseError::Invalid(format!(
                    "Expected a tool call but received a {}",
                    other.kind()
                ))),
                Err(e) => Err(e),
            };
            let call = match parsed {
                Ok(call) => {
                    format_failures = 0;
                    call
                }
                Err(e) => {
                    format_failures += 1;
                    if format_failures > self.limits.max_format_retries {
                        eprintln!("  ! Model kept replying without a valid tool call");
                        return Ok(state.fail(INVALID_FORMAT, e.to_string()));
                    }
                    eprintln!(
                        "  ! Invalid response, asking for a corrected tool call ({}/{})",
                        format_failures, self.limits.max_format_retries
                    );
                    messages.push(Message::user(invalid_json(&e.to_string())));
                    continue;
                }
            };

            let params = match call {
                ToolCall::WriteToFiles(params) => params,
                tool => {
                    tool_turns += 1;
                    if tool_turns > self.limits.max_tool_turns {
                        return Ok(state.fail(
                            TOOL_TURNS_EXCEEDED,
                            format!(
                                "More than {} tool turns without a write",
                                self.limits.max_tool_turns
                            ),
                        ));
                    }
                    messages.push(Message::user(self.run_tool(tool)));
                    continue;
                }
            };
            tool_turns = 0;

            let summary =
                ChangeSummary::clipped(&params.title, &params.summary, &params.implementation);
            if params.changes.is_empty() {
                eprintln!("  + No changes requested");
                return Ok(state.finish(AttemptStatus::Success, None, None, Some(summary)));
            }

            let attempt_index = state.attempts.len() as u32;
            let txn_id = format!("{}-txn-{}", step_id, attempt_index + 1);
            eprintln!(
                "  + Applying {} change(s) [{}]",
                params.changes.len(),
                txn_id
            );
            let report = self.apply(&params).await?;

            state.summaries.push(summary.clone());
            state.attempts.push(AttemptRecord {
                attempt_index,
                apply_report: report.clone(),
                change_summary: summary.clone(),
            });

            if report.is_success() {
                state.changed.extend(report.applied_paths());
                eprintln!("  + Changes applied and validated");
                return Ok(state.finish(AttemptStatus::Success, None, None, Some(summary)));
            }

            let scope = report.scope.unwrap_or(FailureScope::File);
            let scope_label = match scope {
                FailureScope::File => "file",
                FailureScope::Project => "project",
            };
            self.run_log.record_event(&RunEvent::CoderErrors {
                step: step_id.to_string(),
                attempt: attempt_index + 1,
                scope: scope_label.to_string(),
                errors: report.errors.clone(),
                error_files: report.error_files.clone(),
            });
            eprintln!(
                "  ! Attempt {}/{} failed ({} scope)",
                attempt_index + 1,
                self.limits.max_retries + 1,
                scope_label
            );
            if debug_stderr_enabled() {
                eprintln!("{}", report.errors);
            }

            let applied = match scope {
                FailureScope::File => report.applied_paths(),
                FailureScope::Project => all_paths(&report),
            };
            state.changed.extend(applied.iter().cloned());

            if state.attempts.len() as u32 > self.limits.max_retries {
                let errors = report.errors;
                return Ok(state.fail(MAX_RETRIES_EXCEEDED, errors));
            }

            match scope {
                FailureScope::File => {
                    let prompt = edit_repair(
                        step_id,
                        &txn_id,
                        &applied,
                        &report.failed_paths(),
                        &report.errors,
                    );
                    active(context, &mut repair).push(Message::user(prompt));
                }
                FailureScope::Project => {
                    let scope_paths = report.failed_paths();
                    let mut recent = history.to_vec();
                    recent.extend(state.summaries.iter().cloned());
                    let prompt = self.prompts.build_repair(
                        step_id,
                        &txn_id,
                        &recent,
                        &applied,
                        &scope_paths,
                        &report.errors,
                        &self.workspace.file_blobs(&scope_paths),
                    );
                    let system = context
                        .first()
                        .cloned()
                        .unwrap_or_else(|| Message::system(self.prompts.coder_system()));
                    repair = Some(vec![system, Message::user(prompt)]);
                }
            }
        }
    }

    fn run_tool(&self, call: ToolCall) -> String {
        match call {
            ToolCall::FetchFiles { file_paths } => self.tools.fetch_files_report(&file_paths),
            ToolCall::AskFollowupQuestion { question } => self.tools.ask_report(&question),
            ToolCall::WriteToFiles(_) => String::new(),
        }
    }

    async fn apply(&self, params: &WriteParams) -> anyhow::Result<ApplyReport> {
        let applier = self.applier.clone();
        let changes = params.changes.clone();
        tokio::task::spawn_blocking(move || applier.apply_changes(&changes))
            .await
            .map_err(|e| anyhow::anyhow!("Apply task failed: {}", e))
    }
}

/// Conversation to markdown, usage to the event log.
pub(crate) fn record_model_call(
    run_log: &RunLog,
    agent: &str,
    messages: &[Message],
    reply: &ModelReply,
) {
    run_log.record_turn(agent, messages, reply);
    run_log.record_event(&RunEvent::ModelCall {
        agent: agent.to_string(),
        prompt_tokens: reply.usage.prompt_tokens,
        completion_tokens: reply.usage.completion_tokens,
        total_tokens: reply.usage.total_tokens,
        cost: reply.usage.cost(),
        duration_secs: reply.duration.as_secs_f64(),
        stop_reason: reply.stop_reason.clone(),
    });
}

fn active<'c>(base: &'c mut Vec<Message>, repair: &'c mut Option<Vec<Message>>) -> &'c mut Vec<Message> {
    match repair {
        Some(messages) => messages,
        None => base,
    }
}

/// Every path the batch named, whether or not the validator demoted it.
fn all_paths(report: &ApplyReport) -> Vec<String> {
    report
        .results
        .iter()
        .filter_map(|r| r.path.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchwright_core::{ProjectValidator, Role, UserPrompter, ValidationReport};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<VecDeque<String>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Vec<Message>> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ModelInvoker for ScriptedModel {
        fn invoke<'a>(
            &'a self,
            messages: &'a [Message],
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ModelReply>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(messages.to_vec());
                let text = self
                    .replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
                Ok(ModelReply {
                    text,
                    usage: Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                        cost: Some(0.01),
                    },
                    ..ModelReply::default()
                })
            })
        }
    }

    struct ScriptedValidator {
        reports: Mutex<VecDeque<ValidationReport>>,
        calls: Mutex<u32>,
    }

    impl ProjectValidator for ScriptedValidator {
        fn validate(&self) -> ValidationReport {
            *self.calls.lock().unwrap() += 1;
            self.reports
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(ValidationReport::passed)
        }
    }

    struct Answer;

    impl UserPrompter for Answer {
        fn ask(&self, _question: &str) -> anyhow::Result<String> {
            Ok("use blue".to_string())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        workspace: Workspace,
        validator: Arc<ScriptedValidator>,
    }

    fn harness(reports: Vec<ValidationReport>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        Harness {
            _dir: dir,
            workspace,
            validator: Arc::new(ScriptedValidator {
                reports: Mutex::new(reports.into()),
                calls: Mutex::new(0),
            }),
        }
    }

    impl Harness {
        fn controller(&self, model: Arc<ScriptedModel>, limits: RetryLimits) -> RetryController {
            let applier = ChangeApplier::new(self.workspace.clone(), self.validator.clone())
                .with_diff_artifacts(false);
            RetryController::new(
                model,
                applier,
                ToolExecutor::new(self.workspace.clone(), Arc::new(Answer)),
                PromptBuilder::new(self.workspace.clone()),
                self.workspace.clone(),
                RunLog::disabled(),
                limits,
            )
        }
    }

    fn limits(max_retries: u32) -> RetryLimits {
        RetryLimits {
            max_retries,
            max_format_retries: 3,
            max_tool_turns: 25,
        }
    }

    fn write(changes: serde_json::Value) -> String {
        json!({
            "tool_name": "write_to_files",
            "parameters": {
                "title": "Update",
                "summary": "Updates files",
                "implementation": "Edits",
                "changes": changes
            }
        })
        .to_string()
    }

    fn bad_modify() -> String {
        write(json!([{
            "type": "modify",
            "path": "src/a.ts",
            "differences": ["<<<<<<< SEARCH\nlet missing = 0;\n=======\nlet a = 2;\n>>>>>>> REPLACE"]
        }]))
    }

    fn base_context() -> Vec<Message> {
        vec![Message::system("coder system"), Message::user("task")]
    }

    #[tokio::test]
    async fn test_budget_is_max_retries_plus_one() {
        let h = harness(Vec::new());
        h.workspace.write_file("src/a.ts", "let a = 1;\n").unwrap();
        let model = ScriptedModel::new(vec![bad_modify(), bad_modify(), bad_modify(), bad_modify()]);
        let controller = h.controller(model.clone(), limits(2));

        let mut context = base_context();
        let outcome = controller.run("step-1", &mut context, &[]).await.unwrap();

        assert_eq!(outcome.status, AttemptStatus::Failure);
        assert_eq!(outcome.reason.as_deref(), Some(MAX_RETRIES_EXCEEDED));
        assert!(outcome.details.unwrap().contains("SEARCH block not found"));
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(model.seen().len(), 3);
        assert_eq!(outcome.usage.total_tokens, 45);
        assert_eq!(h.workspace.read_file("src/a.ts").unwrap(), "let a = 1;\n");

        // File-scope repairs stay in the running conversation.
        let repairs: Vec<_> = context
            .iter()
            .filter(|m| m.content.starts_with("ERROR NOTICE"))
            .collect();
        assert_eq!(repairs.len(), 2);
        assert!(repairs[1].content.contains("TXN: step-1-txn-2"));
        assert!(repairs[1].content.contains("- Failed validation / not applied:\n  - src/a.ts"));
    }

    #[tokio::test]
    async fn test_project_failure_resets_context() {
        let h = harness(vec![ValidationReport::failed(
            "src/a.ts(1,7): error TS2322: Type 'string' is not assignable to type 'number'.",
            vec!["src/a.ts".to_string()],
        )]);
        let first = write(json!([
            {"type": "create", "path": "src/a.ts", "content": "const a: number = 'x';"},
            {"type": "create", "path": "src/b.ts", "content": "export {};"}
        ]));
        let second = write(json!([
            {"type": "create", "path": "src/a.ts", "content": "const a: number = 1;"}
        ]));
        let model = ScriptedModel::new(vec![first, second]);
        let controller = h.controller(model.clone(), limits(3));

        let mut context = base_context();
        let outcome = controller.run("step-2", &mut context, &[]).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.changed_paths, vec!["src/a.ts", "src/b.ts"]);

        let seen = model.seen();
        assert_eq!(seen[1].len(), 2);
        assert_eq!(seen[1][0].role, Role::System);
        assert_eq!(seen[1][0].content, "coder system");
        let report = &seen[1][1].content;
        assert!(report.starts_with("REPAIR MODE: BUILD"));
        assert!(report.contains("STEP: step-2 • TXN: step-2-txn-1"));
        assert!(report.contains("FILE: src/a.ts\n```tsx\nconst a: number = 'x';\n```"));
        assert!(!report.contains("FILE: src/b.ts"));

        // The step context keeps only the first exchange.
        assert_eq!(context.len(), 3);
        assert_eq!(context[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_budget_counts_project_scope_failures() {
        let failing = || {
            ValidationReport::failed(
                "src/a.ts(1,7): error TS2322: Type 'string' is not assignable to type 'number'.",
                vec!["src/a.ts".to_string()],
            )
        };
        let h = harness((0..4).map(|_| failing()).collect());
        let create = || {
            write(json!([
                {"type": "create", "path": "src/a.ts", "content": "const a: number = 'x';"}
            ]))
        };
        let model = ScriptedModel::new((0..4).map(|_| create()).collect());
        let controller = h.controller(model.clone(), limits(3));

        let mut context = base_context();
        let outcome = controller.run("step-1", &mut context, &[]).await.unwrap();

        assert_eq!(outcome.status, AttemptStatus::Failure);
        assert_eq!(outcome.reason.as_deref(), Some(MAX_RETRIES_EXCEEDED));
        assert_eq!(outcome.attempts.len(), 4);
        assert_eq!(*h.validator.calls.lock().unwrap(), 4);

        // Every project-scope repair restarts from the system prompt plus one repair message.
        let seen = model.seen();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|messages| messages.len() == 2));
    }

    #[tokio::test]
    async fn test_tools_and_invalid_json_do_not_consume_budget() {
        let h = harness(Vec::new());
        h.workspace.write_file("src/a.ts", "let a = 1;").unwrap();
        let model = ScriptedModel::new(vec![
            "Sure, I will fix it!".to_string(),
            json!({"tool_name": "fetch_files", "parameters": {"filePaths": ["src/a.ts"]}}).to_string(),
            json!({"tool_name": "ask_followup_question", "parameters": {"question": "Which color?"}}).to_string(),
            write(json!([{"type": "create", "path": "src/c.ts", "content": "export const c = 1;"}])),
        ]);
        let controller = h.controller(model.clone(), limits(0));

        let mut context = base_context();
        let outcome = controller.run("step-1", &mut context, &[]).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(model.seen().len(), 4);
        assert!(context[3].content.starts_with("SYSTEM: ATTENTION"));
        assert!(context[5].content.contains("Content: let a = 1;"));
        assert!(context[7].content.contains("Answer: use blue"));
        assert_eq!(outcome.summary.unwrap().title, "Update");
    }

    #[tokio::test]
    async fn test_empty_write_is_a_no_op_success() {
        let h = harness(Vec::new());
        let model = ScriptedModel::new(vec![write(json!([]))]);
        let controller = h.controller(model, limits(3));

        let mut context = base_context();
        let outcome = controller.run("step-1", &mut context, &[]).await.unwrap();

        assert!(outcome.is_success());
        assert!(outcome.attempts.is_empty());
        assert!(outcome.changed_paths.is_empty());
        assert_eq!(*h.validator.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_format_retries_are_bounded() {
        let h = harness(Vec::new());
        let plan = json!({"plan_title": "P", "steps": [{"id": 1, "title": "S"}]}).to_string();
        let model = ScriptedModel::new(vec!["no json".to_string(), plan, "still none".to_string()]);
        let mut limits = limits(3);
        limits.max_format_retries = 2;
        let controller = h.controller(model.clone(), limits);

        let mut context = base_context();
        let outcome = controller.run("step-1", &mut context, &[]).await.unwrap();

        assert_eq!(outcome.reason.as_deref(), Some(INVALID_FORMAT));
        assert!(outcome.details.unwrap().contains("Verification failed"));
        assert_eq!(model.seen().len(), 3);
        assert!(context
            .iter()
            .any(|m| m.content.contains("Expected a tool call but received a plan")));
    }

    #[tokio::test]
    async fn test_tool_turns_are_bounded() {
        let h = harness(Vec::new());
        let fetch =
            json!({"tool_name": "fetch_files", "parameters": {"filePaths": ["a.ts"]}}).to_string();
        let model = ScriptedModel::new(vec![fetch.clone(), fetch.clone(), fetch]);
        let mut limits = limits(3);
        limits.max_tool_turns = 2;
        let controller = h.controller(model, limits);

        let mut context = base_context();
        let outcome = controller.run("step-1", &mut context, &[]).await.unwrap();

        assert_eq!(outcome.reason.as_deref(), Some(TOOL_TURNS_EXCEEDED));
    }

    #[tokio::test]
    async fn test_transport_errors_propagate() {
        let h = harness(Vec::new());
        let controller = h.controller(ScriptedModel::new(Vec::new()), limits(3));
        let mut context = base_context();
        let err = controller.run("step-1", &mut context, &[]).await.unwrap_err();
        assert!(err.to_string().contains("script exhausted"));
    }
}
