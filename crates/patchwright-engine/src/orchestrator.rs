//! Request orchestration: plan, code each step through the retry loop and optionally have
//! every step reviewed before moving on.

use crate::apply::ChangeApplier;
use crate::attempt::{record_model_call, AttemptOutcome, RetryController, RetryLimits};
use crate::prompts::{
    invalid_json, review_format_reminder, review_repair, review_request, PromptBuilder,
};
use crate::response::{extract_structured_response, ModelResponse, Plan, Review, ReviewDecision, ToolCall};
use crate::tools::ToolExecutor;
use patchwright_adapters::config::{Config, Workflow};
use patchwright_adapters::run_log::{format_hms, RunEvent, RunLog};
use patchwright_adapters::workspace::Workspace;
use patchwright_core::{ChangeSummary, Message, ModelInvoker, ProjectValidator, Usage, UserPrompter};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Session history never grows past this many messages, system message included.
const HISTORY_CAP: usize = 14;
/// Change summaries kept for prompts; prompts only render the newest few.
const LEDGER_CAP: usize = 20;
const REVIEW_TRIES: usize = 2;

const DIRECT_DONE: &str = "Request implemented successfully.";
const PLANNED_DONE: &str = "All planned steps were executed successfully.";
const REVIEWED_DONE: &str = "All planned steps were executed and approved successfully.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Planning,
    Coding,
    Reviewing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Failure,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestReport {
    pub status: RequestStatus,
    pub reason: Option<String>,
    pub details: Option<String>,
    pub usage: Usage,
    pub duration: Duration,
}

impl RequestReport {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }
}

/// The three model roles. They may all point at the same client.
#[derive(Clone)]
pub struct Agents {
    pub planner: Arc<dyn ModelInvoker>,
    pub coder: Arc<dyn ModelInvoker>,
    pub reviewer: Arc<dyn ModelInvoker>,
}

/// Why a request stopped early.
struct Failure {
    reason: String,
    details: Option<String>,
}

impl Failure {
    fn new(reason: impl Into<String>, details: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            details,
        }
    }

    fn from_outcome(reason: impl Into<String>, outcome: &AttemptOutcome) -> Self {
        let details = match (&outcome.reason, &outcome.details) {
            (Some(r), Some(d)) => format!("{}: {}", r, d),
            (Some(r), None) => r.clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => String::new(),
        };
        Self::new(reason, Some(details))
    }

    /// Nest this failure under a broader reason, keeping its text as the details.
    fn wrap(self, reason: impl Into<String>) -> Self {
        let details = match self.details {
            Some(d) => format!("{}: {}", self.reason, d),
            None => self.reason,
        };
        Self::new(reason, Some(details))
    }
}

#[derive(Default)]
struct AgentUsage {
    planner: Usage,
    coder: Usage,
    reviewer: Usage,
}

impl AgentUsage {
    fn total(&self) -> Usage {
        let mut total = Usage::default();
        total.add(&self.planner);
        total.add(&self.coder);
        total.add(&self.reviewer);
        total
    }
}

type Flow<T> = anyhow::Result<Result<T, Failure>>;

pub struct Orchestrator {
    config: Config,
    workspace: Workspace,
    agents: Agents,
    applier: ChangeApplier,
    tools: ToolExecutor,
    prompts: PromptBuilder,
    run_log: RunLog,
    state: OrchestratorState,
    history: Vec<Message>,
    ledger: Vec<ChangeSummary>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        workspace: Workspace,
        agents: Agents,
        validator: Arc<dyn ProjectValidator>,
        prompter: Arc<dyn UserPrompter>,
        run_log: RunLog,
    ) -> Self {
        let applier = ChangeApplier::new(workspace.clone(), validator)
            .with_diff_artifacts(config.write_diff_artifacts);
        let tools = ToolExecutor::new(workspace.clone(), prompter);
        let prompts = PromptBuilder::new(workspace.clone());
        let history = vec![Message::system(prompts.coder_system())];
        Self {
            config,
            workspace,
            agents,
            applier,
            tools,
            prompts,
            run_log,
            state: OrchestratorState::Idle,
            history,
            ledger: Vec::new(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn workflow(&self) -> Workflow {
        self.config.workflow
    }

    /// Session history: the system message followed by the most recent request records.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Summaries of every write that completed in this session, oldest first.
    pub fn ledger(&self) -> &[ChangeSummary] {
        &self.ledger
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Carry one request through the configured workflow. Never fails: transport errors become
    /// a failure report and the session can continue.
    pub async fn handle_user_request(&mut self, request: &str) -> RequestReport {
        let started = Instant::now();
        let mut usage = AgentUsage::default();
        self.push_history(json!({ "request": request }));

        let result = match self.config.workflow {
            Workflow::Direct => self.run_direct(request, &mut usage).await,
            Workflow::Planned => self.run_planned(request, false, &mut usage).await,
            Workflow::Reviewed => self.run_planned(request, true, &mut usage).await,
        };
        let (status, reason, details) = match result {
            Ok(Ok(message)) => (RequestStatus::Success, Some(message.to_string()), None),
            Ok(Err(failure)) => (RequestStatus::Failure, Some(failure.reason), failure.details),
            Err(e) => (
                RequestStatus::Failure,
                Some("Request aborted".to_string()),
                Some(e.to_string()),
            ),
        };
        self.state = match status {
            RequestStatus::Success => OrchestratorState::Completed,
            RequestStatus::Failure => OrchestratorState::Failed,
        };

        let duration = started.elapsed();
        let total = usage.total();
        self.run_log.record_event(&RunEvent::RequestSummary {
            request: request.to_string(),
            status: status.as_str().to_string(),
            planner_tokens: usage.planner.total_tokens,
            coder_tokens: usage.coder.total_tokens,
            reviewer_tokens: usage.reviewer.total_tokens,
            total_tokens: total.total_tokens,
            total_time: format_hms(duration),
            total_cost: total.cost(),
        });
        eprintln!(
            "  + {} in {} · {} tokens · ${:.4}",
            match status {
                RequestStatus::Success => "Done",
                RequestStatus::Failure => "Failed",
            },
            format_hms(duration),
            total.total_tokens,
            total.cost()
        );

        RequestReport {
            status,
            reason,
            details,
            usage: total,
            duration,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  WORKFLOWS
    // ═══════════════════════════════════════════════════════════════════════

    async fn run_direct(&mut self, request: &str, usage: &mut AgentUsage) -> Flow<&'static str> {
        self.state = OrchestratorState::Coding;
        let mut context = vec![
            Message::system(self.prompts.coder_system()),
            Message::user(self.prompts.direct_task(request, &self.ledger)),
        ];
        let outcome = self.coder().run("step-1", &mut context, &self.ledger).await?;
        usage.coder.add(&outcome.usage);
        if !outcome.is_success() {
            return Ok(Err(Failure::from_outcome("Coding failed", &outcome)));
        }
        self.record_outcome(&outcome);
        Ok(Ok(DIRECT_DONE))
    }

    async fn run_planned(
        &mut self,
        request: &str,
        review: bool,
        usage: &mut AgentUsage,
    ) -> Flow<&'static str> {
        self.state = OrchestratorState::Planning;
        let plan = match self.plan(request, usage).await? {
            Ok(plan) => plan,
            Err(failure) => return Ok(Err(failure.wrap("Planning phase failed"))),
        };
        eprintln!("  + Plan: {} ({} steps)", plan.plan_title, plan.steps.len());
        self.push_history(json!({ "plan_generated": &plan }));

        for (index, step) in plan.steps.iter().enumerate() {
            eprintln!(
                "  + Step {}/{}: {}",
                index + 1,
                plan.steps.len(),
                step.title
            );
            let step_id = format!("step-{}", index + 1);
            let prefetched = self.workspace.file_blobs(&step.requires);
            let (system, task) = self.prompts.coder_step_prompt(&plan, index, &prefetched);
            let mut coder_memory = vec![Message::system(system), Message::user(task)];

            self.state = OrchestratorState::Coding;
            let outcome = self.coder().run(&step_id, &mut coder_memory, &self.ledger).await?;
            usage.coder.add(&outcome.usage);
            if !outcome.is_success() {
                return Ok(Err(Failure::from_outcome(
                    format!("Failed at step {}", index + 1),
                    &outcome,
                )));
            }
            self.record_outcome(&outcome);

            if review {
                if let Err(failure) = self
                    .review_step(&plan, index, &step_id, &mut coder_memory, &outcome, usage)
                    .await?
                {
                    return Ok(Err(failure.wrap(format!("Failed at step {}", index + 1))));
                }
            }
        }

        Ok(Ok(if review { REVIEWED_DONE } else { PLANNED_DONE }))
    }

    async fn plan(&mut self, request: &str, usage: &mut AgentUsage) -> Flow<Plan> {
        let mut messages = vec![
            Message::system(self.prompts.planner_system(&self.ledger)),
            Message::user(request),
        ];
        let mut invalid: u32 = 0;
        let mut tool_turns: u32 = 0;

        loop {
            let reply = self.agents.planner.invoke(&messages).await?;
            record_model_call(&self.run_log, "planner", &messages, &reply);
            usage.planner.add(&reply.usage);
            messages.push(Message::assistant(reply.text.clone()));

            match extract_structured_response(&reply.text) {
                Ok(ModelResponse::Plan(plan)) => return Ok(Ok(plan)),
                Ok(ModelResponse::Tool(ToolCall::FetchFiles { file_paths })) => {
                    tool_turns += 1;
                    if tool_turns > self.config.max_tool_turns {
                        return Ok(Err(Failure::new(
                            "Planner tool turn limit exceeded",
                            None,
                        )));
                    }
                    messages.push(Message::user(self.tools.fetch_files_report(&file_paths)));
                }
                Ok(other) => {
                    return Ok(Err(Failure::new(
                        "Received an unexpected response type",
                        Some(other.kind().to_string()),
                    )))
                }
                Err(e) => {
                    invalid += 1;
                    if invalid > self.config.max_retries {
                        return Ok(Err(Failure::new(e.to_string(), None)));
                    }
                    eprintln!("  ! Planner reply was not a valid plan, retrying");
                    messages.push(Message::user(invalid_json(&e.to_string())));
                }
            }
        }
    }

    async fn review_step(
        &mut self,
        plan: &Plan,
        index: usize,
        step_id: &str,
        coder_memory: &mut Vec<Message>,
        outcome: &AttemptOutcome,
        usage: &mut AgentUsage,
    ) -> Flow<()> {
        let step = &plan.steps[index];
        let limit = self.config.review_retry_limit;
        let mut step_paths: BTreeSet<String> = outcome.changed_paths.iter().cloned().collect();
        let mut reviewer_memory = vec![Message::system(self.prompts.reviewer_system(plan, index))];
        let mut rejections: u32 = 0;

        loop {
            self.state = OrchestratorState::Reviewing;
            let paths: Vec<String> = step_paths.iter().cloned().collect();
            let artifacts = self.workspace.file_blobs(&paths);
            reviewer_memory.push(Message::user(review_request(step, &artifacts)));

            let Some(review) = self.ask_reviewer(&mut reviewer_memory, usage).await? else {
                return Ok(Err(Failure::new("Planner review returned invalid JSON.", None)));
            };
            if review.review_decision == ReviewDecision::Approved {
                eprintln!("  + Step {} approved", step.id);
                return Ok(Ok(()));
            }

            rejections += 1;
            if rejections > limit {
                return Ok(Err(Failure::new(
                    format!("Planner rejected implementation more than {} times", limit),
                    Some(review.feedback),
                )));
            }
            eprintln!(
                "  ! Step {} rejected by review ({}/{})",
                step.id, rejections, limit
            );
            self.run_log.record_event(&RunEvent::ReviewRejection {
                step: step_id.to_string(),
                round: rejections,
                feedback: review.feedback.clone(),
                files_to_revise: review.files_to_revise.clone(),
            });

            let blobs = self.workspace.file_blobs(&review.files_to_revise);
            coder_memory.push(Message::user(review_repair(&review.feedback, &blobs)));
            self.state = OrchestratorState::Coding;
            let repair = self.coder().run(step_id, coder_memory, &self.ledger).await?;
            usage.coder.add(&repair.usage);
            if !repair.is_success() {
                return Ok(Err(Failure::from_outcome("Repair phase failed", &repair)));
            }
            self.record_outcome(&repair);
            step_paths.extend(repair.changed_paths.iter().cloned());
        }
    }

    /// One review round; `None` when the reviewer never produced a valid decision.
    async fn ask_reviewer(
        &self,
        memory: &mut Vec<Message>,
        usage: &mut AgentUsage,
    ) -> anyhow::Result<Option<Review>> {
        for attempt in 0..REVIEW_TRIES {
            let reply = self.agents.reviewer.invoke(memory).await?;
            record_model_call(&self.run_log, "reviewer", memory, &reply);
            usage.reviewer.add(&reply.usage);
            memory.push(Message::assistant(reply.text.clone()));

            if let Ok(ModelResponse::Review(review)) = extract_structured_response(&reply.text) {
                return Ok(Some(review));
            }
            if attempt + 1 < REVIEW_TRIES {
                memory.push(Message::user(review_format_reminder()));
            }
        }
        Ok(None)
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  HELPERS
    // ═══════════════════════════════════════════════════════════════════════

    fn coder(&self) -> RetryController {
        RetryController::new(
            self.agents.coder.clone(),
            self.applier.clone(),
            self.tools.clone(),
            self.prompts.clone(),
            self.workspace.clone(),
            self.run_log.clone(),
            RetryLimits::from_config(&self.config),
        )
    }

    fn record_outcome(&mut self, outcome: &AttemptOutcome) {
        if let Some(summary) = &outcome.summary {
            if !summary.title.is_empty() {
                self.ledger.push(summary.clone());
                if self.ledger.len() > LEDGER_CAP {
                    self.ledger.remove(0);
                }
            }
        }
    }

    fn push_history(&mut self, record: serde_json::Value) {
        self.history.push(Message::user(record.to_string()));
        while self.history.len() > HISTORY_CAP {
            self.history.remove(1);
        }
    }
}
