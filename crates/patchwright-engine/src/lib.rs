//! The coding engine: model client, response extraction, change application, the attempt
//! loop and the request orchestrator.

pub mod apply;
pub mod attempt;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod response;
pub mod tools;

pub use apply::ChangeApplier;
pub use attempt::{AttemptOutcome, AttemptStatus, RetryController};
pub use orchestrator::{Orchestrator, OrchestratorState, RequestReport, RequestStatus};
pub use response::{extract_structured_response, ModelResponse, ParseError, Plan, Review, ToolCall};
