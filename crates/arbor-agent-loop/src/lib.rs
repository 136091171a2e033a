//! Agent turn orchestration.
//!
//! A turn takes a session leaf, replays the active branch to a language
//! model, runs tool rounds until the model stops asking for tools, and
//! persists exactly one assistant message. Progress is surfaced as a
//! stream of [`StreamFrame`]s carrying UI wire events.
//!
//! [`StreamFrame`]: arbor_protocol_ui_stream::StreamFrame

mod approval;
mod collector;
mod convert;
mod error;
mod executor;
mod runner;
mod settings;
mod subagent;
mod tools;

pub use approval::{apply_tool_answers, ApprovalOutcome};
pub use collector::{RoundCollector, RoundOutput, RoundResult, ToolInvocation};
pub use convert::{build_chat_request, chain_to_chat_messages, to_genai_tool};
pub use error::TurnError;
pub use executor::{
    GenaiLlmExecutor, LlmEventStream, LlmExecutor, ModelResolver, ResolvedModel,
    StaticModelResolver,
};
pub use runner::{AgentIdentity, TurnRequest, TurnRunner, TurnStream};
pub use settings::{EnvSettings, SettingsStore};
pub use subagent::{SubAgentStatus, SubAgentTracker, WaitReport, WaitSubagentTool};
pub use tools::{
    Tool, ToolContext, ToolDescriptor, ToolError, ToolRegistry, UpdatePlanTool, PLAN_UPDATE_TOOL,
};
