use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tool name the runner watches for plan updates. When a call to this tool
/// succeeds, its input is carried into the assistant message metadata under
/// `planUpdate`.
pub const PLAN_UPDATE_TOOL: &str = "update_plan";

/// Errors produced by tool lookup and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool not found: {0}")]
    NotFound(String),
}

/// Static description of a tool, advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Stable identifier, also the function name sent to the model.
    pub id: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: Value,
    /// When set, calls suspend for user approval instead of executing.
    pub requires_approval: bool,
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            parameters: default_parameters(),
            requires_approval: false,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

fn default_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {}
    })
}

/// Per-call execution context handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    /// Provider-assigned id of the call being executed.
    pub tool_call_id: String,
    /// Turn-level cancellation signal. Long-running tools must observe it.
    pub cancel: CancellationToken,
}

/// A callable tool. Output is an opaque JSON value that is persisted on the
/// tool-call part and fed back to the model verbatim.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Whether this specific call must be approved by the user before it
    /// runs. Defaults to the descriptor flag; implementations may inspect
    /// the arguments to approve only some calls.
    fn requires_approval(&self, _args: &Value) -> bool {
        self.descriptor().requires_approval
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Insertion-ordered set of tools keyed by descriptor id.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. A later registration with the same id replaces the
    /// earlier one in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let id = tool.descriptor().id;
        match self.tools.iter().position(|t| t.descriptor().id == id) {
            Some(pos) => self.tools[pos] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|t| t.descriptor().id == id)
            .map(Arc::clone)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.descriptor()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.tools.iter().map(|t| t.descriptor().id).collect();
        f.debug_struct("ToolRegistry").field("tools", &ids).finish()
    }
}

/// Built-in tool that lets the model record a step-by-step plan. The runner
/// mirrors the submitted plan into assistant message metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdatePlanTool;

#[async_trait]
impl Tool for UpdatePlanTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            PLAN_UPDATE_TOOL,
            "Record or revise the step-by-step plan for this session.",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "plan": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "step": { "type": "string" },
                            "status": { "type": "string", "enum": ["pending", "in_progress", "done"] }
                        },
                        "required": ["step"]
                    }
                }
            },
            "required": ["plan"]
        }))
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let steps = args
            .get("plan")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::InvalidArguments("missing plan array".to_string()))?;
        Ok(json!({ "ok": true, "steps": steps.len() }))
    }
}
