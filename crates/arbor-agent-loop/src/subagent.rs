use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::tools::{Tool, ToolContext, ToolDescriptor, ToolError};

/// Lifecycle state of a tracked sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Result of a wait-for-sub-agents poll.
///
/// A report is transient when the poll gave up while work was still in
/// flight: either it timed out, or no sub-agent has finished yet while at
/// least one is still running. Transient reports are shown to the client
/// but never persisted as message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitReport {
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_id: Option<String>,
    #[serde(default)]
    pub statuses: HashMap<String, SubAgentStatus>,
}

impl WaitReport {
    pub fn is_transient(&self) -> bool {
        self.timed_out
            || (self.completed_id.is_none()
                && self
                    .statuses
                    .values()
                    .any(|s| *s == SubAgentStatus::Running))
    }
}

struct TrackedSubAgent {
    status: SubAgentStatus,
    cancel: CancellationToken,
    input_tx: Option<mpsc::UnboundedSender<Value>>,
}

#[derive(Default)]
struct TrackerInner {
    agents: HashMap<String, TrackedSubAgent>,
    /// Ids in completion order; the head is the one wait reports first.
    completed: Vec<String>,
}

/// Tracks sub-agent invocations by tool call id.
///
/// The tracker does not run sub-agents itself. The embedder spawns the
/// actual task, keeps the returned cancellation token on it, and reports
/// terminal states back. Wait, abort and send-input operate purely on the
/// tracked entries.
#[derive(Default)]
pub struct SubAgentTracker {
    inner: RwLock<TrackerInner>,
    change: Notify,
}

impl SubAgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sub-agent as running and returns the cancellation token
    /// its task must observe. Re-registering an id replaces the old entry.
    pub async fn spawn(
        &self,
        tool_call_id: &str,
        input_tx: Option<mpsc::UnboundedSender<Value>>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut inner = self.inner.write().await;
        inner.completed.retain(|id| id != tool_call_id);
        inner.agents.insert(
            tool_call_id.to_string(),
            TrackedSubAgent {
                status: SubAgentStatus::Running,
                cancel: cancel.clone(),
                input_tx,
            },
        );
        drop(inner);
        self.change.notify_waiters();
        cancel
    }

    pub async fn mark_completed(&self, tool_call_id: &str) {
        self.mark_terminal(tool_call_id, SubAgentStatus::Completed)
            .await;
    }

    pub async fn mark_failed(&self, tool_call_id: &str) {
        self.mark_terminal(tool_call_id, SubAgentStatus::Failed).await;
    }

    async fn mark_terminal(&self, tool_call_id: &str, status: SubAgentStatus) {
        let mut inner = self.inner.write().await;
        let known = match inner.agents.get_mut(tool_call_id) {
            Some(agent) => {
                agent.status = status;
                true
            }
            None => false,
        };
        if known && !inner.completed.iter().any(|id| id == tool_call_id) {
            inner.completed.push(tool_call_id.to_string());
        }
        drop(inner);
        self.change.notify_waiters();
    }

    /// Cancels a running sub-agent. Returns false when the id is unknown.
    pub async fn abort(&self, tool_call_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(agent) = inner.agents.get_mut(tool_call_id) else {
            return false;
        };
        agent.cancel.cancel();
        if agent.status == SubAgentStatus::Running {
            agent.status = SubAgentStatus::Aborted;
        }
        drop(inner);
        self.change.notify_waiters();
        true
    }

    /// Forwards a message to a sub-agent's input channel. Returns false
    /// when the id is unknown, has no channel, or the channel is closed.
    pub async fn send_input(&self, tool_call_id: &str, input: Value) -> bool {
        let inner = self.inner.read().await;
        match inner.agents.get(tool_call_id).and_then(|a| a.input_tx.as_ref()) {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        }
    }

    pub async fn statuses(&self) -> HashMap<String, SubAgentStatus> {
        let inner = self.inner.read().await;
        inner
            .agents
            .iter()
            .map(|(id, a)| (id.clone(), a.status))
            .collect()
    }

    /// Waits until any tracked sub-agent reaches a terminal completed or
    /// failed state, the timeout elapses, or `cancel` fires. Returns
    /// immediately when nothing is running.
    pub async fn wait_any(&self, timeout: Duration, cancel: &CancellationToken) -> WaitReport {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notification before inspecting state so a completion
            // between the check and the await is not lost.
            let notified = self.change.notified();
            {
                let inner = self.inner.read().await;
                let report = Self::report_locked(&inner, false);
                if report.completed_id.is_some()
                    || !report
                        .statuses
                        .values()
                        .any(|s| *s == SubAgentStatus::Running)
                {
                    return report;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let inner = self.inner.read().await;
                    return Self::report_locked(&inner, true);
                }
                _ = cancel.cancelled() => {
                    let inner = self.inner.read().await;
                    return Self::report_locked(&inner, false);
                }
            }
        }
    }

    fn report_locked(inner: &TrackerInner, timed_out: bool) -> WaitReport {
        WaitReport {
            timed_out,
            completed_id: inner.completed.first().cloned(),
            statuses: inner
                .agents
                .iter()
                .map(|(id, a)| (id.clone(), a.status))
                .collect(),
        }
    }
}

/// Tool the model calls to poll for sub-agent completion. Its output is a
/// [`WaitReport`]; the runner downgrades still-running reports to transient
/// stream frames.
pub struct WaitSubagentTool {
    tracker: Arc<SubAgentTracker>,
    default_timeout: Duration,
}

impl WaitSubagentTool {
    pub fn new(tracker: Arc<SubAgentTracker>) -> Self {
        Self {
            tracker,
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for WaitSubagentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "wait_subagent",
            "Wait for any running sub-agent to finish. Returns the current \
             statuses and, when one finished, its id.",
        )
        .with_parameters(serde_json::json!({
            "type": "object",
            "properties": {
                "timeoutMs": {
                    "type": "integer",
                    "description": "Maximum time to wait before reporting back."
                }
            }
        }))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let timeout = args
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let report = self.tracker.wait_any(timeout, &ctx.cancel).await;
        serde_json::to_value(report).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}
