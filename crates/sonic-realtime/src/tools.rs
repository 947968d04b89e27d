//! Tool Round-Trip Coordinator
//!
//! A `toolUse` message is cached when it arrives. The matching `contentEnd`
//! of type `TOOL` releases it to a per-session worker, which calls the tool
//! executor and feeds the result back to the model as a tool-result triplet.
//!
//! Overlapping invocations are queued rather than overwritten: each release
//! takes the oldest cached invocation, and the worker runs released
//! invocations one at a time in arrival order.

use crate::inbound::ToolUse;
use crate::session::Session;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use voicebridge_core::{ToolError, ToolExecutor};

/// A cached tool call awaiting execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub tool_name: String,
    pub payload: Value,
}

impl From<&ToolUse> for ToolInvocation {
    fn from(tool_use: &ToolUse) -> Self {
        Self {
            tool_use_id: tool_use.tool_use_id.clone(),
            tool_name: tool_use.tool_name.clone(),
            payload: tool_use.payload(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStage {
    Idle,
    /// A tool use has been received and is waiting for its content end.
    ToolInvoked,
    /// The executor is running, or a released invocation is waiting for it.
    AwaitingResult,
}

#[derive(Debug, Default)]
pub(crate) struct ToolQueue {
    cached: VecDeque<ToolInvocation>,
    ready: VecDeque<ToolInvocation>,
    running: bool,
}

impl ToolQueue {
    pub(crate) fn cache(&mut self, invocation: ToolInvocation) {
        if !self.cached.is_empty() {
            debug!(
                tool_use_id = %invocation.tool_use_id,
                queued = self.cached.len(),
                "Tool use arrived while another is pending, queuing it"
            );
        }
        self.cached.push_back(invocation);
    }

    /// Moves the oldest cached invocation to the ready queue. Returns true
    /// when the caller must start a worker for it.
    pub(crate) fn release(&mut self) -> bool {
        match self.cached.pop_front() {
            Some(invocation) => {
                self.ready.push_back(invocation);
                if self.running {
                    false
                } else {
                    self.running = true;
                    true
                }
            }
            None => {
                warn!("Tool content end without a cached tool use");
                false
            }
        }
    }

    /// The next invocation for the worker; marks the worker stopped when
    /// nothing is left.
    pub(crate) fn take_ready(&mut self) -> Option<ToolInvocation> {
        let next = self.ready.pop_front();
        if next.is_none() {
            self.running = false;
        }
        next
    }

    pub(crate) fn stage(&self) -> ToolStage {
        if self.running || !self.ready.is_empty() {
            ToolStage::AwaitingResult
        } else if !self.cached.is_empty() {
            ToolStage::ToolInvoked
        } else {
            ToolStage::Idle
        }
    }

    pub(crate) fn clear(&mut self) {
        self.cached.clear();
        self.ready.clear();
    }
}

/// Runs one invocation, bounding it with `timeout`.
async fn invoke(
    executor: Option<&Arc<dyn ToolExecutor>>,
    invocation: &ToolInvocation,
    timeout: Duration,
) -> Result<Value, ToolError> {
    let Some(executor) = executor else {
        return Err(ToolError::UnknownTool(invocation.tool_name.clone()));
    };
    let call = executor.execute(&invocation.tool_name, invocation.payload.clone());
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ToolError::Timeout(invocation.tool_name.clone(), timeout)),
    }
}

/// Executes released invocations for `session` until none are left.
pub(crate) async fn run_tool_worker(
    session: Arc<Session>,
    executor: Option<Arc<dyn ToolExecutor>>,
    timeout: Duration,
) {
    while let Some(invocation) = session.next_ready_tool() {
        info!(
            tool_name = %invocation.tool_name,
            tool_use_id = %invocation.tool_use_id,
            "Executing tool"
        );
        let result = match invoke(executor.as_ref(), &invocation, timeout).await {
            Ok(value) => value,
            Err(e) => {
                warn!(tool_name = %invocation.tool_name, error = %e, "Tool execution failed");
                json!({ "error": e.to_string() })
            }
        };
        session.send_tool_result(&invocation, result);
    }
}
