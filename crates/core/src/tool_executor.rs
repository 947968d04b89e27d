//! Tool Execution Contracts
//!
//! The streaming engine never runs tools itself. When the model asks for a
//! tool, the engine hands the request to a `ToolExecutor` and waits for the
//! result. This module defines that contract, plus an implementation backed by
//! an MCP client so tools served over the Model Context Protocol can be
//! plugged straight in.

use crate::{catalog::ToolSource, generic_types::ToolSpec};
use anyhow::Context;
use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::{RoleClient, RunningService},
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure modes of a single tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool '{name}' failed: {message}")]
    Failed { name: String, message: String },
    #[error("Tool '{0}' timed out after {1:?}")]
    Timeout(String, Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Executes a named tool with an opaque JSON payload.
///
/// Implementations are expected to enforce their own limits; the engine adds
/// an outer timeout on top of whatever the executor does.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Runs `tool_name` with `payload` and returns its raw result value.
    async fn execute(&self, tool_name: &str, payload: Value) -> Result<Value, ToolError>;
}

/// A `ToolExecutor` that forwards calls to an MCP server.
///
/// The MCP result content list is returned as a JSON array, one element per
/// content item (text items become JSON strings), which the engine then
/// reduces to a single text payload.
pub struct McpToolExecutor {
    client: RunningService<RoleClient, ()>,
}

impl McpToolExecutor {
    /// Wraps an already-initialized MCP client.
    pub fn new(client: RunningService<RoleClient, ()>) -> Self {
        Self { client }
    }
}

/// Converts a serialized MCP `CallToolResult` into the executor's result shape.
fn result_from_mcp(tool_name: &str, raw: Value) -> Result<Value, ToolError> {
    let items: Vec<Value> = raw
        .get("content")
        .and_then(Value::as_array)
        .map(|content| {
            content
                .iter()
                .map(|item| match item.get("text").and_then(Value::as_str) {
                    Some(text) => Value::String(text.to_string()),
                    None => item.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    if raw.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ToolError::Failed {
            name: tool_name.to_string(),
            message,
        });
    }

    Ok(Value::Array(items))
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn execute(&self, tool_name: &str, payload: Value) -> Result<Value, ToolError> {
        let arguments = match payload {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                warn!(tool = %tool_name, payload = %other, "Tool payload is not a JSON object; sending no arguments");
                None
            }
        };

        debug!(tool = %tool_name, "Calling MCP tool");
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
            })
            .await
            .with_context(|| format!("MCP call to '{}' failed", tool_name))?;

        let raw = serde_json::to_value(&result).context("Failed to serialize MCP tool result")?;
        result_from_mcp(tool_name, raw)
    }
}

#[async_trait]
impl ToolSource for McpToolExecutor {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        self.client
            .list_all_tools()
            .await?
            .into_iter()
            .map(|t| {
                Ok(ToolSpec {
                    name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                    input_schema: serde_json::to_value(&*t.input_schema)?,
                })
            })
            .collect()
    }
}
