//! Built-in Tool Server
//!
//! A small MCP server exposing the tools every voice session gets out of the
//! box. It runs in-process and is reached through an in-memory duplex pipe,
//! so the engine talks to built-in and remote tools through the same MCP
//! client code path.

use crate::tool_executor::McpToolExecutor;
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::info;

/// Arguments for the `get_date_and_time` tool.
#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct DateTimeArgs {
    #[schemars(description = "Offset from UTC in whole hours, between -12 and 14. Defaults to 0 (UTC).")]
    pub utc_offset_hours: Option<i32>,
}

/// MCP server for the built-in tools.
pub struct BuiltinToolServer {
    tool_router: ToolRouter<Self>,
}

impl Default for BuiltinToolServer {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_handler]
impl ServerHandler for BuiltinToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl BuiltinToolServer {
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    /// Reports the current date and time, shifted to the requested UTC offset.
    #[tool(
        description = "Get the current date and time. Accepts an optional UTC offset in hours."
    )]
    pub async fn get_date_and_time(&self, args: Parameters<DateTimeArgs>) -> Result<String, String> {
        info!(args = ?args.0, "Executing tool 'get_date_and_time'");
        let offset_hours = args.0.utc_offset_hours.unwrap_or(0);
        if !(-12..=14).contains(&offset_hours) {
            return Err(format!("Invalid UTC offset: {}", offset_hours));
        }
        let offset = FixedOffset::east_opt(offset_hours * 3600)
            .ok_or_else(|| format!("Invalid UTC offset: {}", offset_hours))?;
        let now = Utc::now().with_timezone(&offset);
        serde_json::to_string(&describe_instant(&now))
            .map_err(|e| format!("Failed to serialize date: {}", e))
    }
}

fn describe_instant(now: &DateTime<FixedOffset>) -> Value {
    json!({
        "date": now.format("%Y-%m-%d").to_string(),
        "year": now.year(),
        "month": now.month(),
        "day": now.day(),
        "dayOfWeek": now.format("%A").to_string(),
        "time": now.format("%H:%M").to_string(),
        "timezone": now.format("%:z").to_string(),
    })
}

/// Starts the built-in tool server on an in-memory pipe and returns an
/// executor connected to it, plus the server task handle.
pub async fn connect_builtin_tools() -> anyhow::Result<(McpToolExecutor, JoinHandle<()>)> {
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    let server_handle = tokio::spawn(async move {
        if let Ok(service) = BuiltinToolServer::new().serve(server_transport).await {
            let _ = service.waiting().await;
        }
    });
    let client = ().serve(client_transport).await?;
    Ok((McpToolExecutor::new(client), server_handle))
}
