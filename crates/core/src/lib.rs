//! Collaborator contracts shared by the voice streaming engine: token usage
//! and tool specification types, the tool executor and tool source traits,
//! the built-in MCP tool server, the tool catalogue and the pricing model.

pub mod builtin_tools;
pub mod catalog;
pub mod generic_types;
pub mod pricing;
pub mod tool_executor;

pub use catalog::{EnabledTools, StaticToolSource, ToolCatalog, ToolSource, UserTool};
pub use generic_types::{TokenUsage, ToolSpec};
pub use pricing::{PricingModel, TokenPricing, TurnCost};
pub use tool_executor::{McpToolExecutor, ToolError, ToolExecutor};
