//! Protocol implementations served behind the relay

pub mod jsonrpc;
pub mod tools;

pub use tools::{EchoTool, Tool, ToolContext, ToolError, ToolHandler, ToolRegistry};
