//! Tool implementations and the registry that serves them to the agent.
//!
//! Three kinds of tools share the [`kestrel_core::Tool`] contract:
//!
//! - native tools compiled in: [`ReadFileTool`], [`WriteFileTool`], [`ShellTool`]
//! - [`SubprocessTool`]s described by a project's discovery command
//! - [`McpTool`]s served by configured MCP servers
//!
//! [`ToolRegistry`] owns all of them and rebuilds the discovered ones on
//! each [`ToolRegistry::discover_tools`] pass.

pub mod context;
pub mod discovered;
pub mod mcp;
pub mod read_file;
pub mod registry;
pub mod shell;
pub mod write_file;

pub use context::ToolContext;
pub use discovered::{DiscoveryError, SubprocessTool, parse_declarations};
pub use mcp::{
    McpApprovals, McpCallResult, McpConnector, McpError, McpServerStatus, McpSession, McpTool,
    McpToolInfo, TransportConnector,
};
pub use read_file::ReadFileTool;
pub use registry::{ToolRegistry, sanitize_tool_name};
pub use shell::ShellTool;
pub use write_file::WriteFileTool;
