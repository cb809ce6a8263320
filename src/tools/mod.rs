//! 能力层：工具注册表、并行调度器、内置 echo

pub mod dispatcher;
pub mod echo;
pub mod registry;

pub use dispatcher::{ToolDispatcher, ToolRequest, ToolResult, ToolStatus};
pub use echo::EchoTool;
pub use registry::{SyncTool, Tool, ToolParams, ToolRegistry};
