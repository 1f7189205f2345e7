// SPDX-License-Identifier: MIT
mod policy;
mod registry;
mod tool;

pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolDescriptor, ToolRegistry};
pub use tool::{
    smart_truncate, OutputCategory, Tool, ToolCall, ToolOutput, ToolResult, ToolResultError,
    ToolResultMeta,
};
