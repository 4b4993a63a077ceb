//! Local MCP endpoint: newline-delimited JSON-RPC 2.0 over a host-provided
//! byte stream (stdio in the binary).

mod builtin;
mod endpoint;

pub use builtin::BuiltinTools;
pub use endpoint::{EndpointInfo, McpEndpoint};
