//! Upstream MCP server connections and lifecycle.

pub mod manager;

pub use manager::{UpstreamInfo, UpstreamManager, UpstreamState};
