//! Protocol-facing relay: session lifecycle and the MCP server handler.

pub mod server;
pub mod session;

pub use server::{SecurityRelay, INFO_TOOL_NAME};
pub use session::{SessionPhase, SessionState};
