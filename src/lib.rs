//! Security-scanning relay for the Model Context Protocol (MCP).
//!
//! The relay sits between one client session and several upstream MCP tool
//! servers. It merges their tool catalogs into a single namespace and routes
//! every tool definition, call-argument set, and tool response through an
//! external scanning service before letting it cross. Verdicts are cached by
//! content fingerprint; anything that is not an explicit allow is blocked.
//!
//! ## Modules
//!
//! - [`relay`]: MCP server handler and session lifecycle
//! - [`upstream`]: Connection management for upstream servers
//! - [`catalog`]: Merged tool catalog with collision qualification
//! - [`scan`]: Fingerprinting, verdict cache, and the scan gateway
//! - [`policy`]: Verdict-to-decision mapping and block notices

pub mod catalog;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod relay;
pub mod scan;
pub mod upstream;

pub use catalog::{CatalogEntry, CatalogSnapshot, QualifiedTool, ToolCatalog};
pub use config::{
    CacheConfig, LimitsConfig, NoticeVerbosity, PolicySettings, RelayConfig, ScannerConfig,
    UpstreamConfig, UpstreamTransport,
};
pub use error::{RelayError, RelayResult};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use policy::{BlockReason, PolicyAction, PolicyEnforcer};
pub use relay::{SecurityRelay, SessionPhase, SessionState, INFO_TOOL_NAME};
pub use scan::{
    Fingerprint, HttpScanner, MemoryVerdictCache, ScanGateway, ScanUnit, ScanUnitKind,
    ScanVerdict, Scanner, VerdictCache,
};
pub use upstream::{UpstreamInfo, UpstreamManager, UpstreamState};
