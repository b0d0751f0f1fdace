//! Merged tool catalog built from upstream listings.

pub mod index;
pub mod types;

pub use index::{build_snapshot, CatalogSnapshot, ToolCatalog};
pub use types::{valid_tool_name, CatalogEntry, QualifiedTool, QUALIFIER};
