//! Core types for the merged tool catalog.

use std::{borrow::Cow, fmt};

use rmcp::model::Tool;
use serde::{Deserialize, Serialize};

/// Separator between upstream id and tool name in a qualified exposed name.
/// Both sides are restricted to `[A-Za-z0-9_-]`, so the joined name stays a
/// legal tool name.
pub const QUALIFIER: &str = "__";

/// Identity of one upstream tool: owning upstream plus its original name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedTool {
    pub upstream_id: String,
    pub tool_name: String,
}

impl QualifiedTool {
    pub fn new(upstream_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            upstream_id: upstream_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Exposed name under the qualification scheme.
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.upstream_id, QUALIFIER, self.tool_name)
    }
}

impl fmt::Display for QualifiedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.upstream_id, self.tool_name)
    }
}

/// One entry in the merged catalog.
///
/// `tool` keeps the upstream's original definition; `exposed_name` is what the
/// client sees, which differs from the original name when the name was
/// contested.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub qualified: QualifiedTool,
    pub exposed_name: String,
    pub tool: Tool,
}

impl CatalogEntry {
    /// The definition advertised to the client, renamed to the exposed name.
    pub fn advertised_tool(&self) -> Tool {
        let mut tool = self.tool.clone();
        tool.name = Cow::Owned(self.exposed_name.clone());
        tool
    }
}

/// Upstream tool names must stay legal after qualification and must not smuggle
/// separators or control characters into the merged namespace.
pub fn valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Map;

    use super::*;

    fn test_tool(name: &str) -> Tool {
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(format!("Test tool: {}", name))),
            input_schema: Arc::new(Map::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    #[test]
    fn test_qualified_tool_naming() {
        let qualified = QualifiedTool::new("files", "read_file");
        assert_eq!(qualified.qualified_name(), "files__read_file");
        assert_eq!(format!("{}", qualified), "files:read_file");
    }

    #[test]
    fn test_advertised_tool_renames_only() {
        let entry = CatalogEntry {
            qualified: QualifiedTool::new("files", "read_file"),
            exposed_name: "files__read_file".to_string(),
            tool: test_tool("read_file"),
        };

        let advertised = entry.advertised_tool();
        assert_eq!(advertised.name, "files__read_file");
        assert_eq!(advertised.description, entry.tool.description);
        assert_eq!(entry.tool.name, "read_file");
    }

    #[test]
    fn test_valid_tool_name() {
        assert!(valid_tool_name("read_file"));
        assert!(valid_tool_name("search-v2"));
        assert!(valid_tool_name("A1"));
        assert!(!valid_tool_name(""));
        assert!(!valid_tool_name("bad name"));
        assert!(!valid_tool_name("dot.name"));
        assert!(!valid_tool_name(&"x".repeat(129)));
    }
}
