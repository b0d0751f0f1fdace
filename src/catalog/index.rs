//! Merged tool catalog with atomic snapshot replacement.
//!
//! Each refresh round builds a complete snapshot from whatever upstreams
//! answered, then installs it in one swap. Requests in flight keep the
//! snapshot they resolved against, so a refresh never changes the meaning of
//! a call that already started.
//!
//! Merge ordering is upstream registration order, then tool name. When a tool
//! name is claimed by more than one upstream, no claimant keeps the bare name;
//! every claimant is exposed as `<upstream_id>__<tool_name>`, which keeps the
//! mapping deterministic no matter which upstream answered a refresh first.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use rmcp::model::Tool;
use tracing::warn;

use super::types::{valid_tool_name, CatalogEntry, QualifiedTool, QUALIFIER};

#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    entries: Vec<CatalogEntry>,
    by_exposed: HashMap<String, usize>,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Advertised definitions in merge order, renamed to exposed names.
    pub fn tools(&self) -> Vec<Tool> {
        self.entries.iter().map(CatalogEntry::advertised_tool).collect()
    }

    /// Map an exposed name back to the owning upstream and original tool.
    pub fn resolve(&self, exposed_name: &str) -> Option<&CatalogEntry> {
        self.by_exposed
            .get(exposed_name)
            .map(|&index| &self.entries[index])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_for_upstream(&self, upstream_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.qualified.upstream_id == upstream_id)
            .count()
    }
}

/// Build a snapshot from per-upstream tool lists.
///
/// `per_upstream` must already be in upstream registration order and must only
/// contain tools that survived definition scanning. `reserved` names are
/// treated as contested even with a single claimant, so an upstream can never
/// shadow a relay-provided tool.
pub fn build_snapshot(
    per_upstream: Vec<(String, Vec<Tool>)>,
    reserved: &[&str],
) -> CatalogSnapshot {
    let mut per_upstream = per_upstream;

    for (upstream_id, tools) in per_upstream.iter_mut() {
        tools.retain(|tool| {
            if valid_tool_name(&tool.name) {
                true
            } else {
                warn!(upstream = %upstream_id, tool = %tool.name, "dropping tool with illegal name");
                false
            }
        });
        tools.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let mut claimants: HashMap<String, Vec<String>> = HashMap::new();
    for (upstream_id, tools) in &per_upstream {
        for tool in tools {
            claimants
                .entry(tool.name.to_string())
                .or_default()
                .push(upstream_id.clone());
        }
    }

    let mut contested: Vec<&String> = claimants
        .iter()
        .filter(|(name, owners)| owners.len() > 1 || reserved.contains(&name.as_str()))
        .map(|(name, _)| name)
        .collect();
    contested.sort();
    for name in &contested {
        warn!(
            tool = %name,
            upstreams = ?claimants[name.as_str()],
            "tool name contested, exposing qualified names only"
        );
    }
    let is_contested: HashSet<&str> = contested.iter().map(|name| name.as_str()).collect();

    let mut entries = Vec::new();
    let mut by_exposed: HashMap<String, usize> = HashMap::new();
    for (upstream_id, tools) in per_upstream {
        for tool in tools {
            let simple = tool.name.to_string();
            let exposed = if is_contested.contains(simple.as_str()) {
                format!("{}{}{}", upstream_id, QUALIFIER, simple)
            } else {
                simple.clone()
            };
            // Qualifying can push an otherwise legal name past the length cap.
            if !valid_tool_name(&exposed) {
                warn!(
                    upstream = %upstream_id,
                    tool = %simple,
                    "dropping tool, qualified name exceeds the length limit"
                );
                continue;
            }
            if by_exposed.contains_key(&exposed) {
                warn!(upstream = %upstream_id, tool = %exposed, "duplicate exposed name, keeping first");
                continue;
            }
            by_exposed.insert(exposed.clone(), entries.len());
            entries.push(CatalogEntry {
                qualified: QualifiedTool::new(upstream_id.clone(), simple),
                exposed_name: exposed,
                tool,
            });
        }
    }

    CatalogSnapshot {
        entries,
        by_exposed,
    }
}

/// Holder of the currently advertised snapshot.
pub struct ToolCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
        }
    }

    /// Atomically replace the advertised catalog.
    pub fn install(&self, snapshot: CatalogSnapshot) -> Arc<CatalogSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = Arc::clone(&snapshot);
        snapshot
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

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

    fn exposed_names(snapshot: &CatalogSnapshot) -> Vec<String> {
        snapshot
            .entries()
            .iter()
            .map(|entry| entry.exposed_name.clone())
            .collect()
    }

    #[test]
    fn test_uncontested_names_stay_bare() {
        let snapshot = build_snapshot(
            vec![
                ("files".to_string(), vec![test_tool("read_file")]),
                ("web".to_string(), vec![test_tool("fetch_url")]),
            ],
            &[],
        );

        assert_eq!(exposed_names(&snapshot), vec!["read_file", "fetch_url"]);
        let entry = snapshot.resolve("read_file").unwrap();
        assert_eq!(entry.qualified.upstream_id, "files");
        assert_eq!(entry.qualified.tool_name, "read_file");
    }

    #[test]
    fn test_collision_qualifies_every_claimant() {
        let snapshot = build_snapshot(
            vec![
                (
                    "files1".to_string(),
                    vec![test_tool("read_file")],
                ),
                (
                    "files2".to_string(),
                    vec![test_tool("write_file"), test_tool("read_file")],
                ),
            ],
            &[],
        );

        assert_eq!(
            exposed_names(&snapshot),
            vec!["files1__read_file", "files2__read_file", "write_file"]
        );
        assert!(snapshot.resolve("read_file").is_none());

        let entry = snapshot.resolve("files2__read_file").unwrap();
        assert_eq!(entry.qualified.upstream_id, "files2");
        assert_eq!(entry.qualified.tool_name, "read_file");
        assert_eq!(entry.tool.name, "read_file");
        assert_eq!(entry.advertised_tool().name, "files2__read_file");
    }

    #[test]
    fn test_merge_order_is_registration_then_tool_name() {
        let snapshot = build_snapshot(
            vec![
                (
                    "zeta".to_string(),
                    vec![test_tool("beta"), test_tool("alpha")],
                ),
                ("alpha".to_string(), vec![test_tool("zulu")]),
            ],
            &[],
        );

        assert_eq!(exposed_names(&snapshot), vec!["alpha", "beta", "zulu"]);
        assert_eq!(
            snapshot.resolve("alpha").unwrap().qualified.upstream_id,
            "zeta"
        );
    }

    #[test]
    fn test_qualification_is_order_independent() {
        let forward = build_snapshot(
            vec![
                (
                    "files1".to_string(),
                    vec![test_tool("read_file"), test_tool("stat")],
                ),
                ("files2".to_string(), vec![test_tool("read_file")]),
            ],
            &[],
        );
        let shuffled = build_snapshot(
            vec![
                (
                    "files1".to_string(),
                    vec![test_tool("stat"), test_tool("read_file")],
                ),
                ("files2".to_string(), vec![test_tool("read_file")]),
            ],
            &[],
        );

        assert_eq!(exposed_names(&forward), exposed_names(&shuffled));
    }

    #[test]
    fn test_reserved_name_is_always_qualified() {
        let snapshot = build_snapshot(
            vec![(
                "meta".to_string(),
                vec![test_tool("list_downstream_servers_info")],
            )],
            &["list_downstream_servers_info"],
        );

        assert_eq!(
            exposed_names(&snapshot),
            vec!["meta__list_downstream_servers_info"]
        );
        assert!(snapshot.resolve("list_downstream_servers_info").is_none());
    }

    #[test]
    fn test_illegal_tool_names_are_dropped() {
        let snapshot = build_snapshot(
            vec![(
                "files".to_string(),
                vec![test_tool("ok_tool"), test_tool("bad name"), test_tool("")],
            )],
            &[],
        );

        assert_eq!(exposed_names(&snapshot), vec!["ok_tool"]);
    }

    #[test]
    fn test_duplicate_name_within_one_upstream_keeps_first() {
        let snapshot = build_snapshot(
            vec![(
                "files".to_string(),
                vec![test_tool("read_file"), test_tool("read_file")],
            )],
            &[],
        );

        assert_eq!(exposed_names(&snapshot), vec!["files__read_file"]);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_overlong_qualified_name_is_dropped() {
        // 128 chars is legal bare but exceeds the cap once qualified.
        let long = "t".repeat(128);
        let snapshot = build_snapshot(
            vec![
                (
                    "files1".to_string(),
                    vec![test_tool(&long), test_tool("read_file")],
                ),
                ("files2".to_string(), vec![test_tool(&long)]),
            ],
            &[],
        );

        assert_eq!(exposed_names(&snapshot), vec!["read_file"]);
        assert!(snapshot.resolve(&format!("files1__{}", long)).is_none());
        for entry in snapshot.entries() {
            assert!(valid_tool_name(&entry.exposed_name));
        }
    }

    #[test]
    fn test_install_does_not_disturb_held_snapshots() {
        let catalog = ToolCatalog::new();
        assert!(catalog.snapshot().is_empty());

        catalog.install(build_snapshot(
            vec![("files".to_string(), vec![test_tool("read_file")])],
            &[],
        ));
        let held = catalog.snapshot();
        assert!(held.resolve("read_file").is_some());

        catalog.install(build_snapshot(
            vec![("web".to_string(), vec![test_tool("fetch_url")])],
            &[],
        ));

        assert!(held.resolve("read_file").is_some());
        assert!(catalog.snapshot().resolve("read_file").is_none());
        assert!(catalog.snapshot().resolve("fetch_url").is_some());
    }

    #[test]
    fn test_count_for_upstream() {
        let snapshot = build_snapshot(
            vec![
                (
                    "files".to_string(),
                    vec![test_tool("read_file"), test_tool("write_file")],
                ),
                ("web".to_string(), vec![test_tool("fetch_url")]),
            ],
            &[],
        );

        assert_eq!(snapshot.count_for_upstream("files"), 2);
        assert_eq!(snapshot.count_for_upstream("web"), 1);
        assert_eq!(snapshot.count_for_upstream("missing"), 0);
    }
}
