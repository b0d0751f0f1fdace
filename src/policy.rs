//! Default-deny enforcement over scan outcomes.
//!
//! Anything other than an explicit Allow verdict is blocked: Block verdicts,
//! Unknown verdicts, and scan failures all land on the same side. Blocked
//! definitions are omitted from the catalog; blocked arguments and responses
//! are replaced by a notice whose detail level comes from configuration.

use std::fmt;

use rmcp::model::{CallToolResult, Content};

use crate::{
    config::NoticeVerbosity,
    error::RelayResult,
    scan::{ScanUnitKind, ScanVerdict},
};

/// What the relay does with one scanned item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    Forward,
    Block(BlockReason),
}

impl PolicyAction {
    pub fn is_forward(&self) -> bool {
        matches!(self, PolicyAction::Forward)
    }
}

/// Why an item was blocked. Carried into notices and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The scanner flagged the content.
    Verdict { category: Option<String> },
    /// The scanner answered but gave no usable verdict.
    Unknown,
    /// The scan itself failed; failure never means Allow.
    ScanFailure { detail: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Verdict {
                category: Some(category),
            } => write!(f, "flagged as {}", category),
            BlockReason::Verdict { category: None } => f.write_str("flagged by scanner"),
            BlockReason::Unknown => f.write_str("no usable verdict"),
            BlockReason::ScanFailure { detail } => write!(f, "scan unavailable: {}", detail),
        }
    }
}

pub struct PolicyEnforcer {
    verbosity: NoticeVerbosity,
}

impl PolicyEnforcer {
    pub fn new(verbosity: NoticeVerbosity) -> Self {
        Self { verbosity }
    }

    /// Map a scan outcome to an action. Only an explicit Allow forwards.
    pub fn decide(&self, outcome: RelayResult<ScanVerdict>) -> PolicyAction {
        match outcome {
            Ok(ScanVerdict::Allow) => PolicyAction::Forward,
            Ok(ScanVerdict::Block { category }) => {
                PolicyAction::Block(BlockReason::Verdict { category })
            }
            Ok(ScanVerdict::Unknown) => PolicyAction::Block(BlockReason::Unknown),
            Err(e) => PolicyAction::Block(BlockReason::ScanFailure {
                detail: e.to_string(),
            }),
        }
    }

    /// Tool-call result standing in for blocked arguments or a blocked
    /// response. Marked as an error so the client never mistakes the notice
    /// for real tool output.
    pub fn block_result(
        &self,
        stage: ScanUnitKind,
        exposed_name: &str,
        reason: &BlockReason,
    ) -> CallToolResult {
        CallToolResult::error(vec![Content::text(self.notice(stage, exposed_name, reason))])
    }

    fn notice(&self, stage: ScanUnitKind, exposed_name: &str, reason: &BlockReason) -> String {
        match self.verbosity {
            NoticeVerbosity::Minimal => "Content blocked by security policy.".to_string(),
            NoticeVerbosity::Detailed => {
                let stage_text = match stage {
                    ScanUnitKind::ToolDefinition => "tool definition",
                    ScanUnitKind::ToolArguments => "tool arguments",
                    ScanUnitKind::ToolResponse => "tool response",
                };
                let why = match reason {
                    BlockReason::Verdict {
                        category: Some(category),
                    } => format!("flagged as {}", category),
                    BlockReason::Verdict { category: None } => "flagged by scanner".to_string(),
                    BlockReason::Unknown => "scanner returned no usable verdict".to_string(),
                    BlockReason::ScanFailure { detail } => format!("scan unavailable ({})", detail),
                };
                format!("Blocked {} for '{}': {}.", stage_text, exposed_name, why)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    fn notice_text(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|content| content.as_text())
            .map(|text| text.text.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_only_explicit_allow_forwards() {
        let policy = PolicyEnforcer::new(NoticeVerbosity::Minimal);

        assert!(policy.decide(Ok(ScanVerdict::Allow)).is_forward());
        assert!(!policy.decide(Ok(ScanVerdict::Unknown)).is_forward());
        assert!(!policy
            .decide(Ok(ScanVerdict::Block { category: None }))
            .is_forward());
        assert!(!policy
            .decide(Err(RelayError::Scan("scanner unreachable".to_string())))
            .is_forward());
    }

    #[test]
    fn test_block_reason_carries_category() {
        let policy = PolicyEnforcer::new(NoticeVerbosity::Minimal);

        match policy.decide(Ok(ScanVerdict::Block {
            category: Some("secrets".to_string()),
        })) {
            PolicyAction::Block(BlockReason::Verdict { category }) => {
                assert_eq!(category.as_deref(), Some("secrets"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_notice_is_fixed() {
        let policy = PolicyEnforcer::new(NoticeVerbosity::Minimal);
        let result = policy.block_result(
            ScanUnitKind::ToolResponse,
            "read_file",
            &BlockReason::Verdict {
                category: Some("secrets".to_string()),
            },
        );

        assert_eq!(result.is_error, Some(true));
        let text = notice_text(&result);
        assert_eq!(text, "Content blocked by security policy.");
        assert!(!text.contains("secrets"));
        assert!(!text.contains("read_file"));
    }

    #[test]
    fn test_detailed_notice_names_stage_tool_and_category() {
        let policy = PolicyEnforcer::new(NoticeVerbosity::Detailed);
        let result = policy.block_result(
            ScanUnitKind::ToolResponse,
            "read_file",
            &BlockReason::Verdict {
                category: Some("secrets".to_string()),
            },
        );

        let text = notice_text(&result);
        assert!(text.contains("tool response"));
        assert!(text.contains("read_file"));
        assert!(text.contains("secrets"));
    }

    #[test]
    fn test_detailed_notice_for_scan_failure() {
        let policy = PolicyEnforcer::new(NoticeVerbosity::Detailed);
        let result = policy.block_result(
            ScanUnitKind::ToolArguments,
            "fetch_url",
            &BlockReason::ScanFailure {
                detail: "Scan failed: timeout".to_string(),
            },
        );

        let text = notice_text(&result);
        assert!(text.contains("tool arguments"));
        assert!(text.contains("scan unavailable"));
    }
}
