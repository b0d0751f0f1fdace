//! Scan units and content fingerprinting.
//!
//! A scan unit is the thing handed to the scanning capability: a tool
//! definition, a call's argument set, or a tool response, together with the
//! upstream and tool it belongs to. Fingerprints are content-addressed over
//! a canonical JSON rendering so that semantically identical payloads hash
//! identically no matter how the client ordered its object keys.

use std::fmt;

use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// What kind of content a scan unit carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanUnitKind {
    ToolDefinition,
    ToolArguments,
    ToolResponse,
}

impl ScanUnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanUnitKind::ToolDefinition => "tool_definition",
            ScanUnitKind::ToolArguments => "tool_arguments",
            ScanUnitKind::ToolResponse => "tool_response",
        }
    }
}

impl fmt::Display for ScanUnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of content to scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanUnit {
    pub kind: ScanUnitKind,
    pub upstream_id: String,
    pub tool_name: String,
    pub payload: Value,
}

impl ScanUnit {
    /// Unit for a discovered tool definition.
    pub fn tool_definition(upstream_id: impl Into<String>, tool: &Tool) -> Self {
        let payload = serde_json::json!({
            "name": tool.name.as_ref(),
            "description": tool.description.as_deref(),
            "input_schema": Value::Object((*tool.input_schema).clone()),
        });
        Self {
            kind: ScanUnitKind::ToolDefinition,
            upstream_id: upstream_id.into(),
            tool_name: tool.name.to_string(),
            payload,
        }
    }

    /// Unit for the argument set of an outgoing call.
    pub fn tool_arguments(
        upstream_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            kind: ScanUnitKind::ToolArguments,
            upstream_id: upstream_id.into(),
            tool_name: tool_name.into(),
            payload: arguments,
        }
    }

    /// Unit for an upstream tool response.
    pub fn tool_response(
        upstream_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            kind: ScanUnitKind::ToolResponse,
            upstream_id: upstream_id.into(),
            tool_name: tool_name.into(),
            payload: content,
        }
    }

    /// Canonical rendering of the payload: object keys sorted at every
    /// depth, no insignificant whitespace, arrays kept in order.
    pub fn canonical_payload(&self) -> String {
        let mut out = String::new();
        write_canonical(&self.payload, &mut out);
        out
    }

    /// Content-addressed fingerprint of this unit. Covers the kind and the
    /// identity fields as well as the payload, so the same bytes scanned as
    /// arguments and as a response are distinct cache entries.
    pub fn fingerprint(&self) -> Fingerprint {
        use std::fmt::Write;

        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.upstream_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.tool_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical_payload().as_bytes());

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(hex, "{:02x}", byte);
        }
        Fingerprint(hex)
    }
}

/// Hex-encoded SHA-256 fingerprint of a scan unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome reported by the scanning capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ScanVerdict {
    Allow,
    Block {
        #[serde(skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    /// The service answered but committed to nothing. Policy treats this
    /// the same as Block.
    Unknown,
}

impl ScanVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, ScanVerdict::Allow)
    }

    pub fn block(category: impl Into<String>) -> Self {
        ScanVerdict::Block {
            category: Some(category.into()),
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are JSON strings and need the same escaping as values.
                match serde_json::to_string(key) {
                    Ok(encoded) => out.push_str(&encoded),
                    Err(_) => out.push_str("\"\""),
                }
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => match serde_json::to_string(scalar) {
            Ok(encoded) => out.push_str(&encoded),
            Err(_) => out.push_str("null"),
        },
    }
}
