//! Relay configuration types and utilities.
//!
//! One static snapshot loaded at startup. Invalid configuration is fatal;
//! everything after startup degrades per-component instead.

use std::{collections::HashMap, fmt};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Upstream MCP servers (connected at startup)
    pub upstreams: Vec<UpstreamConfig>,

    /// External scanning service
    pub scanner: ScannerConfig,

    /// Verdict cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Timeouts and concurrency bounds
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Policy presentation settings
    #[serde(default)]
    pub policy: PolicySettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Identifier used for qualification and logging.
    /// Restricted to `[A-Za-z0-9_-]` so qualified tool names stay legal.
    pub id: String,

    #[serde(flatten)]
    pub transport: UpstreamTransport,

    /// Whether this upstream is required for relay startup
    /// - true: startup fails if this upstream cannot be reached
    /// - false: log an error but continue (default)
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum UpstreamTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        /// Bearer token for Authorization header
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Streamable {
        url: String,
        /// Bearer token for Authorization header
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl UpstreamTransport {
    /// Transport kind label for logs and server info output.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamTransport::Stdio { .. } => "stdio",
            UpstreamTransport::Sse { .. } => "sse",
            UpstreamTransport::Streamable { .. } => "streamable",
        }
    }

    /// Endpoint or launch target, for server info output.
    pub fn endpoint(&self) -> &str {
        match self {
            UpstreamTransport::Stdio { command, .. } => command,
            UpstreamTransport::Sse { url, .. } | UpstreamTransport::Streamable { url, .. } => url,
        }
    }
}

impl fmt::Debug for UpstreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamTransport::Stdio {
                command,
                args,
                envs,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
            UpstreamTransport::Sse {
                url,
                token,
                headers,
            } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
            UpstreamTransport::Streamable {
                url,
                token,
                headers,
            } => f
                .debug_struct("Streamable")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// External scanning service configuration.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Scan endpoint URL
    pub endpoint: String,

    /// Bearer token for Authorization header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Scanning profile name passed through to the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Per-scan timeout (seconds)
    #[serde(default = "default_scan_timeout")]
    pub timeout: u64,
}

impl fmt::Debug for ScannerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "****"))
            .field("profile", &self.profile)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Verdict cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum cached verdicts before LRU eviction
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Verdict TTL (seconds) - how long a cached verdict is trusted
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
}

/// Timeouts and concurrency bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Per-upstream tools/list timeout during refresh (seconds)
    #[serde(default = "default_list_timeout")]
    pub list_timeout: u64,

    /// Per-call upstream timeout (seconds)
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,

    /// Maximum tool calls in flight at once
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    /// Grace period for draining in-flight requests at shutdown (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

/// Policy presentation settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicySettings {
    /// How much detail block notices carry back to the client.
    #[serde(default)]
    pub notice_verbosity: NoticeVerbosity,
}

/// Verbosity of the notice replacing blocked content.
/// - minimal: fixed one-line notice (default; leaks nothing about the scanner)
/// - detailed: adds stage, tool name, and category when available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoticeVerbosity {
    #[default]
    Minimal,
    Detailed,
}

// Default value functions
fn default_scan_timeout() -> u64 {
    10
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_list_timeout() -> u64 {
    10
}

fn default_call_timeout() -> u64 {
    30
}

fn default_max_concurrent_calls() -> usize {
    16
}

fn default_shutdown_grace() -> u64 {
    20
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            list_timeout: default_list_timeout(),
            call_timeout: default_call_timeout(),
            max_concurrent_calls: default_max_concurrent_calls(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file.
    pub async fn from_file(path: &str) -> RelayResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the snapshot. Called once at startup; failure is fatal.
    pub fn validate(&self) -> RelayResult<()> {
        if self.upstreams.is_empty() {
            return Err(RelayError::Config("no upstreams configured".to_string()));
        }

        // Panics only on an invalid literal, which would be a build defect.
        let id_shape = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex literal");

        let mut seen = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            if !id_shape.is_match(&upstream.id) {
                return Err(RelayError::Config(format!(
                    "upstream id '{}' must match [A-Za-z0-9_-]{{1,64}}",
                    upstream.id
                )));
            }
            if !seen.insert(upstream.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate upstream id '{}'",
                    upstream.id
                )));
            }
        }

        if self.scanner.endpoint.is_empty() {
            return Err(RelayError::Config(
                "scanner endpoint must not be empty".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(RelayError::Config(
                "cache capacity must be at least 1".to_string(),
            ));
        }
        if self.limits.max_concurrent_calls == 0 {
            return Err(RelayError::Config(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> ScannerConfig {
        ScannerConfig {
            endpoint: "http://localhost:9000/scan".to_string(),
            token: None,
            profile: None,
            timeout: default_scan_timeout(),
        }
    }

    fn upstream(id: &str) -> UpstreamConfig {
        UpstreamConfig {
            id: id.to_string(),
            transport: UpstreamTransport::Stdio {
                command: "server".to_string(),
                args: vec![],
                envs: HashMap::new(),
            },
            required: false,
        }
    }

    #[test]
    fn test_default_cache_config() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.ttl, 300);
    }

    #[test]
    fn test_default_limits_config() {
        let config = LimitsConfig::default();
        assert_eq!(config.list_timeout, 10);
        assert_eq!(config.call_timeout, 30);
        assert_eq!(config.max_concurrent_calls, 16);
        assert_eq!(config.shutdown_grace, 20);
    }

    #[test]
    fn test_yaml_minimal_config() {
        let yaml = r#"
upstreams:
  - id: "files"
    protocol: stdio
    command: "file-server"
scanner:
  endpoint: "http://localhost:9000/scan"
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].id, "files");
        assert!(!config.upstreams[0].required);
        assert_eq!(config.scanner.timeout, 10);
        assert_eq!(config.cache.ttl, 300);
        assert_eq!(config.policy.notice_verbosity, NoticeVerbosity::Minimal);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
upstreams:
  - id: "files"
    protocol: stdio
    command: "file-server"
    args: ["--root", "/data"]
    envs:
      LOG_LEVEL: "debug"
    required: true
  - id: "web"
    protocol: sse
    url: "http://localhost:3000/sse"
    token: "secret-token"
    headers:
      X-API-Key: "key123"
  - id: "db"
    protocol: streamable
    url: "http://localhost:4000/mcp"
scanner:
  endpoint: "https://scan.example.com/v1/scan"
  token: "scan-token"
  profile: "strict"
  timeout: 5
cache:
  capacity: 128
  ttl: 60
limits:
  call_timeout: 15
  max_concurrent_calls: 4
policy:
  notice_verbosity: detailed
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.upstreams.len(), 3);
        assert!(config.upstreams[0].required);

        match &config.upstreams[0].transport {
            UpstreamTransport::Stdio { command, args, .. } => {
                assert_eq!(command, "file-server");
                assert_eq!(args, &["--root".to_string(), "/data".to_string()]);
            }
            other => panic!("expected stdio transport, got {:?}", other),
        }
        match &config.upstreams[1].transport {
            UpstreamTransport::Sse { url, token, headers } => {
                assert_eq!(url, "http://localhost:3000/sse");
                assert_eq!(token.as_deref(), Some("secret-token"));
                assert_eq!(headers.get("X-API-Key").unwrap(), "key123");
            }
            other => panic!("expected sse transport, got {:?}", other),
        }

        assert_eq!(config.scanner.profile.as_deref(), Some("strict"));
        assert_eq!(config.scanner.timeout, 5);
        assert_eq!(config.cache.capacity, 128);
        assert_eq!(config.limits.call_timeout, 15);
        assert_eq!(config.limits.list_timeout, 10);
        assert_eq!(config.policy.notice_verbosity, NoticeVerbosity::Detailed);
        config.validate().unwrap();
    }

    #[test]
    fn test_transport_debug_masks_tokens() {
        let transport = UpstreamTransport::Sse {
            url: "http://localhost:3000/sse".to_string(),
            token: Some("super-secret".to_string()),
            headers: HashMap::new(),
        };
        let debug = format!("{:?}", transport);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("****"));

        let scanner = ScannerConfig {
            token: Some("scan-secret".to_string()),
            ..scanner()
        };
        let debug = format!("{:?}", scanner);
        assert!(!debug.contains("scan-secret"));
    }

    #[test]
    fn test_validate_rejects_empty_upstreams() {
        let config = RelayConfig {
            upstreams: vec![],
            scanner: scanner(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = RelayConfig {
            upstreams: vec![upstream("files"), upstream("files")],
            scanner: scanner(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_bad_id_shape() {
        let config = RelayConfig {
            upstreams: vec![upstream("bad id!")],
            scanner: scanner(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_scanner_endpoint() {
        let config = RelayConfig {
            upstreams: vec![upstream("files")],
            scanner: ScannerConfig {
                endpoint: String::new(),
                ..scanner()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_kind_labels() {
        assert_eq!(upstream("x").transport.kind(), "stdio");
        let sse = UpstreamTransport::Sse {
            url: "http://localhost:3000/sse".to_string(),
            token: None,
            headers: HashMap::new(),
        };
        assert_eq!(sse.kind(), "sse");
        assert_eq!(sse.endpoint(), "http://localhost:3000/sse");
    }
}
