//! External scanning capability client.
//!
//! The relay treats the scanner as opaque: hand it a unit, get a verdict.
//! `HttpScanner` is the shipped implementation, posting units to a scanning
//! service over HTTPS. Failures surface as `RelayError::Scan`, which policy
//! maps to Block, never to Allow.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::unit::{ScanUnit, ScanVerdict};
use crate::{
    config::ScannerConfig,
    error::{RelayError, RelayResult},
};

/// Opaque scanning capability.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, unit: &ScanUnit) -> RelayResult<ScanVerdict>;
}

/// Wire request posted to the scanning service. `request_id` is minted per
/// request so service-side logs can be correlated with relay logs.
#[derive(Debug, Serialize)]
struct ScanRequest<'a> {
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<&'a str>,
    kind: &'a str,
    upstream: &'a str,
    tool: &'a str,
    fingerprint: String,
    content: String,
}

/// Wire response from the scanning service.
#[derive(Debug, Deserialize)]
struct ScanResponse {
    action: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    scan_id: Option<String>,
}

fn verdict_from_response(response: ScanResponse) -> ScanVerdict {
    match response.action.to_ascii_lowercase().as_str() {
        "allow" => ScanVerdict::Allow,
        "block" | "deny" => ScanVerdict::Block {
            category: response.category,
        },
        other => {
            tracing::warn!(action = %other, scan_id = ?response.scan_id, "Unrecognized scanner action");
            ScanVerdict::Unknown
        }
    }
}

/// Scanner implementation backed by an HTTP scanning service.
pub struct HttpScanner {
    client: reqwest::Client,
    endpoint: String,
    profile: Option<String>,
}

/// Environment fallback for the scanner credential, so tokens can stay out
/// of config files.
pub const SCANNER_TOKEN_ENV: &str = "MCP_SCAN_RELAY_SCANNER_TOKEN";

impl HttpScanner {
    pub fn from_config(config: &ScannerConfig) -> RelayResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout));

        let token = config
            .token
            .clone()
            .or_else(|| std::env::var(SCANNER_TOKEN_ENV).ok());
        if let Some(token) = token {
            let mut headers = reqwest::header::HeaderMap::new();
            let mut value: reqwest::header::HeaderValue = format!("Bearer {}", token)
                .parse()
                .map_err(|e| RelayError::Config(format!("scanner token: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint.clone(),
            profile: config.profile.clone(),
        })
    }
}

#[async_trait]
impl Scanner for HttpScanner {
    async fn scan(&self, unit: &ScanUnit) -> RelayResult<ScanVerdict> {
        let request = ScanRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            profile: self.profile.as_deref(),
            kind: unit.kind.as_str(),
            upstream: &unit.upstream_id,
            tool: &unit.tool_name,
            fingerprint: unit.fingerprint().to_string(),
            content: unit.canonical_payload(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::Scan(format!("scan request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Scan(format!(
                "scanner returned status {}",
                status
            )));
        }

        let parsed: ScanResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Scan(format!("scan response decode failed: {}", e)))?;

        Ok(verdict_from_response(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(action: &str, category: Option<&str>) -> ScanResponse {
        ScanResponse {
            action: action.to_string(),
            category: category.map(str::to_string),
            scan_id: Some("scan-1".to_string()),
        }
    }

    #[test]
    fn test_verdict_mapping() {
        assert_eq!(
            verdict_from_response(response("allow", None)),
            ScanVerdict::Allow
        );
        assert_eq!(
            verdict_from_response(response("ALLOW", None)),
            ScanVerdict::Allow
        );
        assert_eq!(
            verdict_from_response(response("block", Some("prompt-injection"))),
            ScanVerdict::block("prompt-injection")
        );
        assert_eq!(
            verdict_from_response(response("deny", None)),
            ScanVerdict::Block { category: None }
        );
        assert_eq!(
            verdict_from_response(response("quarantine", None)),
            ScanVerdict::Unknown
        );
    }

    #[test]
    fn test_response_decoding() {
        let parsed: ScanResponse = serde_json::from_str(
            r#"{"action": "block", "category": "dlp", "scan_id": "abc", "extra": 1}"#,
        )
        .unwrap();
        assert_eq!(parsed.action, "block");
        assert_eq!(parsed.category.as_deref(), Some("dlp"));

        // Category and scan_id are optional.
        let parsed: ScanResponse = serde_json::from_str(r#"{"action": "allow"}"#).unwrap();
        assert!(parsed.category.is_none());
    }

    #[test]
    fn test_request_shape() {
        let unit = ScanUnit::tool_arguments("files", "read_file", serde_json::json!({"p": 1}));
        let request = ScanRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            profile: Some("strict"),
            kind: unit.kind.as_str(),
            upstream: &unit.upstream_id,
            tool: &unit.tool_name,
            fingerprint: unit.fingerprint().to_string(),
            content: unit.canonical_payload(),
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["kind"], "tool_arguments");
        assert_eq!(wire["upstream"], "files");
        assert_eq!(wire["content"], r#"{"p":1}"#);
        assert_eq!(wire["fingerprint"].as_str().unwrap().len(), 64);
        assert!(!wire["request_id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_from_config_builds() {
        let config = ScannerConfig {
            endpoint: "http://localhost:9000/scan".to_string(),
            token: Some("secret".to_string()),
            profile: Some("strict".to_string()),
            timeout: 5,
        };
        let scanner = HttpScanner::from_config(&config).unwrap();
        assert_eq!(scanner.endpoint, "http://localhost:9000/scan");
        assert_eq!(scanner.profile.as_deref(), Some("strict"));
    }

    #[test]
    #[serial_test::serial]
    fn test_token_env_fallback() {
        let config = ScannerConfig {
            endpoint: "http://localhost:9000/scan".to_string(),
            token: None,
            profile: None,
            timeout: 5,
        };

        std::env::set_var(SCANNER_TOKEN_ENV, "env-secret");
        let scanner = HttpScanner::from_config(&config);
        std::env::remove_var(SCANNER_TOKEN_ENV);
        assert!(scanner.is_ok());

        // Without config token or env var the client builds unauthenticated.
        assert!(HttpScanner::from_config(&config).is_ok());
    }
}
