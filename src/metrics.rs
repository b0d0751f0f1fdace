//! Relay metrics for monitoring scan and call activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for relay operations. All state hangs off the relay instance
/// that owns this value; nothing here is global.
pub struct RelayMetrics {
    // Scan gateway
    scans_requested: AtomicU64,
    cache_hits: AtomicU64,
    scans_coalesced: AtomicU64,
    scanner_invocations: AtomicU64,
    scan_errors: AtomicU64,

    // Policy outcomes
    definitions_blocked: AtomicU64,
    calls_blocked: AtomicU64,
    responses_blocked: AtomicU64,

    // Tool calls
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    active_requests: AtomicU64,

    // Catalog and connections
    refresh_rounds: AtomicU64,
    connection_errors: AtomicU64,
    active_connections: AtomicU64,

    // External scanner round-trip latency
    scan_latency: LatencyStats,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            scans_requested: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            scans_coalesced: AtomicU64::new(0),
            scanner_invocations: AtomicU64::new(0),
            scan_errors: AtomicU64::new(0),
            definitions_blocked: AtomicU64::new(0),
            calls_blocked: AtomicU64::new(0),
            responses_blocked: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            refresh_rounds: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            scan_latency: LatencyStats::new(),
        }
    }

    pub fn record_scan_requested(&self) {
        self.scans_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_coalesced(&self) {
        self.scans_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one round trip to the external scanner.
    pub fn record_scanner_invocation(&self, duration_ms: u64) {
        self.scanner_invocations.fetch_add(1, Ordering::Relaxed);
        self.scan_latency.record(duration_ms);
    }

    pub fn record_scan_error(&self) {
        self.scan_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_definition_blocked(&self) {
        self.definitions_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_blocked(&self) {
        self.calls_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_blocked(&self) {
        self.responses_blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// A request (tool call or catalog listing) entered the relay. The
    /// shutdown drain waits on this gauge reaching zero.
    pub fn record_request_start(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_end(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_call_start(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.record_request_start();
    }

    pub fn record_call_end(&self, success: bool) {
        self.record_request_end();
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_refresh_round(&self) {
        self.refresh_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of external scanner calls made so far.
    pub fn scanner_invocations(&self) -> u64 {
        self.scanner_invocations.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans_requested: self.scans_requested.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            scans_coalesced: self.scans_coalesced.load(Ordering::Relaxed),
            scanner_invocations: self.scanner_invocations.load(Ordering::Relaxed),
            scan_errors: self.scan_errors.load(Ordering::Relaxed),
            definitions_blocked: self.definitions_blocked.load(Ordering::Relaxed),
            calls_blocked: self.calls_blocked.load(Ordering::Relaxed),
            responses_blocked: self.responses_blocked.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            refresh_rounds: self.refresh_rounds.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            scan_latency: self.scan_latency.snapshot(),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency tracking for scanner round trips.
struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);

        // Relaxed CAS loop; approximate stats only
        let mut current_max = self.max_ms.load(Ordering::Relaxed);
        while ms > current_max {
            match self.max_ms.compare_exchange_weak(
                current_max,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of relay metrics, serialized into the built-in
/// server info tool output.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub scans_requested: u64,
    pub cache_hits: u64,
    pub scans_coalesced: u64,
    pub scanner_invocations: u64,
    pub scan_errors: u64,
    pub definitions_blocked: u64,
    pub calls_blocked: u64,
    pub responses_blocked: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub active_requests: u64,
    pub refresh_rounds: u64,
    pub connection_errors: u64,
    pub active_connections: u64,
    pub scan_latency: LatencySnapshot,
}

impl MetricsSnapshot {
    /// Fraction of scan requests answered from the cache, as a percentage.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.scans_requested == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / self.scans_requested as f64) * 100.0
        }
    }
}

/// Snapshot of scanner latency statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}
