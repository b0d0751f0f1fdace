//! Scan gateway: the single entry point for verdicts.
//!
//! Order of consultation: canonicalize and fingerprint, check the cache,
//! join an in-flight scan of the same fingerprint if one exists, otherwise
//! dispatch to the external scanner. The actual scanner round trip runs on a
//! detached task so that cancelling the request that happened to go first
//! never aborts the scan other requests are waiting on. Cache failures
//! degrade to live scanning.

use std::{sync::Arc, time::Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    cache::VerdictCache,
    scanner::Scanner,
    unit::{Fingerprint, ScanUnit, ScanVerdict},
};
use crate::{
    error::{RelayError, RelayResult},
    metrics::RelayMetrics,
};

/// Broadcast payload for coalesced waiters. Errors cross the channel as
/// strings because waiters on different requests each need an owned error.
type ScanOutcome = Result<ScanVerdict, String>;

pub struct ScanGateway {
    scanner: Arc<dyn Scanner>,
    cache: Arc<dyn VerdictCache>,
    metrics: Arc<RelayMetrics>,
    in_flight: Arc<DashMap<Fingerprint, broadcast::Sender<ScanOutcome>>>,
}

impl ScanGateway {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        cache: Arc<dyn VerdictCache>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            scanner,
            cache,
            metrics,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Verdict for a unit. `cancel` stops this caller's wait; it does not
    /// stop a scan that other callers may be waiting on.
    pub async fn verdict_for(
        &self,
        unit: &ScanUnit,
        cancel: &CancellationToken,
    ) -> RelayResult<ScanVerdict> {
        self.metrics.record_scan_requested();
        let fingerprint = unit.fingerprint();

        match self.cache.get(&fingerprint).await {
            Ok(Some(verdict)) => {
                self.metrics.record_cache_hit();
                debug!(
                    fingerprint = %fingerprint,
                    kind = %unit.kind,
                    "Verdict served from cache"
                );
                return Ok(verdict);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Verdict cache unavailable; falling back to live scan");
            }
        }

        let mut rx = match self.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(occupied) => {
                self.metrics.record_scan_coalesced();
                occupied.get().subscribe()
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = broadcast::channel(1);
                vacant.insert(tx.clone());
                self.spawn_scan_task(unit.clone(), fingerprint, tx);
                rx
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            outcome = rx.recv() => match outcome {
                Ok(Ok(verdict)) => Ok(verdict),
                Ok(Err(message)) => Err(RelayError::Scan(message)),
                Err(_) => Err(RelayError::Scan("scan task dropped".to_string())),
            },
        }
    }

    /// Run the scanner round trip detached from any one request, then cache
    /// the verdict, retire the in-flight entry, and fan the outcome out.
    fn spawn_scan_task(
        &self,
        unit: ScanUnit,
        fingerprint: Fingerprint,
        tx: broadcast::Sender<ScanOutcome>,
    ) {
        let scanner = Arc::clone(&self.scanner);
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let started = Instant::now();
            let result = scanner.scan(&unit).await;
            metrics.record_scanner_invocation(started.elapsed().as_millis() as u64);

            let outcome: ScanOutcome = match &result {
                Ok(verdict) => {
                    if let Err(e) = cache.put(fingerprint.clone(), verdict.clone()).await {
                        warn!(error = %e, "Failed to cache verdict");
                    }
                    Ok(verdict.clone())
                }
                Err(e) => {
                    metrics.record_scan_error();
                    warn!(
                        error = %e,
                        kind = %unit.kind,
                        tool = %unit.tool_name,
                        "External scan failed"
                    );
                    Err(e.to_string())
                }
            };

            // Remove before sending so later arrivals re-enter through the
            // cache rather than subscribing to a finished channel.
            in_flight.remove(&fingerprint);
            let _ = tx.send(outcome);
        });
    }
}
