//! Scanning pipeline: canonical units, verdict cache, external scanner, gateway.

pub mod cache;
pub mod gateway;
pub mod scanner;
pub mod unit;

pub use cache::{MemoryVerdictCache, VerdictCache};
pub use gateway::ScanGateway;
pub use scanner::{HttpScanner, Scanner, SCANNER_TOKEN_ENV};
pub use unit::{Fingerprint, ScanUnit, ScanUnitKind, ScanVerdict};
