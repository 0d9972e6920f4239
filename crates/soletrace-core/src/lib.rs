//! Core domain model for SoleTrace: phases, tasks, proxy endpoints, outcomes.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "soletrace-core";

/// Attempt ceiling per task before it is declared exhausted for the run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// The three harvest phases, in pipeline order. Each phase owns its own
/// identifier space and artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Brand browse pages, persisted as per-page CSV rows of product links.
    Links,
    /// Product detail documents, one JSON file per style SKU.
    Detail,
    /// Sales activity documents, one JSON file per style SKU.
    Transactions,
}

impl Phase {
    /// Directory the phase writes under the data root. These names are a
    /// contract with downstream consumers and must not change.
    pub fn dir_name(self) -> &'static str {
        match self {
            Phase::Links => "shoe_links",
            Phase::Detail => "shoe_info",
            Phase::Transactions => "shoe_transactions",
        }
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            Phase::Links => "csv",
            Phase::Detail | Phase::Transactions => "json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Links => "links",
            Phase::Detail => "detail",
            Phase::Transactions => "transactions",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proxy egress as `host:port`. Endpoints never change after the pool
/// is loaded, which is what makes lock-free sharing across workers safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` entry. Returns `None` for anything that does not
    /// split into a non-empty host and a numeric port.
    pub fn parse(raw: &str) -> Option<Self> {
        let (host, port) = raw.rsplit_once(':')?;
        let host = host.trim();
        if host.is_empty() {
            return None;
        }
        let port = port.trim().parse().ok()?;
        Some(Self::new(host, port))
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One unit of pending work: fetch and persist a single identifier.
///
/// The identifier's meaning depends on the phase: a page number for
/// `Links`, a product link path for `Detail`, a style SKU for
/// `Transactions`. Tasks are value objects, enumerated and consumed once
/// per run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchTask {
    pub phase: Phase,
    pub brand: String,
    pub identifier: String,
}

impl FetchTask {
    pub fn new(phase: Phase, brand: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            phase,
            brand: brand.into(),
            identifier: identifier.into(),
        }
    }
}

/// Terminal report for one task. Produced by the retry loop, consumed only
/// at the dispatch join point for counting and logs; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub task: FetchTask,
    pub success: bool,
    pub attempts_used: u32,
    /// Last fault observed before giving up. `None` on success.
    pub failure_reason: Option<String>,
}

impl FetchOutcome {
    pub fn succeeded(task: FetchTask, attempts_used: u32) -> Self {
        Self {
            task,
            success: true,
            attempts_used,
            failure_reason: None,
        }
    }

    pub fn exhausted(task: FetchTask, attempts_used: u32, last_fault: String) -> Self {
        Self {
            task,
            success: false,
            attempts_used,
            failure_reason: Some(last_fault),
        }
    }
}
