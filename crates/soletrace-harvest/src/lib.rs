//! Harvest orchestration: task enumeration, the per-task retry loop, the
//! bounded dispatcher, and the three-phase pipeline.
//!
//! Resumption never consults a ledger. The pending set for a phase is
//! `universe − artifacts on disk`, computed once per invocation, and a task
//! that exhausts its attempts simply leaves nothing behind, so the next run
//! enumerates it again.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use soletrace_adapters::{
    detail_canonical_url, extract_listing_links, extract_product_detail, extract_proxy_endpoints,
    links_from_csv, links_to_csv_row, parse_activity_document, ParseError,
};
use soletrace_core::{FetchOutcome, FetchTask, Phase, DEFAULT_MAX_ATTEMPTS};
use soletrace_storage::{
    ArtifactStore, DirectFetcher, FetchFailure, HttpClientConfig, ProxyPool, SiteFetcher,
    DEFAULT_USER_AGENT,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "soletrace-harvest";

pub const DEFAULT_SITE_BASE: &str = "https://stockx.com";
pub const DEFAULT_PROXY_PROVIDER: &str = "https://free-proxy-list.net/";
pub const DEFAULT_PAGE_COUNT: u32 = 25;

/// Fixed query the remote activity API expects; everything but the SKU is
/// constant.
pub const ACTIVITY_QUERY: &str =
    "state=480&currency=USD&limit=100000&page=1&sort=createdAt&order=DESC";

pub fn listing_url(site_base: &str, brand: &str, page: &str) -> String {
    format!("{}/{}?page={}", site_base.trim_end_matches('/'), brand, page)
}

pub fn detail_url(site_base: &str, link: &str) -> String {
    let base = site_base.trim_end_matches('/');
    if link.starts_with('/') {
        format!("{base}{link}")
    } else {
        format!("{base}/{link}")
    }
}

pub fn activity_url(site_base: &str, sku: &str) -> String {
    format!(
        "{}/api/products/{}/activity?{}",
        site_base.trim_end_matches('/'),
        sku,
        ACTIVITY_QUERY
    )
}

/// Where the proxy pool comes from, resolved once at process start.
#[derive(Debug, Clone)]
pub enum ProxySource {
    /// Local file of newline-separated `host:port` entries.
    File(PathBuf),
    /// Remote provider page carrying an endpoint table.
    Provider(String),
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub site_base: String,
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub proxy_source: ProxySource,
    pub http: HttpClientConfig,
    pub worker_count: usize,
    pub max_attempts: u32,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let proxy_source = match std::env::var("SOLETRACE_PROXIES_FILE") {
            Ok(path) if !path.is_empty() => ProxySource::File(PathBuf::from(path)),
            _ => ProxySource::Provider(
                std::env::var("SOLETRACE_PROXY_PROVIDER")
                    .unwrap_or_else(|_| DEFAULT_PROXY_PROVIDER.to_string()),
            ),
        };
        Self {
            site_base: std::env::var("SOLETRACE_SITE_BASE")
                .unwrap_or_else(|_| DEFAULT_SITE_BASE.to_string()),
            data_dir: std::env::var("SOLETRACE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            registry_path: std::env::var("SOLETRACE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("brands.yaml")),
            proxy_source,
            http: HttpClientConfig {
                user_agent: std::env::var("SOLETRACE_USER_AGENT")
                    .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
                timeout: Duration::from_secs(
                    std::env::var("SOLETRACE_HTTP_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(20),
                ),
            },
            worker_count: std::env::var("SOLETRACE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_worker_count),
            max_attempts: std::env::var("SOLETRACE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

/// Resolve the proxy pool from its configured source. An empty pool is a
/// fatal startup condition either way.
pub async fn load_proxy_pool(source: &ProxySource, http: &HttpClientConfig) -> Result<ProxyPool> {
    match source {
        ProxySource::File(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading proxy file {}", path.display()))?;
            Ok(ProxyPool::from_lines(&text)?)
        }
        ProxySource::Provider(url) => {
            let fetcher = DirectFetcher::new(http)?;
            let body = fetcher
                .get_text(url, 0)
                .await
                .with_context(|| format!("fetching proxy provider {url}"))?;
            let endpoints = extract_proxy_endpoints(&body)?;
            Ok(ProxyPool::new(endpoints)?)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandRegistry {
    pub brands: Vec<BrandConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandConfig {
    pub slug: String,
    pub display_name: String,
    pub enabled: bool,
    /// Per-brand browse-page count override.
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BrandRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &BrandConfig> {
        self.brands.iter().filter(|brand| brand.enabled)
    }

    pub fn find(&self, slug: &str) -> Option<&BrandConfig> {
        self.brands.iter().find(|brand| brand.slug == slug)
    }
}

/// One attempt's failure. Network faults, bad statuses, structural parse
/// failures, and store write failures all land here and are all equally
/// retryable; the loop rotates egress and tries again.
#[derive(Debug, Error)]
pub enum AttemptFault {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchFailure),
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("store: {0}")]
    Store(anyhow::Error),
}

/// One complete attempt for one task: build the URL, fetch through the
/// egress for that attempt index, structurally parse, persist the artifact.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    async fn attempt(&self, task: &FetchTask, attempt: u32) -> Result<(), AttemptFault>;
}

/// Drive one task to a terminal state: succeed once, or exhaust the attempt
/// budget. The first success ends the loop immediately; `attempts_used` is
/// recorded for observability only. An exhausted task is left unpersisted
/// on purpose so a future run picks it up again.
pub async fn fetch_with_retry(
    worker: &dyn PhaseWorker,
    task: FetchTask,
    max_attempts: u32,
) -> FetchOutcome {
    let max_attempts = max_attempts.max(1);
    let mut last_fault = String::new();
    for attempt in 0..max_attempts {
        match worker.attempt(&task, attempt).await {
            Ok(()) => {
                info!(
                    phase = %task.phase,
                    brand = %task.brand,
                    identifier = %task.identifier,
                    attempts = attempt + 1,
                    "task complete"
                );
                return FetchOutcome::succeeded(task, attempt + 1);
            }
            Err(fault) => {
                warn!(
                    phase = %task.phase,
                    brand = %task.brand,
                    identifier = %task.identifier,
                    attempt = attempt + 1,
                    fault = %fault,
                    "attempt failed"
                );
                last_fault = fault.to_string();
            }
        }
    }
    warn!(
        phase = %task.phase,
        brand = %task.brand,
        identifier = %task.identifier,
        attempts = max_attempts,
        "task exhausted its attempt budget; left for the next run"
    );
    FetchOutcome::exhausted(task, max_attempts, last_fault)
}

/// Run the retry loop over every task on a bounded pool of `worker_count`
/// concurrent tasks. No ordering across tasks; each task's attempts are
/// strictly sequential. A panicking worker forfeits only its own task: the
/// join error is logged, the identifier stays absent from the store, and
/// the next run re-enumerates it.
pub async fn dispatch(
    worker: Arc<dyn PhaseWorker>,
    tasks: Vec<FetchTask>,
    worker_count: usize,
    max_attempts: u32,
) -> Vec<FetchOutcome> {
    let permits = Arc::new(Semaphore::new(worker_count.max(1)));
    let mut joins = JoinSet::new();
    for task in tasks {
        let worker = Arc::clone(&worker);
        let permits = Arc::clone(&permits);
        joins.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("dispatch semaphore is never closed");
            fetch_with_retry(worker.as_ref(), task, max_attempts).await
        });
    }

    let mut outcomes = Vec::with_capacity(joins.len());
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(error = %err, "fetch worker aborted; its task stays pending"),
        }
    }
    outcomes
}

/// Links phase: one brand browse page per task, persisted as a single CSV
/// row of product link paths. An empty grid is a legitimate tail page and
/// persists an empty row, which is what marks the page complete.
pub struct LinksWorker {
    fetcher: Arc<dyn SiteFetcher>,
    store: ArtifactStore,
    site_base: String,
}

impl LinksWorker {
    pub fn new(fetcher: Arc<dyn SiteFetcher>, store: ArtifactStore, site_base: String) -> Self {
        Self {
            fetcher,
            store,
            site_base,
        }
    }
}

#[async_trait]
impl PhaseWorker for LinksWorker {
    async fn attempt(&self, task: &FetchTask, attempt: u32) -> Result<(), AttemptFault> {
        let url = listing_url(&self.site_base, &task.brand, &task.identifier);
        let body = self.fetcher.get_text(&url, attempt).await?;
        let links = extract_listing_links(&body)?;
        let row = links_to_csv_row(&links);
        self.store
            .write(Phase::Links, &task.brand, &task.identifier, row.as_bytes())
            .await
            .map_err(AttemptFault::Store)?;
        Ok(())
    }
}

/// Detail phase: the task identifier is a link path, but the artifact is
/// keyed by the SKU extracted from the page, matching the layout downstream
/// consumers expect.
pub struct DetailWorker {
    fetcher: Arc<dyn SiteFetcher>,
    store: ArtifactStore,
    site_base: String,
}

impl DetailWorker {
    pub fn new(fetcher: Arc<dyn SiteFetcher>, store: ArtifactStore, site_base: String) -> Self {
        Self {
            fetcher,
            store,
            site_base,
        }
    }
}

#[async_trait]
impl PhaseWorker for DetailWorker {
    async fn attempt(&self, task: &FetchTask, attempt: u32) -> Result<(), AttemptFault> {
        let url = detail_url(&self.site_base, &task.identifier);
        let body = self.fetcher.get_text(&url, attempt).await?;
        let detail = extract_product_detail(&body)?;
        let bytes = serde_json::to_vec(&detail.document).map_err(ParseError::from)?;
        self.store
            .write(Phase::Detail, &task.brand, &detail.sku, &bytes)
            .await
            .map_err(AttemptFault::Store)?;
        Ok(())
    }
}

/// Transactions phase: the activity document is validated as JSON and
/// persisted opaquely; everything inside it belongs to downstream jobs.
pub struct TransactionsWorker {
    fetcher: Arc<dyn SiteFetcher>,
    store: ArtifactStore,
    site_base: String,
}

impl TransactionsWorker {
    pub fn new(fetcher: Arc<dyn SiteFetcher>, store: ArtifactStore, site_base: String) -> Self {
        Self {
            fetcher,
            store,
            site_base,
        }
    }
}

#[async_trait]
impl PhaseWorker for TransactionsWorker {
    async fn attempt(&self, task: &FetchTask, attempt: u32) -> Result<(), AttemptFault> {
        let url = activity_url(&self.site_base, &task.identifier);
        let body = self.fetcher.get_text(&url, attempt).await?;
        let document = parse_activity_document(&body)?;
        let bytes = serde_json::to_vec(&document).map_err(ParseError::from)?;
        self.store
            .write(Phase::Transactions, &task.brand, &task.identifier, &bytes)
            .await
            .map_err(AttemptFault::Store)?;
        Ok(())
    }
}

/// Computes each phase's pending set from one consistent snapshot of the
/// store: `universe − already persisted`.
pub struct TaskEnumerator<'a> {
    store: &'a ArtifactStore,
}

impl<'a> TaskEnumerator<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        Self { store }
    }

    /// Pages `1..=page_count` that have no persisted link row yet, in
    /// ascending order.
    pub fn pending_pages(&self, brand: &str, page_count: u32) -> Result<Vec<FetchTask>> {
        let done = self.store.list_identifiers(Phase::Links, brand)?;
        Ok((1..=page_count.max(1))
            .map(|page| page.to_string())
            .filter(|page| !done.contains(page))
            .map(|page| FetchTask::new(Phase::Links, brand, page))
            .collect())
    }

    /// Every link seen so far for a brand: the per-page rows flattened in
    /// ascending numeric page order, de-duplicated in first-seen order.
    pub async fn link_universe(&self, brand: &str) -> Result<Vec<String>> {
        let mut pages: Vec<String> = self
            .store
            .list_identifiers(Phase::Links, brand)?
            .into_iter()
            .collect();
        pages.sort_by_key(|page| page.parse::<u64>().unwrap_or(u64::MAX));

        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for page in pages {
            let row = self.store.read_to_string(Phase::Links, brand, &page).await?;
            for link in links_from_csv(&row) {
                if seen.insert(link.clone()) {
                    links.push(link);
                }
            }
        }
        Ok(links)
    }

    /// Canonical URLs of products whose detail document is already on disk,
    /// recovered from each document's `offers.url`. A document without that
    /// field cannot be matched back to its link, so the link stays pending
    /// and the next run refreshes the artifact.
    pub async fn completed_detail_urls(&self, brand: &str) -> Result<HashSet<String>> {
        let mut urls = HashSet::new();
        for sku in self.store.list_identifiers(Phase::Detail, brand)? {
            let text = self.store.read_to_string(Phase::Detail, brand, &sku).await?;
            let document: JsonValue = match serde_json::from_str(&text) {
                Ok(document) => document,
                Err(err) => {
                    warn!(brand, sku = %sku, error = %err, "unreadable detail artifact; its link stays pending");
                    continue;
                }
            };
            if let Some(url) = detail_canonical_url(&document) {
                urls.insert(url.to_string());
            }
        }
        Ok(urls)
    }

    /// Links from the universe whose canonical URL is not yet covered by a
    /// persisted detail document.
    pub async fn pending_details(
        &self,
        brand: &str,
        site_base: &str,
        universe: &[String],
    ) -> Result<Vec<FetchTask>> {
        let completed = self.completed_detail_urls(brand).await?;
        Ok(universe
            .iter()
            .filter(|link| !completed.contains(&detail_url(site_base, link)))
            .map(|link| FetchTask::new(Phase::Detail, brand, link.clone()))
            .collect())
    }

    /// Transaction candidates: every SKU with a detail document.
    pub fn transaction_universe(&self, brand: &str) -> Result<BTreeSet<String>> {
        self.store.list_identifiers(Phase::Detail, brand)
    }

    pub fn pending_transactions(
        &self,
        brand: &str,
        universe: &BTreeSet<String>,
    ) -> Result<Vec<FetchTask>> {
        let done = self.store.list_identifiers(Phase::Transactions, brand)?;
        Ok(universe
            .difference(&done)
            .map(|sku| FetchTask::new(Phase::Transactions, brand, sku.clone()))
            .collect())
    }
}

/// Rebuild the flattened per-brand links export from the per-page rows.
pub async fn merge_links(store: &ArtifactStore, brand: &str) -> Result<PathBuf> {
    let links = TaskEnumerator::new(store).link_universe(brand).await?;
    let row = links_to_csv_row(&links);
    store.write_merged_links(brand, row.as_bytes()).await
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub universe: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub exhausted: usize,
}

impl PhaseSummary {
    fn from_outcomes(
        phase: Phase,
        universe: usize,
        pending: usize,
        outcomes: &[FetchOutcome],
    ) -> Self {
        Self {
            phase,
            universe,
            pending,
            succeeded: outcomes.iter().filter(|o| o.success).count(),
            exhausted: outcomes.iter().filter(|o| !o.success).count(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub brand: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseSummary>,
}

/// The three-phase harvest for one brand: browse pages, product details,
/// sales activity. Each phase dispatches only its pending set, so repeated
/// runs pick up where the last one stopped.
pub struct HarvestPipeline {
    config: HarvestConfig,
    store: ArtifactStore,
    fetcher: Arc<dyn SiteFetcher>,
}

impl HarvestPipeline {
    /// Production construction: resolve the proxy pool (fatal if empty) and
    /// route all site traffic through it.
    pub async fn bootstrap(config: HarvestConfig) -> Result<Self> {
        let pool = load_proxy_pool(&config.proxy_source, &config.http).await?;
        info!(endpoints = pool.len(), "proxy pool loaded");
        let fetcher = Arc::new(soletrace_storage::ProxiedFetcher::new(pool, &config.http)?);
        Ok(Self::with_fetcher(config, fetcher))
    }

    /// Construction with an injected fetcher.
    pub fn with_fetcher(mut config: HarvestConfig, fetcher: Arc<dyn SiteFetcher>) -> Self {
        config.worker_count = config.worker_count.max(1);
        config.max_attempts = config.max_attempts.max(1);
        let store = ArtifactStore::new(config.data_dir.clone());
        Self {
            config,
            store,
            fetcher,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn run_links_phase(&self, brand: &str, page_count: u32) -> Result<PhaseSummary> {
        let page_count = page_count.max(1);
        let tasks = TaskEnumerator::new(&self.store).pending_pages(brand, page_count)?;
        let pending = tasks.len();
        info!(brand, universe = page_count, pending, "links phase starting");

        let worker = Arc::new(LinksWorker::new(
            Arc::clone(&self.fetcher),
            self.store.clone(),
            self.config.site_base.clone(),
        ));
        let outcomes = dispatch(worker, tasks, self.config.worker_count, self.config.max_attempts).await;
        let summary =
            PhaseSummary::from_outcomes(Phase::Links, page_count as usize, pending, &outcomes);

        merge_links(&self.store, brand).await?;
        Ok(summary)
    }

    pub async fn run_detail_phase(&self, brand: &str) -> Result<PhaseSummary> {
        let enumerator = TaskEnumerator::new(&self.store);
        let universe = enumerator.link_universe(brand).await?;
        let tasks = enumerator
            .pending_details(brand, &self.config.site_base, &universe)
            .await?;
        let pending = tasks.len();
        info!(brand, universe = universe.len(), pending, "detail phase starting");

        let worker = Arc::new(DetailWorker::new(
            Arc::clone(&self.fetcher),
            self.store.clone(),
            self.config.site_base.clone(),
        ));
        let outcomes = dispatch(worker, tasks, self.config.worker_count, self.config.max_attempts).await;
        Ok(PhaseSummary::from_outcomes(
            Phase::Detail,
            universe.len(),
            pending,
            &outcomes,
        ))
    }

    pub async fn run_transactions_phase(&self, brand: &str) -> Result<PhaseSummary> {
        let enumerator = TaskEnumerator::new(&self.store);
        let universe = enumerator.transaction_universe(brand)?;
        let tasks = enumerator.pending_transactions(brand, &universe)?;
        let pending = tasks.len();
        info!(brand, universe = universe.len(), pending, "transactions phase starting");

        let worker = Arc::new(TransactionsWorker::new(
            Arc::clone(&self.fetcher),
            self.store.clone(),
            self.config.site_base.clone(),
        ));
        let outcomes = dispatch(worker, tasks, self.config.worker_count, self.config.max_attempts).await;
        Ok(PhaseSummary::from_outcomes(
            Phase::Transactions,
            universe.len(),
            pending,
            &outcomes,
        ))
    }

    /// All three phases in pipeline order, plus a run report under
    /// `reports/`. The report is operator output; resumption never reads it.
    pub async fn run_all(&self, brand: &str, page_count: u32) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let phases = vec![
            self.run_links_phase(brand, page_count).await?,
            self.run_detail_phase(brand).await?,
            self.run_transactions_phase(brand).await?,
        ];

        let summary = RunSummary {
            run_id,
            brand: brand.to_string(),
            started_at,
            finished_at: Utc::now(),
            phases,
        };
        let bytes = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        let report = self.store.write_report(&run_id.to_string(), &bytes).await?;
        info!(brand, run_id = %run_id, report = %report.display(), "run complete");
        Ok(summary)
    }

    pub async fn merge_links(&self, brand: &str) -> Result<PathBuf> {
        merge_links(&self.store, brand).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct ScriptedWorker {
        calls: AtomicU32,
        succeed_on: Option<u32>,
    }

    impl ScriptedWorker {
        fn failing_until(succeed_on: Option<u32>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on,
            }
        }
    }

    #[async_trait]
    impl PhaseWorker for ScriptedWorker {
        async fn attempt(&self, _task: &FetchTask, attempt: u32) -> Result<(), AttemptFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed_on == Some(attempt) {
                Ok(())
            } else {
                Err(AttemptFault::Fetch(FetchFailure::Status {
                    status: 503,
                    url: "http://proxy.test".to_string(),
                }))
            }
        }
    }

    /// Scripted site: URL → body, with optional per-URL failure budgets that
    /// burn down before a response is served.
    struct ScriptedFetcher {
        responses: HashMap<String, String>,
        failures: Mutex<HashMap<String, u32>>,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(responses: HashMap<String, String>) -> Self {
            Self {
                responses,
                failures: Mutex::new(HashMap::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn failing_first(mut self, url: &str, times: u32) -> Self {
            self.failures
                .get_mut()
                .unwrap()
                .insert(url.to_string(), times);
            self
        }
    }

    #[async_trait]
    impl SiteFetcher for ScriptedFetcher {
        async fn get_text(&self, url: &str, _attempt: u32) -> Result<String, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchFailure::Status {
                        status: 503,
                        url: url.to_string(),
                    });
                }
            }
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| FetchFailure::Status {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    const SITE: &str = "https://site.test";

    fn test_config(data_dir: &Path) -> HarvestConfig {
        HarvestConfig {
            site_base: SITE.to_string(),
            data_dir: data_dir.to_path_buf(),
            registry_path: PathBuf::from("brands.yaml"),
            proxy_source: ProxySource::File(PathBuf::from("/dev/null")),
            http: HttpClientConfig::default(),
            worker_count: 2,
            max_attempts: 3,
        }
    }

    fn listing_html(links: &[&str]) -> String {
        let anchors: String = links
            .iter()
            .map(|link| format!(r#"<a href="{link}">x</a>"#))
            .collect();
        format!(r#"<html><body><div class="browse-grid">{anchors}</div></body></html>"#)
    }

    fn detail_html(sku: &str, canonical: &str) -> String {
        format!(
            r#"<html><head><script type="application/ld+json">
               {{"@type":"Product","sku":"{sku}","offers":{{"url":"{canonical}"}}}}
               </script></head></html>"#
        )
    }

    #[tokio::test]
    async fn first_success_stops_the_attempt_sequence() {
        let worker = ScriptedWorker::failing_until(Some(3));
        let task = FetchTask::new(Phase::Links, "adidas", "1");
        let outcome = fetch_with_retry(&worker, task, 10).await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts_used, 4);
        assert!(outcome.failure_reason.is_none());
        // no 5th call after the success
        assert_eq!(worker.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhaustion_spends_exactly_the_attempt_budget() {
        let worker = ScriptedWorker::failing_until(None);
        let task = FetchTask::new(Phase::Detail, "nike", "/nike-air-max-90");
        let outcome = fetch_with_retry(&worker, task, 10).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts_used, 10);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 10);
        assert!(outcome.failure_reason.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn parse_faults_consume_attempts_like_network_faults() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let url = detail_url(SITE, "/blocked-shoe");
        // 200-status body with no product block at all
        let fetcher = Arc::new(ScriptedFetcher::new(HashMap::from([(
            url,
            "<html><body>are you a robot?</body></html>".to_string(),
        )])));

        let worker = DetailWorker::new(fetcher.clone(), store.clone(), SITE.to_string());
        let task = FetchTask::new(Phase::Detail, "nike", "/blocked-shoe");
        let outcome = fetch_with_retry(&worker, task, 5).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts_used, 5);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
        assert!(store.list_identifiers(Phase::Detail, "nike").unwrap().is_empty());
    }

    struct PanickyWorker;

    #[async_trait]
    impl PhaseWorker for PanickyWorker {
        async fn attempt(&self, task: &FetchTask, _attempt: u32) -> Result<(), AttemptFault> {
            if task.identifier == "2" {
                panic!("worker blew up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_worker_forfeits_only_its_own_task() {
        let tasks = ["1", "2", "3"]
            .into_iter()
            .map(|page| FetchTask::new(Phase::Links, "adidas", page))
            .collect();
        let outcomes = dispatch(Arc::new(PanickyWorker), tasks, 2, 3).await;

        let mut completed: Vec<String> = outcomes
            .iter()
            .map(|o| o.task.identifier.clone())
            .collect();
        completed.sort();
        assert_eq!(completed, vec!["1", "3"]);
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[tokio::test]
    async fn worker_count_changes_timing_not_store_contents() {
        let mut final_sets = Vec::new();
        for worker_count in [1usize, 4] {
            let dir = tempdir().unwrap();
            let store = ArtifactStore::new(dir.path());
            let fetcher = Arc::new(
                ScriptedFetcher::new(HashMap::from([
                    (listing_url(SITE, "adidas", "1"), listing_html(&["/a"])),
                    (listing_url(SITE, "adidas", "2"), listing_html(&["/b"])),
                    (listing_url(SITE, "adidas", "3"), listing_html(&[])),
                ]))
                .failing_first(&listing_url(SITE, "adidas", "2"), 2),
            );
            let worker = Arc::new(LinksWorker::new(fetcher, store.clone(), SITE.to_string()));
            let tasks = TaskEnumerator::new(&store).pending_pages("adidas", 3).unwrap();

            dispatch(worker, tasks, worker_count, 10).await;
            final_sets.push(store.list_identifiers(Phase::Links, "adidas").unwrap());
        }
        assert_eq!(final_sets[0], final_sets[1]);
        assert_eq!(final_sets[0].len(), 3);
    }

    #[tokio::test]
    async fn pending_pages_is_stable_and_subtracts_completed() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let enumerator = TaskEnumerator::new(&store);

        let first = enumerator.pending_pages("nike", 4).unwrap();
        let second = enumerator.pending_pages("nike", 4).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);

        store.write(Phase::Links, "nike", "2", b"\r\n").await.unwrap();
        let remaining: Vec<String> = enumerator
            .pending_pages("nike", 4)
            .unwrap()
            .into_iter()
            .map(|t| t.identifier)
            .collect();
        assert_eq!(remaining, vec!["1", "3", "4"]);
    }

    #[tokio::test]
    async fn link_universe_flattens_pages_in_numeric_order_and_dedupes() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        // page 10 written first; numeric order must still put page 2 first
        store
            .write(Phase::Links, "adidas", "10", links_to_csv_row(&["/z".into(), "/a".into()]).as_bytes())
            .await
            .unwrap();
        store
            .write(Phase::Links, "adidas", "2", links_to_csv_row(&["/a".into(), "/b".into()]).as_bytes())
            .await
            .unwrap();

        let universe = TaskEnumerator::new(&store).link_universe("adidas").await.unwrap();
        assert_eq!(universe, vec!["/a", "/b", "/z"]);

        let merged = merge_links(&store, "adidas").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(merged).unwrap(),
            "\"/a\",\"/b\",\"/z\"\r\n"
        );
    }

    #[tokio::test]
    async fn detail_resume_maps_completed_urls_back_to_links() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let enumerator = TaskEnumerator::new(&store);

        store
            .write(
                Phase::Detail,
                "adidas",
                "SKU-A",
                format!(r#"{{"sku":"SKU-A","offers":{{"url":"{SITE}/shoe-a"}}}}"#).as_bytes(),
            )
            .await
            .unwrap();
        // persisted document with no offers.url cannot be matched back
        store
            .write(Phase::Detail, "adidas", "SKU-B", br#"{"sku":"SKU-B"}"#)
            .await
            .unwrap();

        let universe = vec!["/shoe-a".to_string(), "/shoe-b".to_string()];
        let pending: Vec<String> = enumerator
            .pending_details("adidas", SITE, &universe)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.identifier)
            .collect();
        assert_eq!(pending, vec!["/shoe-b"]);
    }

    #[tokio::test]
    async fn transactions_pending_is_details_minus_done() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let enumerator = TaskEnumerator::new(&store);

        store.write(Phase::Detail, "nike", "SKU-A", b"{}").await.unwrap();
        store.write(Phase::Detail, "nike", "SKU-B", b"{}").await.unwrap();
        store
            .write(Phase::Transactions, "nike", "SKU-A", b"{}")
            .await
            .unwrap();

        let universe = enumerator.transaction_universe("nike").unwrap();
        assert_eq!(universe.len(), 2);
        let pending: Vec<String> = enumerator
            .pending_transactions("nike", &universe)
            .unwrap()
            .into_iter()
            .map(|t| t.identifier)
            .collect();
        assert_eq!(pending, vec!["SKU-B"]);
    }

    #[tokio::test]
    async fn full_run_completes_every_phase_and_resumes_to_nothing() {
        let dir = tempdir().unwrap();
        let responses = HashMap::from([
            (
                listing_url(SITE, "adidas", "1"),
                listing_html(&["/shoe-a", "/shoe-b"]),
            ),
            (listing_url(SITE, "adidas", "2"), listing_html(&[])),
            (
                detail_url(SITE, "/shoe-a"),
                detail_html("SKU-A", &format!("{SITE}/shoe-a")),
            ),
            (
                detail_url(SITE, "/shoe-b"),
                detail_html("SKU-B", &format!("{SITE}/shoe-b")),
            ),
            (
                activity_url(SITE, "SKU-A"),
                r#"{"ProductActivity":[{"amount":230}]}"#.to_string(),
            ),
            (
                activity_url(SITE, "SKU-B"),
                r#"{"ProductActivity":[]}"#.to_string(),
            ),
        ]);
        let pipeline = HarvestPipeline::with_fetcher(
            test_config(dir.path()),
            Arc::new(ScriptedFetcher::new(responses.clone())),
        );

        let summary = pipeline.run_all("adidas", 2).await.unwrap();
        assert_eq!(summary.phases.len(), 3);
        let [links, details, transactions] = &summary.phases[..] else {
            panic!("three phases expected");
        };
        assert_eq!((links.universe, links.pending, links.succeeded), (2, 2, 2));
        assert_eq!((details.universe, details.pending, details.succeeded), (2, 2, 2));
        assert_eq!(
            (transactions.universe, transactions.pending, transactions.succeeded),
            (2, 2, 2)
        );

        let store = pipeline.store();
        assert!(store.exists(Phase::Detail, "adidas", "SKU-A"));
        assert!(store.exists(Phase::Transactions, "adidas", "SKU-B"));
        assert!(store.merged_links_path("adidas").is_file());
        assert!(dir.path().join("reports").join(format!("{}.json", summary.run_id)).is_file());

        // a second run finds everything complete and fetches nothing
        let again = HarvestPipeline::with_fetcher(
            test_config(dir.path()),
            Arc::new(ScriptedFetcher::new(responses)),
        );
        let summary = again.run_all("adidas", 2).await.unwrap();
        assert!(summary.phases.iter().all(|p| p.pending == 0));
    }

    #[tokio::test]
    async fn exhausted_pages_stay_pending_for_the_next_run() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetcher = Arc::new(
            ScriptedFetcher::new(HashMap::from([(
                listing_url(SITE, "nike", "1"),
                listing_html(&["/nike-shoe"]),
            )]))
            // page 2 fails more times than the attempt budget allows
            .failing_first(&listing_url(SITE, "nike", "2"), 99),
        );
        let worker = Arc::new(LinksWorker::new(fetcher, store.clone(), SITE.to_string()));
        let tasks = TaskEnumerator::new(&store).pending_pages("nike", 2).unwrap();

        let outcomes = dispatch(worker, tasks, 2, 3).await;
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.success).count(), 1);

        let remaining: Vec<String> = TaskEnumerator::new(&store)
            .pending_pages("nike", 2)
            .unwrap()
            .into_iter()
            .map(|t| t.identifier)
            .collect();
        assert_eq!(remaining, vec!["2"]);
    }

    #[test]
    fn brand_registry_parses_overrides_and_filters_enabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brands.yaml");
        std::fs::write(
            &path,
            "brands:\n\
             \x20 - slug: adidas\n\
             \x20   display_name: Adidas\n\
             \x20   enabled: true\n\
             \x20   pages: 12\n\
             \x20 - slug: retro-jordans\n\
             \x20   display_name: Retro Jordans\n\
             \x20   enabled: false\n\
             \x20   notes: blocked upstream\n",
        )
        .unwrap();

        let registry = BrandRegistry::load(&path).unwrap();
        assert_eq!(registry.brands.len(), 2);
        assert_eq!(registry.find("adidas").unwrap().pages, Some(12));
        let enabled: Vec<&str> = registry.enabled().map(|b| b.slug.as_str()).collect();
        assert_eq!(enabled, vec!["adidas"]);
    }

    #[test]
    fn url_builders_match_the_remote_contract() {
        assert_eq!(
            listing_url("https://stockx.com/", "adidas", "3"),
            "https://stockx.com/adidas?page=3"
        );
        assert_eq!(
            detail_url("https://stockx.com", "/adidas-yeezy-boost-350"),
            "https://stockx.com/adidas-yeezy-boost-350"
        );
        assert_eq!(
            activity_url("https://stockx.com", "FY2903"),
            "https://stockx.com/api/products/FY2903/activity?\
             state=480&currency=USD&limit=100000&page=1&sort=createdAt&order=DESC"
        );
    }
}
