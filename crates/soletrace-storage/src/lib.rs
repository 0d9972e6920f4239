//! Proxy pool, proxied HTTP fetch utilities, and the filesystem artifact
//! store for SoleTrace.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header;
use soletrace_core::{Phase, ProxyEndpoint};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "soletrace-storage";

/// Default request identity; the set the remote accepts without fuss.
pub const DEFAULT_USER_AGENT: &str = "PostmanRuntime/7.19.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("proxy source yielded no usable endpoints")]
    Empty,
}

/// Fixed, ordered set of proxy endpoints loaded once at startup.
///
/// Rotation is a pure function of the attempt index, not an internal
/// cursor, so concurrent workers never contend and a given attempt number
/// always maps to the same endpoint.
#[derive(Debug, Clone)]
pub struct ProxyPool {
    endpoints: Vec<ProxyEndpoint>,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Result<Self, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self { endpoints })
    }

    /// Parse newline-separated `host:port` entries. Blank lines, `#`
    /// comments, and entries that do not parse are dropped; an input with
    /// nothing usable left is `PoolError::Empty`.
    pub fn from_lines(text: &str) -> Result<Self, PoolError> {
        let endpoints = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(ProxyEndpoint::parse)
            .collect();
        Self::new(endpoints)
    }

    /// Endpoint for an attempt index: `pool[attempt mod len]`. Consecutive
    /// attempts within one task's retry loop leave through different
    /// endpoints before the sequence repeats.
    pub fn select(&self, attempt: u32) -> &ProxyEndpoint {
        &self.endpoints[self.select_index(attempt)]
    }

    pub fn select_index(&self, attempt: u32) -> usize {
        attempt as usize % self.endpoints.len()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }
}

#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// One GET, body returned as text iff the status is a success. The attempt
/// index decides which egress the request leaves through; implementations
/// without rotation ignore it.
#[async_trait]
pub trait SiteFetcher: Send + Sync {
    async fn get_text(&self, url: &str, attempt: u32) -> Result<String, FetchFailure>;
}

/// Production fetcher: one `reqwest::Client` per pool endpoint, built once
/// at bootstrap, selected per attempt via the pool's pure rotation.
#[derive(Debug)]
pub struct ProxiedFetcher {
    pool: ProxyPool,
    clients: Vec<reqwest::Client>,
}

impl ProxiedFetcher {
    pub fn new(pool: ProxyPool, config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut clients = Vec::with_capacity(pool.len());
        for endpoint in pool.endpoints() {
            let proxy_url = format!("http://{endpoint}");
            let proxy = reqwest::Proxy::all(&proxy_url)
                .with_context(|| format!("building proxy {proxy_url}"))?;
            let client = reqwest::Client::builder()
                .proxy(proxy)
                .user_agent(config.user_agent.as_str())
                .timeout(config.timeout)
                .gzip(true)
                .brotli(true)
                .build()
                .with_context(|| format!("building client for proxy {proxy_url}"))?;
            clients.push(client);
        }
        Ok(Self { pool, clients })
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }
}

#[async_trait]
impl SiteFetcher for ProxiedFetcher {
    async fn get_text(&self, url: &str, attempt: u32) -> Result<String, FetchFailure> {
        let slot = self.pool.select_index(attempt);
        debug!(url, attempt, proxy = %self.pool.endpoints()[slot], "issuing proxied request");
        let response = self.clients[slot]
            .get(url)
            .header(header::ACCEPT, "*/*")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Un-proxied client. Used once at startup to pull the proxy listing
/// itself, before any pool exists.
#[derive(Debug)]
pub struct DirectFetcher {
    client: reqwest::Client,
}

impl DirectFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building direct client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SiteFetcher for DirectFetcher {
    async fn get_text(&self, url: &str, _attempt: u32) -> Result<String, FetchFailure> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Filesystem-backed artifact store keyed by `{phase, brand, identifier}`.
///
/// Artifact existence is the pipeline's only completion marker, so two
/// things are load-bearing here: the path derivation is a pure, injective
/// function of the key, and every write publishes atomically via a temp
/// file + rename. A crash mid-write leaves only a dot-prefixed temp file,
/// which existence checks and listings ignore.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derived artifact path: `<root>/<phase dir>/<brand>/<identifier>.<ext>`
    /// with path-significant characters escaped so distinct identifiers can
    /// never share a path and link identifiers cannot escape the brand dir.
    pub fn path_for(&self, phase: Phase, brand: &str, identifier: &str) -> PathBuf {
        self.root
            .join(phase.dir_name())
            .join(encode_component(brand))
            .join(format!(
                "{}.{}",
                encode_component(identifier),
                phase.file_extension()
            ))
    }

    /// Cheap stat-only completion check.
    pub fn exists(&self, phase: Phase, brand: &str, identifier: &str) -> bool {
        self.path_for(phase, brand, identifier).is_file()
    }

    /// Atomically persist one artifact. At most one file ever exists for a
    /// key; a concurrent or repeated write replaces it whole.
    pub async fn write(
        &self,
        phase: Phase,
        brand: &str,
        identifier: &str,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self.path_for(phase, brand, identifier);
        self.write_atomic(&path, bytes).await?;
        Ok(path)
    }

    pub async fn read_to_string(
        &self,
        phase: Phase,
        brand: &str,
        identifier: &str,
    ) -> anyhow::Result<String> {
        let path = self.path_for(phase, brand, identifier);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    /// All identifiers already persisted for a phase, decoded from the
    /// artifact filenames. A missing phase/brand directory is an empty set,
    /// not an error: it just means nothing has completed yet.
    pub fn list_identifiers(&self, phase: Phase, brand: &str) -> anyhow::Result<BTreeSet<String>> {
        let dir = self.root.join(phase.dir_name()).join(encode_component(brand));
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };

        let mut identifiers = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("listing {}", dir.display()))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // in-flight temp files are dot-prefixed
            if name.starts_with('.') {
                continue;
            }
            let file = Path::new(name);
            if file.extension().and_then(|e| e.to_str()) != Some(phase.file_extension()) {
                continue;
            }
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            identifiers.insert(decode_component(stem));
        }
        Ok(identifiers)
    }

    /// Path of the flattened per-brand links export, kept next to the
    /// per-page directories: `shoe_links/<brand with '-' → '_'>_links.csv`.
    pub fn merged_links_path(&self, brand: &str) -> PathBuf {
        let flat = brand.replace('-', "_");
        self.root
            .join(Phase::Links.dir_name())
            .join(format!("{}_links.csv", encode_component(&flat)))
    }

    pub async fn write_merged_links(&self, brand: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.merged_links_path(brand);
        self.write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// Publish a run report under `reports/`. Reports are operator output,
    /// never read back by the pipeline.
    pub async fn write_report(&self, run_id: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self
            .root
            .join("reports")
            .join(format!("{}.json", encode_component(run_id)));
        self.write_atomic(&path, bytes).await?;
        Ok(path)
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .context("artifact path has no parent directory")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = parent.join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }
}

/// Escape the characters that could change path meaning: `%`, `/`, `\`
/// everywhere, and a leading `.`. Everything else maps to itself, so
/// ordinary identifiers (page numbers, SKUs, brand slugs) read naturally
/// on disk. The escapes make the encoding injective, which is what keeps
/// two identifiers from silently merging onto one artifact path.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, ch) in raw.chars().enumerate() {
        match ch {
            '%' | '/' | '\\' => {
                out.push('%');
                out.push_str(&format!("{:02X}", ch as u32));
            }
            '.' if i == 0 => out.push_str("%2E"),
            _ => out.push(ch),
        }
    }
    out
}

/// Exact inverse of `encode_component`. Malformed escape sequences (stray
/// files someone dropped into the tree) pass through literally.
fn decode_component(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hi = chars.next();
        let lo = chars.next();
        match (hi, lo) {
            (Some(hi), Some(lo)) => {
                let decoded = u32::from_str_radix(&format!("{hi}{lo}"), 16)
                    .ok()
                    .and_then(char::from_u32);
                match decoded {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push('%');
                        out.push(hi);
                        out.push(lo);
                    }
                }
            }
            _ => {
                out.push('%');
                if let Some(hi) = hi {
                    out.push(hi);
                }
                if let Some(lo) = lo {
                    out.push(lo);
                }
            }
        }
    }
    out
}
