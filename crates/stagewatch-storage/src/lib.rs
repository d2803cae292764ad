//! Dataset persistence, raw page archive and polite HTTP fetching for stagewatch.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stagewatch_core::{Dataset, Listing, RawCandidate};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stagewatch-storage";

/// `derniere_maj` format of the existing `stages_data.json` files.
pub const LAST_UPDATED_FORMAT: &str = "%d %B %Y - %H:%M";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub fn last_updated_stamp() -> String {
    Local::now().format(LAST_UPDATED_FORMAT).to_string()
}

/// Write through a uniquely named sibling temp file and rename it over `path`.
/// On any failure the temp file is removed and `path` is left as it was.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).await?;

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("reading dataset {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("parsing dataset {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("serializing dataset: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("writing dataset {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

impl PersistenceError {
    /// The file was read but its content is not a dataset: bad JSON or invalid UTF-8.
    pub fn is_corrupt_content(&self) -> bool {
        match self {
            Self::Parse { .. } => true,
            Self::Read { source, .. } => source.kind() == io::ErrorKind::InvalidData,
            Self::Serialize(_) | Self::Write { .. } => false,
        }
    }
}

/// On-disk layout: `{"derniere_maj": "...", "stages": [ ... ]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistedDataset {
    #[serde(rename = "derniere_maj", default)]
    pub last_updated: String,
    #[serde(rename = "stages", default)]
    pub records: Vec<RawCandidate>,
}

#[derive(Serialize)]
struct PersistedDatasetRef<'a> {
    #[serde(rename = "derniere_maj")]
    last_updated: &'a str,
    #[serde(rename = "stages")]
    records: &'a [Listing],
}

/// A validated dataset plus what validation threw away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDataset {
    pub dataset: Dataset,
    /// Records without a company or title.
    pub rejected: usize,
    /// Later entries repeating an identity key already seen in the file.
    pub collapsed: usize,
}

impl PersistedDataset {
    /// Validate persisted records. Invalid records and repeated keys are dropped and counted.
    pub fn into_dataset(self) -> DecodedDataset {
        let mut rejected = 0usize;
        let listings = self
            .records
            .into_iter()
            .filter_map(|record| match record.into_listing() {
                Ok(listing) => Some(listing),
                Err(err) => {
                    debug!(error = %err, "dropping persisted record");
                    rejected += 1;
                    None
                }
            })
            .collect::<Vec<_>>();
        let (dataset, collapsed) = Dataset::from_listings_counted(self.last_updated, listings);
        DecodedDataset {
            dataset,
            rejected,
            collapsed,
        }
    }
}

pub fn encode_dataset(dataset: &Dataset) -> Result<Vec<u8>, PersistenceError> {
    let mut bytes = serde_json::to_vec_pretty(&PersistedDatasetRef {
        last_updated: dataset.last_updated(),
        records: dataset.listings(),
    })
    .map_err(PersistenceError::Serialize)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Never fails: absent or unusable state yields an empty dataset.
    async fn load(&self) -> Dataset;

    /// Persist `dataset` with a fresh `last_updated` stamp and return what was written.
    async fn save(&self, dataset: Dataset) -> Result<Dataset, PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct JsonDatasetStore {
    path: PathBuf,
}

impl JsonDatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no dataset file exists yet.
    pub async fn try_load(&self) -> Result<Option<Dataset>, PersistenceError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let persisted: PersistedDataset =
            serde_json::from_str(&text).map_err(|source| PersistenceError::Parse {
                path: self.path.clone(),
                source,
            })?;
        let decoded = persisted.into_dataset();
        if decoded.rejected > 0 {
            warn!(
                path = %self.path.display(),
                rejected = decoded.rejected,
                "dropped persisted records missing company or title"
            );
        }
        if decoded.collapsed > 0 {
            warn!(
                path = %self.path.display(),
                collapsed = decoded.collapsed,
                "dropped repeated persisted records; first entry per key kept"
            );
        }
        Ok(Some(decoded.dataset))
    }

    pub fn quarantine_path(&self, now: DateTime<Local>) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset.json".to_string());
        self.path.with_file_name(format!(
            "{file_name}.corrupt-{}",
            now.format("%Y%m%d_%H%M%S")
        ))
    }

    async fn quarantine(&self) {
        let target = self.quarantine_path(Local::now());
        match fs::rename(&self.path, &target).await {
            Ok(()) => warn!(moved_to = %target.display(), "unreadable dataset moved aside"),
            Err(err) => warn!(error = %err, "could not move unreadable dataset aside"),
        }
    }
}

#[async_trait]
impl DatasetStore for JsonDatasetStore {
    async fn load(&self) -> Dataset {
        match self.try_load().await {
            Ok(Some(dataset)) => {
                info!(path = %self.path.display(), listings = dataset.len(), "dataset loaded");
                dataset
            }
            Ok(None) => {
                info!(path = %self.path.display(), "no dataset yet; starting empty");
                Dataset::new()
            }
            Err(err) if err.is_corrupt_content() => {
                warn!(error = %err, "dataset unusable; starting empty");
                self.quarantine().await;
                Dataset::new()
            }
            Err(err) => {
                warn!(error = %err, "dataset unreadable; starting empty and leaving file in place");
                Dataset::new()
            }
        }
    }

    async fn save(&self, dataset: Dataset) -> Result<Dataset, PersistenceError> {
        let dataset = dataset.with_last_updated(last_updated_stamp());
        let bytes = encode_dataset(&dataset)?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.path.clone(),
                source,
            })?;
        info!(
            path = %self.path.display(),
            listings = dataset.len(),
            last_updated = dataset.last_updated(),
            "dataset saved"
        );
        Ok(dataset)
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDatasetStore {
    dataset: Mutex<Dataset>,
    saves: AtomicUsize,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(dataset: Dataset) -> Self {
        Self {
            dataset: Mutex::new(dataset),
            saves: AtomicUsize::new(0),
        }
    }

    pub async fn snapshot(&self) -> Dataset {
        self.dataset.lock().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetStore for MemoryDatasetStore {
    async fn load(&self) -> Dataset {
        self.dataset.lock().await.clone()
    }

    async fn save(&self, dataset: Dataset) -> Result<Dataset, PersistenceError> {
        let dataset = dataset.with_last_updated(last_updated_stamp());
        *self.dataset.lock().await = dataset.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(dataset)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed copies of fetched search pages, kept for re-parsing offline.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        run_started_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(run_started_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.html"))
    }

    pub async fn archive(
        &self,
        run_started_at: DateTime<Utc>,
        source_id: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.page_relative_path(run_started_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archived page {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, body)
                .await
                .with_context(|| format!("archiving page {}", absolute_path.display()))?;
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: body.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Spaces out successive requests to the same source by at least `min_interval`.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: std::sync::Mutex<HashMap<String, Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Claim the next request slot for `source_id` and return how long to wait for it.
    pub fn reserve(&self, source_id: &str, now: Instant) -> Duration {
        let mut slots = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = slots
            .get(source_id)
            .copied()
            .filter(|slot| *slot > now)
            .unwrap_or(now);
        slots.insert(source_id.to_string(), slot + self.min_interval);
        slot - now
    }

    pub async fn wait_turn(&self, source_id: &str) {
        let wait = self.reserve(source_id, Instant::now());
        if !wait.is_zero() {
            debug!(source_id, wait_ms = wait.as_millis() as u64, "pacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-US,en;q=0.9,fr;q=0.8".to_string(),
            global_concurrency: 4,
            per_source_concurrency: 1,
            min_request_interval: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub source_id: String,
    pub requested_url: String,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("invalid Accept-Language")?,
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(source_id, url).instrument(span).await
    }

    async fn fetch_with_retries(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            self.pacer.wait_turn(source_id).await;
            let retry_allowed = attempt < self.backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        debug!(status = status.as_u16(), bytes = bytes.len(), "page fetched");
                        return Ok(FetchedPage {
                            source_id: source_id.to_string(),
                            requested_url: url.to_string(),
                            final_url,
                            body: String::from_utf8_lossy(&bytes).into_owned(),
                            fetched_at: Utc::now(),
                        });
                    }
                    if !(retry_allowed && classify_status(status) == RetryDisposition::Retryable) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(status = status.as_u16(), attempt, "retryable http status");
                }
                Err(err) => {
                    if !(retry_allowed && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
