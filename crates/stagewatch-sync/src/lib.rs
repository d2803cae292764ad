//! Sync orchestration: source registry, extraction runs, reconciliation with the stored
//! dataset, manual additions, statistics and the optional cron scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagewatch_adapters::{
    extractor_for_source, ExtractedBatch, ExtractionContext, SourceExtractor,
    DEFAULT_RESULTS_PER_PAGE,
};
use stagewatch_core::{
    merge, reconcile, Dataset, DedupConfig, DedupStats, Deduplicator, Listing, MergeOutcome,
    MergeSummary, MissingFieldError, RawCandidate, DEFAULT_MIN_TITLE_CHARS,
};
use stagewatch_storage::{
    DatasetStore, HttpClientConfig, HttpFetcher, JsonDatasetStore, PageArchive, PersistenceError,
    DEFAULT_USER_AGENT,
};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stagewatch-sync";

/// Label used in statistics for a blank domain or location.
pub const UNSPECIFIED: &str = "Non spécifié";

pub const DEFAULT_SYNC_CRON: &str = "0 0 7 * * Mon,Thu";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub search_terms: Vec<String>,
    /// 0 keeps every fragment on the page.
    #[serde(default = "default_results_per_page")]
    pub max_results_per_page: usize,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_results_per_page() -> usize {
    DEFAULT_RESULTS_PER_PAGE
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_file: PathBuf,
    pub artifacts_dir: PathBuf,
    pub archive_pages: bool,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub min_title_chars: usize,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("./stages_data.json"),
            artifacts_dir: PathBuf::from("./artifacts"),
            archive_pages: false,
            scheduler_enabled: false,
            sync_crons: parse_cron_list(DEFAULT_SYNC_CRON),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            request_delay_ms: 2_000,
            min_title_chars: DEFAULT_MIN_TITLE_CHARS,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_file: std::env::var("STAGEWATCH_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_file),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            archive_pages: env_flag("STAGEWATCH_ARCHIVE_PAGES"),
            scheduler_enabled: env_flag("STAGEWATCH_SCHEDULER_ENABLED"),
            sync_crons: std::env::var("SYNC_CRON")
                .map(|raw| parse_cron_list(&raw))
                .ok()
                .filter(|crons| !crons.is_empty())
                .unwrap_or(defaults.sync_crons),
            user_agent: std::env::var("STAGEWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("STAGEWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            request_delay_ms: env_parse("STAGEWATCH_REQUEST_DELAY_MS", defaults.request_delay_ms),
            min_title_chars: env_parse("STAGEWATCH_MIN_TITLE_CHARS", defaults.min_title_chars),
            workspace_root: std::env::var("STAGEWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            min_request_interval: Duration::from_millis(self.request_delay_ms),
            ..HttpClientConfig::default()
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            min_title_chars: self.min_title_chars,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a `;`-separated list of cron expressions.
pub fn parse_cron_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|expr| !expr.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub display_name: String,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub pages_archived: usize,
    pub candidates: usize,
    pub fragments_skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub sources: Vec<SourceRunSummary>,
    pub candidates: usize,
    pub dedup: DedupStats,
    pub merge: MergeSummary,
    pub total_listings: usize,
    pub last_updated: String,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn one_line(&self) -> String {
        format!(
            "run {}: {} candidates from {} sources, {} new, {} updated, {} kept, {} listings total",
            self.run_id,
            self.candidates,
            self.enabled_sources,
            self.merge.inserted,
            self.merge.replaced,
            self.merge.preserved,
            self.total_listings
        )
    }
}

/// A registry entry paired with the extractor that serves it.
pub struct EnabledSource {
    pub config: SourceConfig,
    pub extractor: Box<dyn SourceExtractor>,
}

/// Enabled registry entries with a known extractor, in registry order.
pub fn resolve_sources(registry: SourceRegistry) -> Vec<EnabledSource> {
    registry
        .sources
        .into_iter()
        .filter(|source| source.enabled)
        .filter_map(|config| match extractor_for_source(&config.source_id) {
            Some(extractor) => Some(EnabledSource { config, extractor }),
            None => {
                warn!(source_id = config.source_id.as_str(), "no extractor registered; skipping");
                None
            }
        })
        .collect()
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn DatasetStore>,
    http: HttpFetcher,
    archive: PageArchive,
    dedup: Deduplicator,
    run_lock: tokio::sync::Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(JsonDatasetStore::new(config.data_file.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn DatasetStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        Ok(Self {
            archive: PageArchive::new(config.artifacts_dir.clone()),
            dedup: Deduplicator::new(config.dedup_config()),
            config,
            store,
            http,
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn DatasetStore {
        self.store.as_ref()
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_path()).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = self.load_source_registry().await?;
        let sources = resolve_sources(registry);
        self.run_sources(&sources).await
    }

    /// Extract from every source, dedupe the combined batch once, merge it over the stored
    /// dataset and save. Only a failed save (or an unreadable registry in `run_once`)
    /// fails the run.
    pub async fn run_sources(&self, sources: &[EnabledSource]) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let ctx = ExtractionContext::new();
        let span = info_span!("sync_run", run_id = %ctx.run_id);
        self.run_locked(sources, ctx).instrument(span).await
    }

    async fn run_locked(
        &self,
        sources: &[EnabledSource],
        ctx: ExtractionContext,
    ) -> Result<SyncRunSummary> {
        info!(sources = sources.len(), "sync run started");

        let mut candidates: Vec<RawCandidate> = Vec::new();
        let mut source_summaries = Vec::with_capacity(sources.len());
        for source in sources {
            let batch = source
                .extractor
                .extract(
                    &self.http,
                    &ctx,
                    &source.config.search_terms,
                    source.config.max_results_per_page,
                )
                .await;
            let pages_archived = if self.config.archive_pages {
                self.archive_pages(&ctx, &batch).await
            } else {
                0
            };
            info!(
                source_id = batch.source_id.as_str(),
                candidates = batch.candidates.len(),
                pages_failed = batch.pages_failed,
                fragments_skipped = batch.fragments_skipped,
                "source extracted"
            );
            source_summaries.push(SourceRunSummary {
                source_id: source.config.source_id.clone(),
                display_name: source.config.display_name.clone(),
                pages_fetched: batch.pages.len(),
                pages_failed: batch.pages_failed,
                pages_archived,
                candidates: batch.candidates.len(),
                fragments_skipped: batch.fragments_skipped,
            });
            candidates.extend(batch.candidates);
        }

        let candidate_count = candidates.len();
        let deduped = self.dedup.dedupe(candidates);
        if deduped.stats.rejected() > 0 {
            warn!(
                missing_field = deduped.stats.missing_field,
                implausible_title = deduped.stats.implausible_title,
                "dropped candidates before merge"
            );
        }

        let old = self.store.load().await;
        let MergeOutcome { dataset, summary } = reconcile(deduped.listings, old);
        let saved = self
            .store
            .save(dataset)
            .await
            .context("saving merged dataset")?;

        let mut run = SyncRunSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            enabled_sources: sources.len(),
            sources: source_summaries,
            candidates: candidate_count,
            dedup: deduped.stats,
            merge: summary,
            total_listings: saved.len(),
            last_updated: saved.last_updated().to_string(),
            reports_dir: None,
        };

        match self.write_reports(&run).await {
            Ok(dir) => run.reports_dir = Some(dir.display().to_string()),
            Err(err) => warn!(error = %format!("{err:#}"), "run reports not written"),
        }

        info!(
            inserted = run.merge.inserted,
            replaced = run.merge.replaced,
            preserved = run.merge.preserved,
            total = run.total_listings,
            "sync run finished"
        );
        Ok(run)
    }

    async fn archive_pages(&self, ctx: &ExtractionContext, batch: &ExtractedBatch) -> usize {
        let mut archived = 0usize;
        for page in &batch.pages {
            match self
                .archive
                .archive(ctx.started_at, &batch.source_id, page.body.as_bytes())
                .await
            {
                Ok(stored) if !stored.deduplicated => archived += 1,
                Ok(_) => {}
                Err(err) => warn!(
                    source_id = batch.source_id.as_str(),
                    url = page.final_url.as_str(),
                    error = %format!("{err:#}"),
                    "page not archived"
                ),
            }
        }
        archived
    }

    async fn write_reports(&self, run: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_root().join(run.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let summary_json = serde_json::to_vec_pretty(run).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), summary_json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("brief.md"), render_brief(run))
            .await
            .context("writing brief.md")?;

        Ok(reports_dir)
    }

    /// [`add_manual_listing`] against this pipeline's store, serialized with sync runs.
    pub async fn add_listing(&self, candidate: RawCandidate) -> Result<ManualAddOutcome, ManualAddError> {
        let _guard = self.run_lock.lock().await;
        add_manual_listing(self.store.as_ref(), candidate).await
    }

    /// One cron job per configured expression, each running [`SyncPipeline::run_once`].
    /// Returns `None` when scheduling is disabled. The caller starts the scheduler.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.sync_crons {
            let pipeline = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(run) => info!(summary = run.one_line(), "scheduled sync finished"),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(cron = cron.as_str(), "sync scheduled");
        }
        Ok(Some(sched))
    }
}

fn render_brief(run: &SyncRunSummary) -> String {
    let sources = run
        .sources
        .iter()
        .map(|s| {
            format!(
                "- {} (`{}`): {} candidates, {} fragments skipped, {} of {} pages failed",
                s.display_name,
                s.source_id,
                s.candidates,
                s.fragments_skipped,
                s.pages_failed,
                s.pages_fetched + s.pages_failed
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Stagewatch Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Enabled sources: {}\n- Candidates extracted: {}\n- Dropped (missing company or title): {}\n- Dropped (implausible title): {}\n- Duplicates collapsed: {}\n- New listings: {}\n- Updated listings: {}\n- Preserved listings: {}\n- Dataset size: {} (last updated {})\n\n## Sources\n{}\n",
        run.run_id,
        run.started_at,
        run.finished_at,
        run.enabled_sources,
        run.candidates,
        run.dedup.missing_field,
        run.dedup.implausible_title,
        run.dedup.duplicates,
        run.merge.inserted,
        run.merge.replaced,
        run.merge.preserved,
        run.total_listings,
        run.last_updated,
        sources
    )
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

#[derive(Debug, Error)]
pub enum ManualAddError {
    #[error(transparent)]
    Invalid(#[from] MissingFieldError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualAddOutcome {
    pub listing: Listing,
    /// An existing record with the same identity key was overwritten.
    pub replaced: bool,
    pub total: usize,
}

/// Merge one hand-entered record into the stored dataset and save.
///
/// Only company and title are required; the title plausibility filter does not apply
/// here.
pub async fn add_manual_listing(
    store: &dyn DatasetStore,
    candidate: RawCandidate,
) -> Result<ManualAddOutcome, ManualAddError> {
    let listing = candidate.into_listing()?;
    let key = listing.identity();

    let old = store.load().await;
    let replaced = old.contains_key(&key);
    let saved = store.save(merge([listing.clone()], old)).await?;

    info!(key = %key, replaced, total = saved.len(), "manual listing saved");
    Ok(ManualAddOutcome {
        listing,
        replaced,
        total: saved.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub total: usize,
    pub last_updated: String,
    pub by_domain: Vec<CountEntry>,
    pub top_locations: Vec<CountEntry>,
}

impl DatasetStats {
    pub const TOP_LOCATIONS: usize = 10;

    pub fn from_dataset(dataset: &Dataset) -> Self {
        let mut top_locations = ranked_counts(dataset.iter().map(|l| l.location.as_str()));
        top_locations.truncate(Self::TOP_LOCATIONS);
        Self {
            total: dataset.len(),
            last_updated: dataset.last_updated().to_string(),
            by_domain: ranked_counts(dataset.iter().map(|l| l.domain.as_str())),
            top_locations,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec!["# Dataset statistics".to_string(), String::new()];
        lines.push(format!("- Listings: {}", self.total));
        if !self.last_updated.is_empty() {
            lines.push(format!("- Last updated: {}", self.last_updated));
        }
        if self.total == 0 {
            return lines.join("\n");
        }

        lines.push(String::new());
        lines.push("## By domain".to_string());
        lines.extend(self.by_domain.iter().map(|e| format!("- {}: {}", e.label, e.count)));
        lines.push(String::new());
        lines.push(format!("## Top {} locations", Self::TOP_LOCATIONS));
        lines.extend(self.top_locations.iter().map(|e| format!("- {}: {}", e.label, e.count)));
        lines.join("\n")
    }
}

/// Descending count, ties broken by label.
fn ranked_counts<'a>(values: impl Iterator<Item = &'a str>) -> Vec<CountEntry> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values {
        let label = match value.trim() {
            "" => UNSPECIFIED.to_string(),
            trimmed => trimmed.to_string(),
        };
        *counts.entry(label).or_default() += 1;
    }
    let mut ranked = counts
        .into_iter()
        .map(|(label, count)| CountEntry { label, count })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stagewatch_adapters::ExtractionError;
    use stagewatch_storage::MemoryDatasetStore;

    struct FakeExtractor {
        id: &'static str,
        candidates: Vec<RawCandidate>,
        pages_failed: usize,
    }

    #[async_trait]
    impl SourceExtractor for FakeExtractor {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn display_name(&self) -> &'static str {
            self.id
        }

        fn base_url(&self) -> &'static str {
            "https://fake.invalid"
        }

        fn search_url(&self, term: &str) -> String {
            format!("https://fake.invalid/?q={term}")
        }

        fn parse_listing_page(
            &self,
            _html: &str,
            _page_url: &str,
        ) -> Vec<Result<RawCandidate, ExtractionError>> {
            Vec::new()
        }

        async fn extract(
            &self,
            _http: &HttpFetcher,
            _ctx: &ExtractionContext,
            _terms: &[String],
            _per_page_limit: usize,
        ) -> ExtractedBatch {
            ExtractedBatch {
                source_id: self.id.to_string(),
                candidates: self.candidates.clone(),
                pages_failed: self.pages_failed,
                ..ExtractedBatch::default()
            }
        }
    }

    fn listing(company: &str, title: &str, location: &str) -> Listing {
        Listing {
            company: company.to_string(),
            title: title.to_string(),
            domain: "Finance".to_string(),
            location: location.to_string(),
            duration: "6 mois".to_string(),
            start_date: "Variable".to_string(),
            link: "https://example.ch".to_string(),
        }
    }

    fn fake_source(id: &'static str, candidates: Vec<RawCandidate>, pages_failed: usize) -> EnabledSource {
        EnabledSource {
            config: SourceConfig {
                source_id: id.to_string(),
                display_name: id.to_string(),
                enabled: true,
                search_terms: vec!["finance internship".to_string()],
                max_results_per_page: DEFAULT_RESULTS_PER_PAGE,
                notes: None,
            },
            extractor: Box::new(FakeExtractor {
                id,
                candidates,
                pages_failed,
            }),
        }
    }

    fn test_config(root: &Path) -> SyncConfig {
        SyncConfig {
            data_file: root.join("stages_data.json"),
            artifacts_dir: root.join("artifacts"),
            workspace_root: root.to_path_buf(),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn cron_list_splits_on_semicolons() {
        assert_eq!(
            parse_cron_list(" 0 0 7 * * Mon ; ;0 0 18 * * Thu"),
            vec!["0 0 7 * * Mon".to_string(), "0 0 18 * * Thu".to_string()]
        );
        assert_eq!(SyncConfig::default().sync_crons, vec![DEFAULT_SYNC_CRON.to_string()]);
    }

    #[test]
    fn registry_defaults_and_resolution() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: jobs-ch
    display_name: Jobs.ch
    enabled: true
    search_terms: ["finance internship zurich"]
  - source_id: indeed-ch
    display_name: Indeed CH
    enabled: false
  - source_id: monster-ch
    display_name: Monster
    enabled: true
"#,
        )
        .unwrap();
        assert_eq!(registry.sources[0].max_results_per_page, DEFAULT_RESULTS_PER_PAGE);
        assert!(registry.sources[1].search_terms.is_empty());

        let resolved = resolve_sources(registry);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].extractor.source_id(), "jobs-ch");
    }

    #[test]
    fn shipped_registry_resolves_every_source() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let text = std::fs::read_to_string(path).unwrap();
        let registry = SourceRegistry::from_yaml_str(&text).unwrap();
        let total = registry.sources.len();
        assert!(registry.sources.iter().all(|s| !s.search_terms.is_empty()));
        assert_eq!(resolve_sources(registry).len(), total);
    }

    #[tokio::test]
    async fn run_merges_new_batch_over_stored_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDatasetStore::with_dataset(Dataset::from_listings(
            "01 March 2026 - 07:00",
            vec![
                listing("UBS", "Finance Internship Zurich", "Zurich"),
                listing("Nestlé", "Stagiaire Contrôle de gestion", "Vevey"),
            ],
        )));
        let pipeline = SyncPipeline::with_store(test_config(dir.path()), store.clone()).unwrap();

        let sources = vec![
            fake_source(
                "jobs-ch",
                vec![
                    listing("ubs", "finance internship zurich", "Zürich").into(),
                    listing("Roche", "Praktikum Finance Controlling", "Basel").into(),
                ],
                0,
            ),
            fake_source(
                "indeed-ch",
                vec![
                    listing("Roche", "PRAKTIKUM FINANCE CONTROLLING", "Kaiseraugst").into(),
                    listing("Tiny", "Intern", "Bern").into(),
                    RawCandidate {
                        title: Some("Finance Trainee Programme".to_string()),
                        ..RawCandidate::default()
                    },
                ],
                0,
            ),
        ];

        let run = pipeline.run_sources(&sources).await.unwrap();
        assert_eq!(run.candidates, 5);
        assert_eq!(run.dedup.duplicates, 1);
        assert_eq!(run.dedup.implausible_title, 1);
        assert_eq!(run.dedup.missing_field, 1);
        assert_eq!(run.merge.inserted, 1);
        assert_eq!(run.merge.replaced, 1);
        assert_eq!(run.merge.preserved, 1);
        assert_eq!(run.total_listings, 3);

        let saved = store.snapshot().await;
        let locations = saved.iter().map(|l| l.location.as_str()).collect::<Vec<_>>();
        assert_eq!(locations, vec!["Zürich", "Basel", "Vevey"]);
        assert_ne!(saved.last_updated(), "01 March 2026 - 07:00");
        assert_eq!(store.save_count(), 1);

        let reports_dir = PathBuf::from(run.reports_dir.expect("reports written"));
        assert!(reports_dir.join("run_summary.json").exists());
        let brief = std::fs::read_to_string(reports_dir.join("brief.md")).unwrap();
        assert!(brief.contains("- New listings: 1"));
        assert!(brief.contains("(`indeed-ch`)"));
    }

    #[tokio::test]
    async fn unreachable_source_leaves_existing_listings_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let existing = Dataset::from_listings(
            "",
            vec![listing("Swiss Re", "Graduate Programme Finance", "Zurich")],
        );
        let store = Arc::new(MemoryDatasetStore::with_dataset(existing.clone()));
        let pipeline = SyncPipeline::with_store(test_config(dir.path()), store.clone()).unwrap();

        let run = pipeline
            .run_sources(&[fake_source("jobs-ch", Vec::new(), 3)])
            .await
            .unwrap();
        assert_eq!(run.sources[0].pages_failed, 3);
        assert_eq!(run.merge.preserved, 1);
        assert_eq!(store.snapshot().await.listings(), existing.listings());
    }

    #[tokio::test]
    async fn run_persists_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data_file = config.data_file.clone();
        let pipeline = SyncPipeline::new(config).unwrap();

        pipeline
            .run_sources(&[fake_source(
                "jobup-ch",
                vec![listing("Firmenich SA", "Stagiaire Comptabilité", "Genève").into()],
                0,
            )])
            .await
            .unwrap();

        let reloaded = JsonDatasetStore::new(&data_file).load().await;
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.listings()[0].location, "Genève");
    }

    #[tokio::test]
    async fn manual_add_overwrites_and_skips_plausibility_filter() {
        let store = MemoryDatasetStore::with_dataset(Dataset::from_listings(
            "",
            vec![listing("Acme", "CFO", "Zurich")],
        ));

        let outcome = add_manual_listing(&store, listing("ACME", "cfo", "Geneva").into())
            .await
            .unwrap();
        assert!(outcome.replaced);
        assert_eq!(outcome.total, 1);
        assert_eq!(store.snapshot().await.listings()[0].location, "Geneva");

        let outcome = add_manual_listing(
            &store,
            RawCandidate {
                company: Some("Initech".to_string()),
                title: Some("Risk Intern".to_string()),
                ..RawCandidate::default()
            },
        )
        .await
        .unwrap();
        assert!(!outcome.replaced);
        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.listing.domain, "");
    }

    #[tokio::test]
    async fn manual_add_without_title_is_rejected_before_saving() {
        let store = MemoryDatasetStore::new();
        let err = add_manual_listing(
            &store,
            RawCandidate {
                company: Some("Acme".to_string()),
                title: Some("   ".to_string()),
                ..RawCandidate::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ManualAddError::Invalid(_)));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn pipeline_add_lands_in_store_and_survives_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDatasetStore::new());
        let pipeline = SyncPipeline::with_store(test_config(dir.path()), store.clone()).unwrap();

        let outcome = pipeline
            .add_listing(listing("Lombard Odier", "Stage Private Banking", "Genève").into())
            .await
            .unwrap();
        assert!(!outcome.replaced);
        assert_eq!(outcome.total, 1);
        assert_eq!(store.save_count(), 1);

        let run = pipeline
            .run_sources(&[fake_source(
                "jobs-ch",
                vec![listing("UBS", "Finance Intern", "Zurich").into()],
                0,
            )])
            .await
            .unwrap();
        assert_eq!(run.merge.preserved, 1);
        let saved = store.snapshot().await;
        let companies = saved.iter().map(|l| l.company.as_str()).collect::<Vec<_>>();
        assert_eq!(companies, vec!["UBS", "Lombard Odier"]);
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(SyncPipeline::new(test_config(dir.path())).unwrap());
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }

    #[test]
    fn stats_rank_by_count_then_label() {
        let mut listings = vec![
            listing("A", "Finance Intern A", "Zurich"),
            listing("B", "Finance Intern B", "Geneva"),
            listing("C", "Finance Intern C", "Zurich"),
            listing("D", "Finance Intern D", "  "),
        ];
        listings[1].domain = "Risk Management".to_string();
        listings[3].domain = String::new();
        for i in 0..12 {
            listings.push(listing(&format!("Co{i}"), "Finance Intern X", &format!("Town {i:02}")));
        }

        let stats = DatasetStats::from_dataset(&Dataset::from_listings("", listings));
        assert_eq!(stats.total, 16);
        assert_eq!(stats.by_domain[0], CountEntry { label: "Finance".into(), count: 14 });
        assert_eq!(stats.by_domain[1].label, UNSPECIFIED);
        assert_eq!(stats.by_domain[2].label, "Risk Management");

        assert_eq!(stats.top_locations.len(), DatasetStats::TOP_LOCATIONS);
        assert_eq!(stats.top_locations[0], CountEntry { label: "Zurich".into(), count: 2 });
        assert_eq!(stats.top_locations[1].label, "Geneva");
        assert_eq!(stats.top_locations[2].label, UNSPECIFIED);

        let markdown = stats.to_markdown();
        assert!(markdown.contains("- Finance: 14"));
        assert!(markdown.contains("## Top 10 locations"));
    }

    #[test]
    fn empty_stats_render_without_sections() {
        let markdown = DatasetStats::from_dataset(&Dataset::new()).to_markdown();
        assert!(markdown.contains("- Listings: 0"));
        assert!(!markdown.contains("## By domain"));
    }
}
