// src/ingest/mod.rs
//! The scrape pipeline: fetch every active source with bounded concurrency,
//! then dedup → classify → insert each item sequentially in feed order.

pub mod fetch;
pub mod scheduler;
pub mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::classify::ClassifierHandle;
use crate::dedup;
use crate::ingest::fetch::Fetcher;
use crate::ingest::types::RawItem;
use crate::registry::{FetchOutcome, Source, SourceRegistry};
use crate::store::{NewArticle, Store, StoreError};

/// Stored summaries are capped; feeds occasionally ship whole articles in
/// the description element.
const SUMMARY_MAX_CHARS: usize = 500;

/// One-time metrics registration (so series show up with descriptions).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Total entries parsed from feeds.");
        describe_counter!("ingest_kept_total", "Articles inserted into the store.");
        describe_counter!(
            "ingest_dedup_total",
            "Items dropped as duplicates (pre-check or unique constraint)."
        );
        describe_counter!(
            "ingest_source_errors_total",
            "Source fetches that failed after retry handling."
        );
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when a scrape cycle last completed."
        );
    });
}

/// Normalize text: decode HTML entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // Typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out.trim().to_string()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Process-lifetime counters surfaced by `/health`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    duplicates: AtomicU64,
    uncategorized: AtomicU64,
}

impl PipelineStats {
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn uncategorized(&self) -> u64 {
        self.uncategorized.load(Ordering::Relaxed)
    }
}

/// Aggregate result of one scrape cycle.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CycleReport {
    pub sources_processed: usize,
    pub sources_failed: usize,
    pub items_fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub item_errors: usize,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Default)]
struct SourceReport {
    fetched: usize,
    inserted: usize,
    duplicates: usize,
    item_errors: usize,
    failed: bool,
}

pub struct Pipeline {
    store: Arc<Store>,
    registry: Arc<SourceRegistry>,
    classifier: ClassifierHandle,
    fetcher: Arc<Fetcher>,
    concurrency: usize,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<SourceRegistry>,
        classifier: ClassifierHandle,
        fetcher: Fetcher,
        concurrency: usize,
    ) -> Self {
        ensure_metrics_described();
        Self {
            store,
            registry,
            classifier,
            fetcher: Arc::new(fetcher),
            concurrency: concurrency.max(1),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Run one cycle over the currently active sources. Individual source
    /// failures are recorded and never fail the cycle.
    pub async fn run_cycle(&self, primary_only: bool) -> CycleReport {
        let sources = match self.registry.list_active_sources(primary_only).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = ?e, "listing sources failed; skipping cycle");
                return CycleReport {
                    finished_at: Some(chrono::Utc::now()),
                    ..Default::default()
                };
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<SourceReport> = JoinSet::new();

        for source in sources {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let registry = self.registry.clone();
            let classifier = self.classifier.clone();
            let fetcher = self.fetcher.clone();
            let stats = self.stats.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                process_source(&source, &fetcher, &store, &registry, &classifier, &stats)
                    .await
            });
        }

        let mut report = CycleReport::default();
        while let Some(res) = join_set.join_next().await {
            let Ok(sr) = res else {
                report.sources_failed += 1;
                continue;
            };
            report.sources_processed += 1;
            report.items_fetched += sr.fetched;
            report.inserted += sr.inserted;
            report.duplicates += sr.duplicates;
            report.item_errors += sr.item_errors;
            if sr.failed {
                report.sources_failed += 1;
            }
        }

        report.finished_at = Some(chrono::Utc::now());
        gauge!("ingest_pipeline_last_run_ts")
            .set(chrono::Utc::now().timestamp().max(0) as f64);
        tracing::info!(
            target: "ingest",
            sources = report.sources_processed,
            failed = report.sources_failed,
            fetched = report.items_fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "cycle complete"
        );
        report
    }
}

/// Fetch one source and run its items through dedup → classify → insert,
/// sequentially and in feed order.
async fn process_source(
    source: &Source,
    fetcher: &Fetcher,
    store: &Store,
    registry: &SourceRegistry,
    classifier: &ClassifierHandle,
    stats: &PipelineStats,
) -> SourceReport {
    let mut report = SourceReport::default();

    let items = match fetcher.fetch(source).await {
        Ok(items) => items,
        Err(err) => {
            counter!("ingest_source_errors_total").increment(1);
            tracing::warn!(
                target: "ingest",
                source = %source.name,
                error = %err,
                permanent = err.is_permanent(),
                "source fetch failed"
            );
            let outcome = FetchOutcome::Failure {
                permanent: err.is_permanent(),
            };
            if let Err(e) = registry.record_result(&source.url, outcome).await {
                tracing::error!(error = ?e, source = %source.name, "recording failure");
            }
            report.failed = true;
            return report;
        }
    };

    report.fetched = items.len();
    for item in &items {
        match ingest_item(item, store, classifier, stats).await {
            Ok(IngestResult::Inserted) => report.inserted += 1,
            Ok(IngestResult::Duplicate) => report.duplicates += 1,
            Err(e) => {
                // Fatal for this item only; the next cycle retries it.
                report.item_errors += 1;
                tracing::warn!(target: "ingest", error = ?e, link = %item.link, "item insert failed");
            }
        }
    }

    if let Err(e) = registry.record_result(&source.url, FetchOutcome::Success).await {
        tracing::error!(error = ?e, source = %source.name, "recording success");
    }

    counter!("ingest_kept_total").increment(report.inserted as u64);
    counter!("ingest_dedup_total").increment(report.duplicates as u64);
    tracing::debug!(
        target: "ingest",
        source = %source.name,
        fetched = report.fetched,
        inserted = report.inserted,
        duplicates = report.duplicates,
        "source done"
    );
    report
}

enum IngestResult {
    Inserted,
    Duplicate,
}

async fn ingest_item(
    item: &RawItem,
    store: &Store,
    classifier: &ClassifierHandle,
    stats: &PipelineStats,
) -> Result<IngestResult, StoreError> {
    let content_hash = dedup::content_hash(&item.link, &item.title);

    // Cheap pre-check; the unique constraint below is the real guarantee.
    if store.contains_hash(&content_hash).await? {
        stats.duplicates.fetch_add(1, Ordering::Relaxed);
        return Ok(IngestResult::Duplicate);
    }

    let classification = classifier.classify(item);
    if classification.fallback {
        stats.uncategorized.fetch_add(1, Ordering::Relaxed);
    }

    let article = NewArticle {
        title: item.title.clone(),
        summary: truncate_chars(&item.summary, SUMMARY_MAX_CHARS),
        url: item.link.clone(),
        source: item.source.clone(),
        published: item.published,
        category: classification.category,
        subcategory: classification.subcategory,
        tags: classification.tags,
        content_hash,
    };

    match store.insert(&article).await {
        Ok(_) => Ok(IngestResult::Inserted),
        Err(StoreError::DuplicateKey) => {
            // Raced with a concurrent insert of the same hash; expected.
            stats.duplicates.fetch_add(1, Ordering::Relaxed);
            Ok(IngestResult::Duplicate)
        }
        Err(e) => Err(e),
    }
}
