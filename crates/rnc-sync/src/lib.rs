//! Collection pipeline: feed list, per-feed isolation, grouping and merge-on-write.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rnc_adapters::{
    normalize_entries, FeedSource, HttpFeedSource, NormalizeContext, NormalizerVariant,
};
use rnc_core::{group_by_date, FeedDescriptor, NewsRecord};
use rnc_storage::{HttpClientConfig, HttpFetcher, PartitionStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rnc-sync";

/// Problems with the feed list. Fatal to a collection run, raised before any fetch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading feed list {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing feed list {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("feed list {} is empty", .path.display())]
    Empty { path: PathBuf },
}

pub fn load_feed_list(path: &Path) -> Result<Vec<FeedDescriptor>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let feeds: Vec<FeedDescriptor> =
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if feeds.is_empty() {
        return Err(ConfigError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(feeds)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feeds_path: PathBuf,
    pub news_dir: PathBuf,
    pub repair_log: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub variant: NormalizerVariant,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            feeds_path: std::env::var("RNC_FEEDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rss_feeds.json")),
            news_dir: std::env::var("RNC_NEWS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/news")),
            repair_log: std::env::var("RNC_REPAIR_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/logs/jsons_bugs.log")),
            user_agent: std::env::var("RNC_USER_AGENT")
                .unwrap_or_else(|_| "rnc-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("RNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            variant: match std::env::var("RNC_WITH_IMAGES").as_deref() {
                Ok("0" | "false" | "FALSE" | "False") => NormalizerVariant::Plain,
                _ => NormalizerVariant::WithImage,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Collected,
    Empty,
    SkippedNoUrl,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedReport {
    pub fonte: String,
    pub url: Option<String>,
    pub status: FeedStatus,
    pub records: usize,
    pub skipped_entries: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
    pub collected: usize,
    pub skipped_entries: usize,
    pub partitions_written: usize,
    pub partitions_failed: usize,
    pub admitted: usize,
    pub duplicates: usize,
}

impl SyncRunSummary {
    pub fn failed_feeds(&self) -> usize {
        self.feeds
            .iter()
            .filter(|f| f.status == FeedStatus::Failed)
            .count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn FeedSource>,
    store: PartitionStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let store = PartitionStore::new(config.news_dir.clone());
        Ok(Self {
            config,
            source: Box::new(HttpFeedSource::new(http)),
            store,
        })
    }

    pub fn with_source(mut self, source: Box<dyn FeedSource>) -> Self {
        self.source = source;
        self
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn run_once(&self) -> Result<SyncRunSummary, ConfigError> {
        self.run_once_with(NormalizeContext::today(self.config.variant))
    }

    pub fn run_once_with(&self, ctx: NormalizeContext) -> Result<SyncRunSummary, ConfigError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("collect_run", %run_id);
        let _guard = span.enter();

        let feeds = load_feed_list(&self.config.feeds_path)?;
        info!(feeds = feeds.len(), "feed list loaded");

        let mut records = Vec::new();
        let mut reports = Vec::with_capacity(feeds.len());
        for feed in &feeds {
            let (feed_records, report) = self.collect_feed(feed, &ctx);
            records.extend(feed_records);
            reports.push(report);
        }

        let collected = records.len();
        let skipped_entries = reports.iter().map(|r| r.skipped_entries).sum();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            feeds: reports,
            collected,
            skipped_entries,
            partitions_written: 0,
            partitions_failed: 0,
            admitted: 0,
            duplicates: 0,
        };

        if records.is_empty() {
            warn!("no news collected from any feed");
        } else {
            let groups = group_by_date(records);
            let saved = self.store.save_groups(&groups);
            summary.partitions_written = saved.written.len();
            summary.partitions_failed = saved.failed.len();
            summary.admitted = saved.admitted();
            summary.duplicates = saved.duplicates();
        }

        summary.finished_at = Utc::now();
        info!(
            collected = summary.collected,
            admitted = summary.admitted,
            duplicates = summary.duplicates,
            failed_feeds = summary.failed_feeds(),
            "collection finished"
        );
        Ok(summary)
    }

    /// Fetch and normalize one feed. Failures are logged and reported, never raised.
    pub fn collect_feed(
        &self,
        feed: &FeedDescriptor,
        ctx: &NormalizeContext,
    ) -> (Vec<NewsRecord>, FeedReport) {
        let fonte = feed.source_name();
        let mut report = FeedReport {
            fonte: fonte.to_string(),
            url: feed.location().map(ToString::to_string),
            status: FeedStatus::SkippedNoUrl,
            records: 0,
            skipped_entries: 0,
            error: None,
        };

        let Some(location) = feed.location() else {
            warn!(fonte, "feed has no url; skipping");
            return (Vec::new(), report);
        };

        let entries = match self.source.fetch_entries(location) {
            Ok(entries) => entries,
            Err(err) => {
                error!(fonte, url = location, error = %err, "failed to process feed");
                report.status = FeedStatus::Failed;
                report.error = Some(err.to_string());
                return (Vec::new(), report);
            }
        };

        let batch = normalize_entries(&entries, fonte, ctx);
        report.records = batch.records.len();
        report.skipped_entries = batch.skipped;
        report.status = if batch.records.is_empty() {
            warn!(fonte, url = location, "no news collected for feed");
            FeedStatus::Empty
        } else {
            FeedStatus::Collected
        };
        (batch.records, report)
    }
}
