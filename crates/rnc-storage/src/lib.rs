//! Date-partitioned news storage with natural-key dedup, plus the blocking feed fetcher.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use rnc_core::{to_pretty_json, NaturalKey, NewsRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rnc-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating storage directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing partition {date}: {source}")]
    Serialize {
        date: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing partition {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What was found on disk for a partition before merging.
#[derive(Debug, Clone, PartialEq)]
pub enum ExistingContent {
    Missing,
    Loaded(Vec<JsonValue>),
    /// Unreadable, unparsable or not an array; treated as empty.
    Discarded { reason: String },
}

impl ExistingContent {
    fn into_records(self) -> Vec<JsonValue> {
        match self {
            Self::Loaded(records) => records,
            Self::Missing | Self::Discarded { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<JsonValue>,
    pub existing: usize,
    pub admitted: usize,
    pub duplicates: usize,
}

/// Append the incoming records whose natural key is not already present.
///
/// Existing records are kept verbatim and first; a key seen on disk or earlier
/// in `incoming` wins over any later record with the same key.
pub fn merge_records(
    existing: Vec<JsonValue>,
    incoming: &[NewsRecord],
) -> serde_json::Result<MergeOutcome> {
    let mut seen: HashSet<NaturalKey> = existing.iter().filter_map(NaturalKey::of_value).collect();
    let existing_count = existing.len();
    let mut records = existing;
    let mut admitted = 0usize;
    let mut duplicates = 0usize;

    for record in incoming {
        if seen.insert(record.natural_key()) {
            records.push(record.to_json()?);
            admitted += 1;
        } else {
            duplicates += 1;
        }
    }

    Ok(MergeOutcome {
        records,
        existing: existing_count,
        admitted,
        duplicates,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWrite {
    pub date: String,
    pub path: PathBuf,
    pub existing: usize,
    pub admitted: usize,
    pub duplicates: usize,
    pub discarded_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub date: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub written: Vec<PartitionWrite>,
    pub failed: Vec<PartitionFailure>,
}

impl SaveSummary {
    pub fn admitted(&self) -> usize {
        self.written.iter().map(|w| w.admitted).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.written.iter().map(|w| w.duplicates).sum()
    }
}

/// One JSON array file per publication date under `root`.
///
/// Writes are read-merge-write of the whole file with no locking; callers
/// must not run two collections against the same directory at once.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, date: &str) -> PathBuf {
        self.root.join(format!("{date}.json"))
    }

    pub fn read_existing(&self, path: &Path) -> ExistingContent {
        if !path.exists() {
            return ExistingContent::Missing;
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                return ExistingContent::Discarded {
                    reason: format!("reading {}: {err}", path.display()),
                }
            }
        };
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(JsonValue::Array(records)) => ExistingContent::Loaded(records),
            Ok(_) => ExistingContent::Discarded {
                reason: format!("{} does not hold a JSON array", path.display()),
            },
            Err(err) => ExistingContent::Discarded {
                reason: format!("parsing {}: {err}", path.display()),
            },
        }
    }

    /// Merge `records` into the partition file for `date` and rewrite it.
    pub fn merge_partition(
        &self,
        date: &str,
        records: &[NewsRecord],
    ) -> Result<PartitionWrite, StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        let path = self.partition_path(date);
        let existing = self.read_existing(&path);
        let discarded_existing = matches!(existing, ExistingContent::Discarded { .. });
        if let ExistingContent::Discarded { reason } = &existing {
            warn!(date, path = %path.display(), reason, "discarding unreadable partition content");
        }

        let outcome = merge_records(existing.into_records(), records).map_err(|source| {
            StoreError::Serialize {
                date: date.to_string(),
                source,
            }
        })?;
        let text = to_pretty_json(&outcome.records).map_err(|source| StoreError::Serialize {
            date: date.to_string(),
            source,
        })?;
        write_atomic(&path, text.as_bytes()).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(
            date,
            existing = outcome.existing,
            admitted = outcome.admitted,
            duplicates = outcome.duplicates,
            "partition merged"
        );

        Ok(PartitionWrite {
            date: date.to_string(),
            path,
            existing: outcome.existing,
            admitted: outcome.admitted,
            duplicates: outcome.duplicates,
            discarded_existing,
        })
    }

    /// Merge every date group; a failing partition does not stop the others.
    pub fn save_groups(&self, groups: &BTreeMap<String, Vec<NewsRecord>>) -> SaveSummary {
        let mut summary = SaveSummary::default();
        for (date, records) in groups {
            match self.merge_partition(date, records) {
                Ok(write) => summary.written.push(write),
                Err(err) => {
                    error!(date = date.as_str(), error = %err, "failed to save partition");
                    summary.failed.push(PartitionFailure {
                        date: date.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            partitions = summary.written.len(),
            failed = summary.failed.len(),
            admitted = summary.admitted(),
            duplicates = summary.duplicates(),
            "news partitions saved"
        );
        summary
    }
}

/// Replace `path` with `bytes` through a temp file and rename in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{name}.{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let written = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt blocking fetcher. The timeout bounds every request.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let resp = self.client.get(url).send()?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes()?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "feed fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnc_core::{group_by_date, new_record_id};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(titulo: &str, fonte: &str, data: &str, conteudo: &str) -> NewsRecord {
        NewsRecord {
            id: new_record_id(),
            titulo: titulo.to_string(),
            conteudo: conteudo.to_string(),
            imagem: Some(String::new()),
            fonte: fonte.to_string(),
            data: data.to_string(),
            url: format!("https://news.example/{}", titulo.len()),
        }
    }

    fn read_array(path: &Path) -> Vec<JsonValue> {
        let text = fs::read_to_string(path).expect("read partition");
        serde_json::from_str(&text).expect("parse partition")
    }

    #[test]
    fn existing_record_wins_over_new_with_same_key() {
        let existing = vec![json!({
            "id": "old-id",
            "titulo": "Sismo atinge capital",
            "conteudo": "versão original",
            "fonte": "Agência X",
            "data": "2024-03-01",
            "url": ""
        })];
        let incoming = vec![record(
            "  SISMO ATINGE CAPITAL",
            "Agência X ",
            "2024-03-01",
            "versão nova",
        )];

        let outcome = merge_records(existing.clone(), &incoming).unwrap();
        assert_eq!(outcome.records, existing);
        assert_eq!(outcome.admitted, 0);
        assert_eq!(outcome.duplicates, 1);
    }

    #[test]
    fn same_batch_duplicates_collapse_to_first() {
        let incoming = vec![
            record("Chuva forte", "G1", "2024-01-01", "primeiro"),
            record("chuva forte", "G1", "2024-01-01", "segundo"),
            record("Chuva forte", "Folha", "2024-01-01", "outra fonte"),
        ];
        let outcome = merge_records(Vec::new(), &incoming).unwrap();
        assert_eq!(outcome.admitted, 2);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.records[0]["conteudo"], "primeiro");
        assert_eq!(outcome.records[1]["fonte"], "Folha");
    }

    #[test]
    fn non_object_existing_elements_are_kept_verbatim() {
        let existing = vec![json!("stray"), json!({"titulo": "A", "fonte": "F", "data": "2024-01-01"})];
        let incoming = vec![record("a", "F", "2024-01-01", "dup"), record("b", "F", "2024-01-01", "new")];
        let outcome = merge_records(existing, &incoming).unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[0], json!("stray"));
        assert_eq!(outcome.records[2]["titulo"], "b");
    }

    #[test]
    fn merging_twice_is_idempotent_on_disk() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path().join("news"));
        let batch = vec![
            record("Um", "F", "2024-05-05", "1"),
            record("Dois", "F", "2024-05-05", "2"),
        ];

        let first = store.merge_partition("2024-05-05", &batch).unwrap();
        assert_eq!(first.admitted, 2);
        let after_first = read_array(&first.path);

        let second = store.merge_partition("2024-05-05", &batch).unwrap();
        assert_eq!(second.admitted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(read_array(&second.path), after_first);
    }

    #[test]
    fn corrupt_partition_is_discarded_and_rewritten() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let path = store.partition_path("2024-02-02");
        fs::write(&path, "{ not json").unwrap();

        let write = store
            .merge_partition("2024-02-02", &[record("Novo", "F", "2024-02-02", "x")])
            .unwrap();
        assert!(write.discarded_existing);
        assert_eq!(write.existing, 0);
        assert_eq!(read_array(&path).len(), 1);

        fs::write(&path, r#"{"titulo": "not an array"}"#).unwrap();
        assert!(matches!(
            store.read_existing(&path),
            ExistingContent::Discarded { .. }
        ));
    }

    #[test]
    fn existing_field_order_and_extra_fields_survive_rewrite() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let path = store.partition_path("2024-07-07");
        let original = r#"[{"url": "u", "data": "2024-07-07", "titulo": "Z", "extra": [1, 2], "fonte": "F", "id": "1", "conteudo": "c"}]"#;
        fs::write(&path, original).unwrap();

        store
            .merge_partition("2024-07-07", &[record("Outro", "F", "2024-07-07", "x")])
            .unwrap();
        let records = read_array(&path);
        let keys: Vec<_> = records[0].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["url", "data", "titulo", "extra", "fonte", "id", "conteudo"]);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  {"));
    }

    #[test]
    fn save_groups_writes_one_file_per_date() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path().join("nested").join("news"));
        let groups = group_by_date(vec![
            record("a", "F", "2024-01-01", "x"),
            record("b", "F", "2024-01-02", "y"),
        ]);

        let summary = store.save_groups(&groups);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.admitted(), 2);
        let day_one = read_array(&store.partition_path("2024-01-01"));
        let day_two = read_array(&store.partition_path("2024-01-02"));
        assert!(day_one.iter().all(|r| r["data"] == "2024-01-01"));
        assert!(day_two.iter().all(|r| r["data"] == "2024-01-02"));
    }

    #[test]
    fn failed_partition_does_not_block_siblings() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        // A directory squatting on the partition path makes the rename fail.
        fs::create_dir_all(store.partition_path("2024-01-01")).unwrap();
        let groups = group_by_date(vec![
            record("a", "F", "2024-01-01", "x"),
            record("b", "F", "2024-01-02", "y"),
        ]);

        let summary = store.save_groups(&groups);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].date, "2024-01-01");
        assert_eq!(summary.written.len(), 1);
        assert!(store.partition_path("2024-01-02").is_file());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("2024-01-01.json");
        write_atomic(&path, b"[]").unwrap();
        write_atomic(&path, b"[1]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]");
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
