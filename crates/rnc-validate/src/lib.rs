//! Structural validation and repair of stored partition files.
//!
//! Each `.json` file in a directory is parsed (with a single trailing-comma
//! repair attempt), checked to be an array, stripped of non-object elements,
//! backfilled with the required record keys and rewritten. Nothing here
//! deduplicates; it only fixes shape.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rnc_core::{new_record_id, to_pretty_json, REQUIRED_FIELDS};
use rnc_storage::write_atomic;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "rnc-validate";

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("listing {}: {source}", .path.display())]
    ListDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid JSON in {} (before repair: {first_error}; after repair: {source})", .path.display())]
    Unrepairable {
        path: PathBuf,
        first_error: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} does not hold a JSON array", .path.display())]
    NotAnArray { path: PathBuf },
    #[error("serializing {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairEvent {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl RepairEvent {
    pub fn to_line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.severity.label(),
            self.message
        )
    }
}

/// Reporter for repair events, constructed once per run by the caller.
///
/// Every event goes to `tracing`; with a sink it is also appended as one
/// timestamped line to the log file. Call [`RepairLog::flush`] when done.
#[derive(Debug)]
pub struct RepairLog {
    sink: Option<(PathBuf, BufWriter<File>)>,
    events: Vec<RepairEvent>,
}

impl RepairLog {
    /// Append to `path`, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening repair log {}", path.display()))?;
        Ok(Self {
            sink: Some((path, BufWriter::new(file))),
            events: Vec::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            sink: None,
            events: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn events(&self) -> &[RepairEvent] {
        &self.events
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(Severity::Warning, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(Severity::Error, message.into());
    }

    fn record(&mut self, severity: Severity, message: String) {
        match severity {
            Severity::Warning => warn!(target: "rnc_validate::repair", "{message}"),
            Severity::Error => error!(target: "rnc_validate::repair", "{message}"),
        }
        let event = RepairEvent {
            at: Utc::now(),
            severity,
            message,
        };
        if let Some((path, writer)) = &mut self.sink {
            if let Err(err) = writeln!(writer, "{}", event.to_line()) {
                error!(path = %path.display(), error = %err, "failed to append to repair log");
            }
        }
        self.events.push(event);
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Some((_, writer)) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Drop commas (and the whitespace after them) that directly precede a
/// closing `}` or `]`. String contents are never touched.
pub fn repair_trailing_commas(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let mut cuts: Vec<Range<usize>> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &byte) in bytes.iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b',' => {
                let rest = &bytes[i + 1..];
                if let Some(offset) = rest.iter().position(|b| !b.is_ascii_whitespace()) {
                    if matches!(rest[offset], b'}' | b']') {
                        cuts.push(i..i + 1 + offset);
                    }
                }
            }
            _ => {}
        }
    }

    if cuts.is_empty() {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for cut in cuts {
        out.push_str(&text[last..cut.start]);
        last = cut.end;
    }
    out.push_str(&text[last..]);
    Cow::Owned(out)
}

/// Strict parse, then one retry after [`repair_trailing_commas`].
/// The flag is true when the repair was needed.
pub fn parse_with_repair(text: &str, path: &Path) -> Result<(JsonValue, bool), ValidateError> {
    match serde_json::from_str(text) {
        Ok(value) => Ok((value, false)),
        Err(first) => {
            let repaired = repair_trailing_commas(text);
            serde_json::from_str(&repaired)
                .map(|value| (value, true))
                .map_err(|source| ValidateError::Unrepairable {
                    path: path.to_path_buf(),
                    first_error: first.to_string(),
                    source,
                })
        }
    }
}

/// Insert any missing required key; `id` gets a fresh identifier, the rest `""`.
/// Returns the number of keys added.
pub fn backfill_record(
    record: &mut Map<String, JsonValue>,
    position: usize,
    path: &Path,
    log: &mut RepairLog,
) -> usize {
    let mut added = 0;
    for key in REQUIRED_FIELDS {
        if record.contains_key(key) {
            continue;
        }
        let value = if key == "id" {
            new_record_id()
        } else {
            String::new()
        };
        record.insert(key.to_string(), JsonValue::String(value));
        log.warn(format!(
            "missing key '{key}' in item {position} of {}",
            path.display()
        ));
        added += 1;
    }
    added
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecords {
    pub records: Vec<JsonValue>,
    pub dropped: usize,
    pub backfilled: usize,
}

pub fn validate_records(
    value: JsonValue,
    path: &Path,
    log: &mut RepairLog,
) -> Result<ValidatedRecords, ValidateError> {
    let JsonValue::Array(items) = value else {
        return Err(ValidateError::NotAnArray {
            path: path.to_path_buf(),
        });
    };

    let mut out = ValidatedRecords {
        records: Vec::with_capacity(items.len()),
        dropped: 0,
        backfilled: 0,
    };
    for (position, item) in items.into_iter().enumerate() {
        match item {
            JsonValue::Object(mut record) => {
                out.backfilled += backfill_record(&mut record, position, path, log);
                out.records.push(JsonValue::Object(record));
            }
            _ => {
                log.error(format!(
                    "item {position} in {} is not an object; dropped",
                    path.display()
                ));
                out.dropped += 1;
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub repaired_syntax: bool,
    pub kept: usize,
    pub dropped: usize,
    pub backfilled: usize,
}

impl FileReport {
    pub fn changed(&self) -> bool {
        self.repaired_syntax || self.dropped > 0 || self.backfilled > 0
    }
}

/// Validate one file and replace it atomically. A symlinked partition is
/// rewritten at its target so the link survives.
pub fn process_file(path: &Path, log: &mut RepairLog) -> Result<FileReport, ValidateError> {
    let read_err = |source| ValidateError::Read {
        path: path.to_path_buf(),
        source,
    };
    let target = fs::canonicalize(path).map_err(read_err)?;
    let text = fs::read_to_string(&target).map_err(read_err)?;
    let (value, repaired_syntax) = parse_with_repair(&text, path)?;
    if repaired_syntax {
        log.warn(format!("removed trailing commas in {}", path.display()));
    }

    let validated = validate_records(value, path, log)?;
    let output = to_pretty_json(&validated.records).map_err(|source| ValidateError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(&target, output.as_bytes()).map_err(|source| ValidateError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(FileReport {
        path: path.to_path_buf(),
        repaired_syntax,
        kept: validated.records.len(),
        dropped: validated.dropped,
        backfilled: validated.backfilled,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub files: Vec<FileReport>,
    pub failed: Vec<FileFailure>,
}

impl ValidationSummary {
    pub fn scanned(&self) -> usize {
        self.files.len() + self.failed.len()
    }

    pub fn repaired(&self) -> usize {
        self.files.iter().filter(|f| f.changed()).count()
    }

    pub fn dropped(&self) -> usize {
        self.files.iter().map(|f| f.dropped).sum()
    }

    pub fn backfilled(&self) -> usize {
        self.files.iter().map(|f| f.backfilled).sum()
    }
}

/// `.json` files (case-insensitive) directly under `dir`, in lexical order.
/// Symlinks to files are included.
pub fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>, ValidateError> {
    let entries = fs::read_dir(dir).map_err(|source| ValidateError::ListDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_ascii_lowercase().ends_with(".json"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

/// Validate every partition file in `dir`; one bad file does not stop the rest.
pub fn validate_dir(dir: &Path, log: &mut RepairLog) -> Result<ValidationSummary, ValidateError> {
    if !dir.is_dir() {
        return Err(ValidateError::DirectoryNotFound(dir.to_path_buf()));
    }

    let mut summary = ValidationSummary::default();
    for path in list_json_files(dir)? {
        match process_file(&path, log) {
            Ok(report) => summary.files.push(report),
            Err(err) => {
                log.error(format!("could not validate {}: {err}", path.display()));
                summary.failed.push(FileFailure {
                    path,
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        dir = %dir.display(),
        scanned = summary.scanned(),
        repaired = summary.repaired(),
        failed = summary.failed.len(),
        "partition files validated"
    );
    Ok(summary)
}
