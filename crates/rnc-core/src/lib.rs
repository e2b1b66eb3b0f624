//! Core domain model for RNC: canonical news records, natural keys and date grouping.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rnc-core";

/// Keys every persisted record must carry. `imagem` is optional and not listed.
pub const REQUIRED_FIELDS: [&str; 6] = ["id", "titulo", "conteudo", "fonte", "data", "url"];

/// Source label used when a feed descriptor has no `fonte`.
pub const DEFAULT_SOURCE: &str = "Desconhecida";

/// Calendar date format used for `data` and for partition file names.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One entry of the configured feed list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedDescriptor {
    #[serde(default)]
    pub fonte: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl FeedDescriptor {
    pub fn new(fonte: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            fonte: Some(fonte.into()),
            url: Some(url.into()),
        }
    }

    pub fn source_name(&self) -> &str {
        self.fonte.as_deref().unwrap_or(DEFAULT_SOURCE)
    }

    /// The trimmed feed location, or `None` when it is missing or blank.
    pub fn location(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Broken-down timestamp as reported by the feed parser.
///
/// The parts are taken at face value: no timezone is attached and no
/// conversion is ever applied before deriving a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeParts {
    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    /// `None` when the parts do not form a real date and time of day.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, self.day)?;
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, self.second)?;
        Some(date.and_time(time))
    }
}

/// Parsed feed entry handed from the feed parser to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawEntry {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub published: Option<TimeParts>,
    pub updated: Option<TimeParts>,
}

/// Canonical persisted news item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsRecord {
    pub id: String,
    pub titulo: String,
    pub conteudo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imagem: Option<String>,
    pub fonte: String,
    pub data: String,
    pub url: String,
}

impl NewsRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.titulo, &self.fonte, &self.data)
    }

    pub fn to_json(&self) -> serde_json::Result<JsonValue> {
        serde_json::to_value(self)
    }
}

pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Duplicate identity of a news item, independent of `id`, `url` and body.
///
/// Normalization: the title is trimmed then lowercased, the source is trimmed,
/// the date is compared exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    title: String,
    source: String,
    date: String,
}

impl NaturalKey {
    pub fn new(title: &str, source: &str, date: &str) -> Self {
        Self {
            title: title.trim().to_lowercase(),
            source: source.trim().to_string(),
            date: date.to_string(),
        }
    }

    /// Key of an untyped stored record. Missing or non-string fields count as
    /// empty strings; values that are not objects have no key.
    pub fn of_value(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |name: &str| obj.get(name).and_then(JsonValue::as_str).unwrap_or("");
        Some(Self::new(field("titulo"), field("fonte"), field("data")))
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn date(&self) -> &str {
        &self.date
    }
}

/// Partition records by `data`, keeping arrival order inside each date.
pub fn group_by_date(
    records: impl IntoIterator<Item = NewsRecord>,
) -> BTreeMap<String, Vec<NewsRecord>> {
    let mut groups: BTreeMap<String, Vec<NewsRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.data.clone()).or_default().push(record);
    }
    groups
}

/// Pretty JSON as written to partition files: two-space indent, non-ASCII kept literal.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}
