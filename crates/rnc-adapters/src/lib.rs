//! Feed source contracts, feed-rs entry mapping and the content normalizer.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use rnc_core::{format_date, new_record_id, NewsRecord, RawEntry, TimeParts};
use rnc_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "rnc-adapters";

/// Title used when an entry has none.
pub const UNTITLED: &str = "Sem título";

/// Body used by the plain variant when an entry has neither summary nor description.
pub const NO_CONTENT: &str = "Sem conteúdo";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parsing feed {location}: {source}")]
    Parse {
        location: String,
        #[source]
        source: feed_rs::parser::ParseFeedError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{field} time parts do not form a valid date: {parts:?}")]
    InvalidDate {
        field: &'static str,
        parts: TimeParts,
    },
    #[error("html selector: {0}")]
    Selector(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizerVariant {
    /// Extracts the first `<img>` into `imagem`; missing body becomes `""`.
    #[default]
    WithImage,
    /// No `imagem` field; missing body becomes [`NO_CONTENT`].
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeContext {
    /// Date used for entries without any structured timestamp.
    pub processed_on: NaiveDate,
    pub variant: NormalizerVariant,
}

impl NormalizeContext {
    pub fn today(variant: NormalizerVariant) -> Self {
        Self {
            processed_on: Local::now().date_naive(),
            variant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedContent {
    pub image_url: String,
    pub text: String,
}

/// True when `text` contains something that starts a tag, comment or doctype.
pub fn looks_like_markup(text: &str) -> bool {
    text.as_bytes()
        .windows(2)
        .any(|pair| pair[0] == b'<' && (pair[1].is_ascii_alphabetic() || matches!(pair[1], b'/' | b'!')))
}

fn fragment_text(fragment: &Html) -> String {
    fragment
        .root_element()
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plain text of an HTML snippet; text that is not markup is only trimmed.
pub fn strip_html(text: &str) -> String {
    if !looks_like_markup(text) {
        return text.trim().to_string();
    }
    fragment_text(&Html::parse_fragment(text))
}

/// Split an HTML body into the first image URL and its plain text.
pub fn extract_content(html: &str) -> Result<ExtractedContent, NormalizeError> {
    let fragment = Html::parse_fragment(html);
    let img = Selector::parse("img").map_err(|e| NormalizeError::Selector(e.to_string()))?;
    let image_url = fragment
        .select(&img)
        .next()
        .and_then(|n| n.value().attr("src"))
        .map(|src| src.trim().to_string())
        .unwrap_or_default();
    Ok(ExtractedContent {
        image_url,
        text: fragment_text(&fragment),
    })
}

/// `published`, else `updated`, else the processing date; formatted `YYYY-MM-DD`.
pub fn publication_date(entry: &RawEntry, processed_on: NaiveDate) -> Result<String, NormalizeError> {
    let stamped = entry
        .published
        .map(|parts| ("published", parts))
        .or_else(|| entry.updated.map(|parts| ("updated", parts)));
    match stamped {
        Some((field, parts)) => parts
            .to_naive()
            .map(|dt| format_date(dt.date()))
            .ok_or(NormalizeError::InvalidDate { field, parts }),
        None => Ok(format_date(processed_on)),
    }
}

pub fn normalize_entry(
    entry: &RawEntry,
    fonte: &str,
    ctx: &NormalizeContext,
) -> Result<NewsRecord, NormalizeError> {
    let data = publication_date(entry, ctx.processed_on)?;
    let titulo = strip_html(entry.title.as_deref().unwrap_or(UNTITLED));
    let body = entry.summary.as_deref().or(entry.description.as_deref());

    let (imagem, conteudo) = match ctx.variant {
        NormalizerVariant::WithImage => {
            let extracted = extract_content(body.unwrap_or_default())?;
            (Some(extracted.image_url), extracted.text)
        }
        NormalizerVariant::Plain => (None, strip_html(body.unwrap_or(NO_CONTENT))),
    };

    Ok(NewsRecord {
        id: new_record_id(),
        titulo,
        conteudo,
        imagem,
        fonte: fonte.to_string(),
        data,
        url: entry.link.clone().unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub records: Vec<NewsRecord>,
    pub skipped: usize,
}

/// Normalize a feed's entries; a failing entry is logged and skipped.
pub fn normalize_entries(entries: &[RawEntry], fonte: &str, ctx: &NormalizeContext) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (position, entry) in entries.iter().enumerate() {
        match normalize_entry(entry, fonte, ctx) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                warn!(fonte, position, error = %err, "skipping feed entry");
                batch.skipped += 1;
            }
        }
    }
    batch
}

fn raw_entry_from_feed(entry: feed_rs::model::Entry) -> RawEntry {
    RawEntry {
        title: entry.title.map(|t| t.content),
        summary: entry.summary.map(|t| t.content),
        description: entry.content.and_then(|c| c.body),
        link: entry.links.into_iter().next().map(|l| l.href),
        published: entry.published.as_ref().map(TimeParts::from_datetime),
        updated: entry.updated.as_ref().map(TimeParts::from_datetime),
    }
}

/// Parse RSS, Atom or JSON Feed bytes into raw entries.
pub fn parse_feed(bytes: &[u8], location: &str) -> Result<Vec<RawEntry>, AdapterError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|source| AdapterError::Parse {
        location: location.to_string(),
        source,
    })?;
    Ok(feed.entries.into_iter().map(raw_entry_from_feed).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    Remote(String),
    Local(PathBuf),
}

impl FeedLocation {
    pub fn parse(location: &str) -> Self {
        let lower = location.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Remote(location.to_string())
        } else if lower.starts_with("file://") {
            Self::Local(PathBuf::from(&location["file://".len()..]))
        } else {
            Self::Local(PathBuf::from(location))
        }
    }
}

pub trait FeedSource: Send + Sync {
    fn fetch_entries(&self, location: &str) -> Result<Vec<RawEntry>, AdapterError>;
}

/// Reads `http(s)://` feeds over the network and everything else from disk.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    http: HttpFetcher,
}

impl HttpFeedSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch_entries(&self, location: &str) -> Result<Vec<RawEntry>, AdapterError> {
        let bytes = match FeedLocation::parse(location) {
            FeedLocation::Remote(url) => self.http.fetch_bytes(&url)?.body,
            FeedLocation::Local(path) => fs::read(&path)
                .with_context(|| format!("reading feed file {}", path.display()))?,
        };
        parse_feed(&bytes, location)
    }
}

/// In-memory feeds keyed by location, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFeedSource {
    feeds: HashMap<String, Result<Vec<RawEntry>, String>>,
}

impl StaticFeedSource {
    pub fn with_entries(mut self, location: impl Into<String>, entries: Vec<RawEntry>) -> Self {
        self.feeds.insert(location.into(), Ok(entries));
        self
    }

    pub fn with_failure(mut self, location: impl Into<String>, message: impl Into<String>) -> Self {
        self.feeds.insert(location.into(), Err(message.into()));
        self
    }
}

impl FeedSource for StaticFeedSource {
    fn fetch_entries(&self, location: &str) -> Result<Vec<RawEntry>, AdapterError> {
        match self.feeds.get(location) {
            Some(Ok(entries)) => Ok(entries.clone()),
            Some(Err(message)) => Err(AdapterError::Message(message.clone())),
            None => Err(AdapterError::Message(format!("no feed registered for {location}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Agência X</title>
    <link>https://agencia.example</link>
    <description>Últimas notícias</description>
    <item>
      <title>Sismo atinge capital</title>
      <link>https://agencia.example/sismo</link>
      <description>&lt;p&gt;Tremor de &lt;b&gt;5.1&lt;/b&gt; graus&lt;/p&gt;&lt;img src="https://img.example/sismo.jpg"/&gt;</description>
      <pubDate>Fri, 01 Mar 2024 10:30:00 +0000</pubDate>
    </item>
    <item>
      <title>Sem data</title>
      <description>Texto simples</description>
    </item>
  </channel>
</rss>"#;

    fn ctx(variant: NormalizerVariant) -> NormalizeContext {
        NormalizeContext {
            processed_on: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            variant,
        }
    }

    fn parts(year: i32, month: u32, day: u32) -> TimeParts {
        TimeParts {
            year,
            month,
            day,
            hour: 23,
            minute: 59,
            second: 0,
        }
    }

    #[test]
    fn strips_tags_and_joins_text_nodes() {
        assert_eq!(
            strip_html("<p>Olá <b>mundo</b></p>\n<p>  segundo   parágrafo </p>"),
            "Olá mundo segundo   parágrafo"
        );
        assert_eq!(strip_html("  Título simples  "), "Título simples");
        assert_eq!(strip_html("5 < 6 e 7 > 3"), "5 < 6 e 7 > 3");
        assert_eq!(strip_html("<i>Caf&eacute;</i>"), "Café");
    }

    #[test]
    fn extracts_first_image_and_drops_it_from_text() {
        let content = extract_content(
            r#"<div><img src=" https://img.example/a.png "><p>Legenda</p><img src="https://img.example/b.png"></div>"#,
        )
        .unwrap();
        assert_eq!(content.image_url, "https://img.example/a.png");
        assert_eq!(content.text, "Legenda");

        let no_image = extract_content("apenas texto").unwrap();
        assert_eq!(no_image, ExtractedContent { image_url: String::new(), text: "apenas texto".into() });
    }

    #[test]
    fn body_prefers_summary_then_description() {
        let entry = RawEntry {
            title: Some("<b>Manchete</b>".into()),
            summary: Some("<p>resumo</p>".into()),
            description: Some("<p>descrição</p>".into()),
            link: Some("https://n.example/1".into()),
            ..Default::default()
        };
        let record = normalize_entry(&entry, "Fonte", &ctx(NormalizerVariant::WithImage)).unwrap();
        assert_eq!(record.titulo, "Manchete");
        assert_eq!(record.conteudo, "resumo");
        assert_eq!(record.imagem.as_deref(), Some(""));
        assert_eq!(record.url, "https://n.example/1");

        let only_description = RawEntry { summary: None, ..entry };
        let record = normalize_entry(&only_description, "Fonte", &ctx(NormalizerVariant::WithImage)).unwrap();
        assert_eq!(record.conteudo, "descrição");
    }

    #[test]
    fn empty_entry_gets_fallbacks_per_variant() {
        let entry = RawEntry::default();
        let rich = normalize_entry(&entry, "G1", &ctx(NormalizerVariant::WithImage)).unwrap();
        assert_eq!(rich.titulo, UNTITLED);
        assert_eq!(rich.conteudo, "");
        assert_eq!(rich.imagem.as_deref(), Some(""));
        assert_eq!(rich.url, "");
        assert_eq!(rich.data, "2024-06-15");
        assert_eq!(rich.fonte, "G1");

        let plain = normalize_entry(&entry, "G1", &ctx(NormalizerVariant::Plain)).unwrap();
        assert_eq!(plain.conteudo, NO_CONTENT);
        assert!(plain.imagem.is_none());
    }

    #[test]
    fn ids_are_fresh_for_the_same_entry() {
        let entry = RawEntry {
            title: Some("Mesma".into()),
            ..Default::default()
        };
        let c = ctx(NormalizerVariant::WithImage);
        let a = normalize_entry(&entry, "F", &c).unwrap();
        let b = normalize_entry(&entry, "F", &c).unwrap();
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn date_prefers_published_then_updated_at_face_value() {
        let mut entry = RawEntry {
            published: Some(parts(2024, 3, 1)),
            updated: Some(parts(2024, 3, 9)),
            ..Default::default()
        };
        assert_eq!(publication_date(&entry, ctx(NormalizerVariant::Plain).processed_on).unwrap(), "2024-03-01");
        entry.published = None;
        assert_eq!(publication_date(&entry, ctx(NormalizerVariant::Plain).processed_on).unwrap(), "2024-03-09");
    }

    #[test]
    fn invalid_date_skips_only_that_entry() {
        let entries = vec![
            RawEntry {
                title: Some("Boa".into()),
                published: Some(parts(2024, 1, 1)),
                ..Default::default()
            },
            RawEntry {
                title: Some("Ruim".into()),
                published: Some(parts(2024, 13, 1)),
                ..Default::default()
            },
            RawEntry {
                title: Some("Outra boa".into()),
                ..Default::default()
            },
        ];
        let batch = normalize_entries(&entries, "F", &ctx(NormalizerVariant::WithImage));
        assert_eq!(batch.skipped, 1);
        let titles: Vec<_> = batch.records.iter().map(|r| r.titulo.as_str()).collect();
        assert_eq!(titles, vec!["Boa", "Outra boa"]);
    }

    #[test]
    fn parses_rss_items_into_raw_entries() {
        let entries = parse_feed(SAMPLE_RSS.as_bytes(), "inline").unwrap();
        assert_eq!(entries.len(), 2);
        let first = &entries[0];
        assert_eq!(first.title.as_deref(), Some("Sismo atinge capital"));
        assert_eq!(first.link.as_deref(), Some("https://agencia.example/sismo"));
        assert_eq!(first.published.map(|p| (p.year, p.month, p.day)), Some((2024, 3, 1)));

        let record = normalize_entry(first, "Agência X", &ctx(NormalizerVariant::WithImage)).unwrap();
        assert_eq!(record.conteudo, "Tremor de 5.1 graus");
        assert_eq!(record.imagem.as_deref(), Some("https://img.example/sismo.jpg"));
        assert_eq!(record.data, "2024-03-01");

        let undated = normalize_entry(&entries[1], "Agência X", &ctx(NormalizerVariant::WithImage)).unwrap();
        assert_eq!(undated.data, "2024-06-15");
        assert_eq!(undated.url, "");
    }

    #[test]
    fn garbage_bytes_are_a_parse_error() {
        let err = parse_feed(b"definitely not a feed", "broken").unwrap_err();
        assert!(matches!(err, AdapterError::Parse { .. }));
    }

    #[test]
    fn feed_locations_distinguish_remote_and_local() {
        assert_eq!(
            FeedLocation::parse("HTTPS://g1.example/rss"),
            FeedLocation::Remote("HTTPS://g1.example/rss".into())
        );
        assert_eq!(
            FeedLocation::parse("file:///tmp/feed.xml"),
            FeedLocation::Local(PathBuf::from("/tmp/feed.xml"))
        );
        assert_eq!(
            FeedLocation::parse("feeds/local.xml"),
            FeedLocation::Local(PathBuf::from("feeds/local.xml"))
        );
    }

    #[test]
    fn http_source_reads_local_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("feed.xml");
        fs::write(&path, SAMPLE_RSS).unwrap();
        let source = HttpFeedSource::new(HttpFetcher::new(Default::default()).unwrap());

        let entries = source.fetch_entries(path.to_str().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        let missing = source.fetch_entries(dir.path().join("missing.xml").to_str().unwrap());
        assert!(matches!(missing, Err(AdapterError::Anyhow(_))));
    }

    #[test]
    fn static_source_reports_failures() {
        let source = StaticFeedSource::default()
            .with_entries("a", vec![RawEntry::default()])
            .with_failure("b", "boom");
        assert_eq!(source.fetch_entries("a").unwrap().len(), 1);
        assert!(source.fetch_entries("b").is_err());
        assert!(source.fetch_entries("c").is_err());
    }
}
