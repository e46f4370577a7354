use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use url::Url;

use super::diff::DiffReport;
use super::types::{CrawlRecord, DataFormat, PageIssue};

const CSV_HEADERS: [&str; 32] = [
    "url",
    "status_code",
    "response_time_ms",
    "elapsed_ms",
    "size_bytes",
    "raw_html_size",
    "rendered_html_size",
    "js_additions",
    "js_percentage",
    "speed_score",
    "seo_score",
    "technologies",
    "is_spa",
    "spa_score",
    "title",
    "meta_description",
    "h1_count",
    "h2_count",
    "images_without_alt",
    "internal_links",
    "external_links",
    "word_count",
    "canonical_url",
    "meta_robots",
    "og_title",
    "og_description",
    "schema_markup",
    "issue_count",
    "issues",
    "used_render_fallback",
    "errors",
    "timestamp",
];

/// Flat export row. HTML bodies stay out of the tabular export; they are
/// written as separate artifacts when requested.
#[derive(Debug, Clone, Serialize)]
struct ExportRecord {
    url: String,
    status_code: u16,
    response_time_ms: u64,
    elapsed_ms: u64,
    size_bytes: usize,
    raw_html_size: usize,
    rendered_html_size: usize,
    js_additions: usize,
    js_percentage: f64,
    speed_score: u8,
    seo_score: u8,
    technologies: Vec<String>,
    is_spa: bool,
    spa_score: u8,
    title: String,
    meta_description: String,
    h1_count: usize,
    h2_count: usize,
    images_without_alt: usize,
    internal_links: usize,
    external_links: usize,
    word_count: usize,
    canonical_url: String,
    meta_robots: String,
    og_title: String,
    og_description: String,
    schema_markup: bool,
    issue_count: usize,
    issues: String,
    used_render_fallback: bool,
    errors: Vec<String>,
    timestamp: String,
}

fn issues_to_csv(issues: &[PageIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.label())
        .collect::<Vec<_>>()
        .join("|")
}

fn record_to_export(record: &CrawlRecord) -> ExportRecord {
    let seo = &record.seo_data;
    ExportRecord {
        url: record.url.clone(),
        status_code: record.status_code,
        response_time_ms: record.response_time_ms,
        elapsed_ms: record.elapsed_ms,
        size_bytes: record.size_bytes,
        raw_html_size: record.raw_html_size(),
        rendered_html_size: record.rendered_html_size(),
        js_additions: record.js_additions,
        js_percentage: (record.js_percentage * 100.0).round() / 100.0,
        speed_score: record.speed_score,
        seo_score: record.seo_score,
        technologies: record.technologies.clone(),
        is_spa: record.is_spa,
        spa_score: record.spa_score,
        title: seo.title.clone(),
        meta_description: seo.meta_description.clone(),
        h1_count: seo.h1_count,
        h2_count: seo.h2_count,
        images_without_alt: seo.images_without_alt,
        internal_links: seo.internal_links,
        external_links: seo.external_links,
        word_count: seo.word_count,
        canonical_url: seo.canonical_url.clone(),
        meta_robots: seo.meta_robots.clone(),
        og_title: seo.og_title.clone(),
        og_description: seo.og_description.clone(),
        schema_markup: seo.schema_markup,
        issue_count: record.issues.len(),
        issues: issues_to_csv(&record.issues),
        used_render_fallback: record.used_render_fallback,
        errors: record.errors.clone(),
        timestamp: record.timestamp.clone(),
    }
}

pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_record(&mut self, record: &CrawlRecord) -> io::Result<()> {
        let rec = record_to_export(record);
        self.writer.write_record([
            rec.url,
            rec.status_code.to_string(),
            rec.response_time_ms.to_string(),
            rec.elapsed_ms.to_string(),
            rec.size_bytes.to_string(),
            rec.raw_html_size.to_string(),
            rec.rendered_html_size.to_string(),
            rec.js_additions.to_string(),
            format!("{:.2}", rec.js_percentage),
            rec.speed_score.to_string(),
            rec.seo_score.to_string(),
            rec.technologies.join("|"),
            rec.is_spa.to_string(),
            rec.spa_score.to_string(),
            rec.title,
            rec.meta_description,
            rec.h1_count.to_string(),
            rec.h2_count.to_string(),
            rec.images_without_alt.to_string(),
            rec.internal_links.to_string(),
            rec.external_links.to_string(),
            rec.word_count.to_string(),
            rec.canonical_url,
            rec.meta_robots,
            rec.og_title,
            rec.og_description,
            rec.schema_markup.to_string(),
            rec.issue_count.to_string(),
            rec.issues,
            rec.used_render_fallback.to_string(),
            rec.errors.join("|"),
            rec.timestamp,
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_record(&mut self, record: &CrawlRecord) -> io::Result<()> {
        let rec = record_to_export(record);
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

/// Record sink appended to as each record completes.
pub enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    pub fn new(output_path: &str, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(output_path)?)),
        }
    }

    pub fn write_record(&mut self, record: &CrawlRecord) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_record(record),
            OutputSink::Json(sink) => sink.write_record(record),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.flush(),
        }
    }

    pub fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

pub fn default_output_path(url: &str, format: DataFormat) -> String {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| "rendiff".to_string());
    let host = host
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("{host}_{ts}.csv"),
        DataFormat::Json => format!("{host}_{ts}.json"),
    }
}

/// `https://a.test/x/y` becomes `a.test_x_y`.
pub fn url_slug(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    without_scheme.replace('/', "_")
}

#[derive(Debug, Clone)]
pub struct DiffArtifacts {
    pub original: PathBuf,
    pub rendered: PathBuf,
    pub diff: PathBuf,
    pub report: DiffReport,
}

/// Writes the original document, the rendered document and their unified
/// diff under `dir`. Records missing either document are skipped.
pub fn write_diff_artifacts(
    dir: &Path,
    record: &CrawlRecord,
    context: usize,
) -> io::Result<Option<DiffArtifacts>> {
    if !record.has_documents() {
        return Ok(None);
    }
    fs::create_dir_all(dir)?;

    let slug = url_slug(&record.url);
    let artifacts = DiffArtifacts {
        original: dir.join(format!("original_{slug}.html")),
        rendered: dir.join(format!("rendered_{slug}.html")),
        diff: dir.join(format!("diff_{slug}.diff")),
        report: DiffReport::for_record(record),
    };
    fs::write(&artifacts.original, record.raw_html())?;
    fs::write(&artifacts.rendered, record.rendered_html())?;

    let mut diff = artifacts.report.unified(context).join("\n");
    if !diff.is_empty() {
        diff.push('\n');
    }
    fs::write(&artifacts.diff, diff)?;
    Ok(Some(artifacts))
}
