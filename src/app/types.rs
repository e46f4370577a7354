use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use clap::{ArgAction, Parser, ValueEnum};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "rendiff",
    version,
    about = "Crawl URLs and diff their initial HTML against the script-rendered DOM"
)]
pub struct Cli {
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    #[arg(long, value_name = "FILE")]
    pub urls_file: Option<String>,

    #[arg(long, value_name = "URL")]
    pub sitemap: Option<String>,

    #[arg(short, long, value_name = "FILE")]
    pub output: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    pub format: FileFormatArg,

    #[arg(long, value_name = "SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    #[arg(long, value_name = "SECS", default_value_t = 3)]
    pub js_wait: u64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_js: bool,

    #[arg(long, value_name = "N", default_value_t = 3)]
    pub concurrency: usize,

    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:9515")]
    pub webdriver_url: String,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    pub webdriver_start_timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = BrowserArg::Chrome)]
    pub browser: BrowserArg,

    #[arg(long, value_name = "DIR")]
    pub diff_dir: Option<String>,

    #[arg(long, value_name = "N", default_value_t = 3)]
    pub context_lines: usize,

    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum BrowserArg {
    Chrome,
    Firefox,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

pub const MAX_CONCURRENCY: usize = 16;

/// Extra time a task gets on top of the page timeout and settle delay.
pub const TASK_GRACE: Duration = Duration::from_secs(15);

pub fn sanitize_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_CONCURRENCY)
}

/// Options consumed verbatim by the orchestrator.
///
/// A task's budget is `timeout + js_wait + task_grace` of active work; time
/// spent queued for the shared browser does not count against it.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub timeout: Duration,
    pub js_wait: Duration,
    pub enable_js: bool,
    pub concurrency: usize,
    pub task_grace: Duration,
}

impl CrawlConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            timeout: Duration::from_secs(cli.timeout.max(1)),
            js_wait: Duration::from_secs(cli.js_wait),
            enable_js: cli.enable_js,
            concurrency: sanitize_concurrency(cli.concurrency),
            task_grace: TASK_GRACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeoData {
    pub title: String,
    pub meta_description: String,
    pub h1_count: usize,
    pub h2_count: usize,
    pub images_without_alt: usize,
    pub internal_links: usize,
    pub external_links: usize,
    pub word_count: usize,
    pub canonical_url: String,
    pub meta_robots: String,
    pub og_title: String,
    pub og_description: String,
    pub schema_markup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    High,
    Medium,
    Low,
}

impl IssueSeverity {
    pub fn label(self) -> &'static str {
        match self {
            IssueSeverity::High => "high",
            IssueSeverity::Medium => "medium",
            IssueSeverity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageIssue {
    HttpStatus,
    SlowResponse,
    PoorSpeedScore,
    LowSeoScore,
    MissingTitle,
    MissingMetaDescription,
    ExcessiveScriptModification,
}

impl PageIssue {
    pub fn label(self) -> &'static str {
        match self {
            PageIssue::HttpStatus => "http_status",
            PageIssue::SlowResponse => "slow_response",
            PageIssue::PoorSpeedScore => "poor_speed_score",
            PageIssue::LowSeoScore => "low_seo_score",
            PageIssue::MissingTitle => "missing_title",
            PageIssue::MissingMetaDescription => "missing_meta_description",
            PageIssue::ExcessiveScriptModification => "excessive_script_modification",
        }
    }

    pub fn severity(self) -> IssueSeverity {
        match self {
            PageIssue::HttpStatus | PageIssue::MissingTitle => IssueSeverity::High,
            PageIssue::SlowResponse
            | PageIssue::PoorSpeedScore
            | PageIssue::MissingMetaDescription
            | PageIssue::ExcessiveScriptModification => IssueSeverity::Medium,
            PageIssue::LowSeoScore => IssueSeverity::Low,
        }
    }
}

/// Result of a successful direct fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    pub elapsed: Duration,
    pub body: String,
    pub headers: HashMap<String, String>,
}

/// Documents captured from one browser navigation.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
    /// Snapshot taken as soon as the body appeared, before the settle delay.
    /// Only captured when the caller asks for it.
    pub initial_html: Option<String>,
    pub html: String,
}

/// One output row per crawl target.
///
/// The HTML bodies and their byte sizes are private so they can only change
/// together through [`CrawlRecord::set_documents`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlRecord {
    pub url: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub elapsed_ms: u64,
    pub size_bytes: usize,
    raw_html_size: usize,
    rendered_html_size: usize,
    pub js_additions: usize,
    pub js_percentage: f64,
    pub speed_score: u8,
    pub seo_score: u8,
    pub technologies: Vec<String>,
    pub is_spa: bool,
    pub spa_score: u8,
    pub errors: Vec<String>,
    pub seo_data: SeoData,
    pub issues: Vec<PageIssue>,
    pub used_render_fallback: bool,
    pub timestamp: String,
    raw_html: String,
    rendered_html: String,
}

impl Default for CrawlRecord {
    fn default() -> Self {
        Self {
            url: String::new(),
            status_code: 0,
            response_time_ms: 0,
            elapsed_ms: 0,
            size_bytes: 0,
            raw_html_size: 0,
            rendered_html_size: 0,
            js_additions: 0,
            js_percentage: 0.0,
            speed_score: 0,
            seo_score: 0,
            technologies: Vec::new(),
            is_spa: false,
            spa_score: 0,
            errors: Vec::new(),
            seo_data: SeoData::default(),
            issues: Vec::new(),
            used_render_fallback: false,
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            raw_html: String::new(),
            rendered_html: String::new(),
        }
    }
}

impl CrawlRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Minimal record for a task that never produced a result.
    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        let mut record = Self::new(url);
        record.errors.push(error.into());
        record
    }

    pub fn set_documents(&mut self, raw_html: String, rendered_html: String) {
        self.raw_html_size = raw_html.len();
        self.rendered_html_size = rendered_html.len();
        self.size_bytes = self.raw_html_size;
        self.raw_html = raw_html;
        self.rendered_html = rendered_html;
    }

    pub fn raw_html(&self) -> &str {
        &self.raw_html
    }

    pub fn rendered_html(&self) -> &str {
        &self.rendered_html
    }

    pub fn raw_html_size(&self) -> usize {
        self.raw_html_size
    }

    pub fn rendered_html_size(&self) -> usize {
        self.rendered_html_size
    }

    pub fn has_documents(&self) -> bool {
        !self.raw_html.is_empty() && !self.rendered_html.is_empty()
    }
}

#[derive(Debug)]
pub enum CrawlEvent {
    Record(Box<CrawlRecord>),
    Status(String),
    Error(String),
    Finished,
}

#[derive(Default)]
pub struct AppState {
    pub parsed: usize,
    pub done: bool,
    pub spa_count: usize,
    pub speed_score_sum: u64,
    pub seo_score_sum: u64,
    pub errors: VecDeque<String>,
    pub issue_counts: HashMap<PageIssue, usize>,
    pub technology_counts: HashMap<String, usize>,
}

impl AppState {
    pub fn push_record(&mut self, record: &CrawlRecord) {
        self.parsed += 1;
        if record.is_spa {
            self.spa_count += 1;
        }
        self.speed_score_sum += record.speed_score as u64;
        self.seo_score_sum += record.seo_score as u64;
        for issue in &record.issues {
            *self.issue_counts.entry(*issue).or_insert(0) += 1;
        }
        for tech in &record.technologies {
            *self.technology_counts.entry(tech.clone()).or_insert(0) += 1;
        }
    }

    pub fn push_error(&mut self, error: String) {
        self.errors.push_front(error);
        while self.errors.len() > 10 {
            self.errors.pop_back();
        }
    }

    pub fn average_speed_score(&self) -> f64 {
        if self.parsed == 0 {
            0.0
        } else {
            self.speed_score_sum as f64 / self.parsed as f64
        }
    }

    pub fn average_seo_score(&self) -> f64 {
        if self.parsed == 0 {
            0.0
        } else {
            self.seo_score_sum as f64 / self.parsed as f64
        }
    }

    pub fn top_technologies(&self, limit: usize) -> Vec<(String, usize)> {
        let mut entries = self
            .technology_counts
            .iter()
            .map(|(tech, count)| (tech.clone(), *count))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.into_iter().take(limit.max(1)).collect()
    }
}
