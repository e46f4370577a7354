use std::cmp::Reverse;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use log::{LevelFilter, debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::crawl::run_crawl;
use super::data_io::{OutputSink, default_output_path, detect_data_format, write_diff_artifacts};
use super::diff::DiffReport;
use super::diff::classify::LineClass;
use super::fetch::{BROWSER_USER_AGENT, build_fetch_client, fetch_sitemap_urls};
use super::render::{BrowserSettings, RenderSession};
use super::types::{AppState, Cli, CrawlConfig, CrawlEvent, CrawlRecord, DataFormat};

/// `RUST_LOG` is read first; `level` then overrides the global and crate
/// levels. Parser and HTTP internals stay quiet unless asked for.
pub fn init_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    builder.filter_module("html5ever", LevelFilter::Error);
    builder.filter_module("selectors", LevelFilter::Warn);
    builder.filter_module("reqwest", LevelFilter::Info);
    builder.filter_module("hyper", LevelFilter::Info);
    builder.filter_module("hyper_util", LevelFilter::Info);
    builder.filter_module("rendiff", level);
    builder.try_init()
}

fn read_urls_file(path: &str) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

/// Positional URLs, then the URL file, then sitemap entries. Blank entries
/// and repeats are dropped; order is kept.
pub async fn collect_targets(cli: &Cli, client: &reqwest::Client) -> anyhow::Result<Vec<String>> {
    let mut targets = cli.urls.clone();
    if let Some(path) = cli.urls_file.as_deref() {
        let urls = read_urls_file(path).with_context(|| format!("reading URL file {path}"))?;
        info!("loaded {} URLs from {path}", urls.len());
        targets.extend(urls);
    }
    if let Some(sitemap) = cli.sitemap.as_deref() {
        targets.extend(fetch_sitemap_urls(client, sitemap).await);
    }

    let mut seen = HashSet::new();
    Ok(targets
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect())
}

/// Updates `state` and the sink. Returns the record when it still needs
/// diff artifacts written.
fn handle_crawl_event(
    state: &mut AppState,
    sink: Option<&mut OutputSink>,
    event: CrawlEvent,
) -> io::Result<Option<Box<CrawlRecord>>> {
    match event {
        CrawlEvent::Record(record) => {
            state.push_record(&record);
            if let Some(sink) = sink {
                sink.write_record(&record)?;
                sink.flush()?;
            }
            return Ok(Some(record));
        }
        CrawlEvent::Finished => state.done = true,
        CrawlEvent::Status(message) => info!("{message}"),
        CrawlEvent::Error(err) => {
            warn!("{err}");
            state.push_error(err);
        }
    }
    Ok(None)
}

/// Diffing a large page is CPU-bound, so it runs on the blocking pool.
async fn write_artifacts_off_runtime(dir: PathBuf, record: Box<CrawlRecord>, context: usize) {
    let url = record.url.clone();
    let job = move || write_diff_artifacts(&dir, &record, context);
    match tokio::task::spawn_blocking(job).await {
        Ok(Ok(Some(artifacts))) => {
            let stats = &artifacts.report.stats;
            info!(
                "diff for {url} written to {}: +{} -{} ~{} similarity={:.1}% injections={}",
                artifacts.diff.display(),
                stats.lines_added,
                stats.lines_removed,
                stats.lines_modified,
                stats.similarity * 100.0,
                artifacts.report.injections.total()
            );
            log_diff_details(&url, &artifacts.report);
        }
        Ok(Ok(None)) => {}
        Ok(Err(err)) => warn!("writing diff artifacts for {url} failed: {err}"),
        Err(err) => warn!("diff task for {url} failed: {err}"),
    }
}

fn log_diff_details(url: &str, report: &DiffReport) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let insights = report.insights();
    if !insights.is_empty() {
        debug!(
            "{url}: changed lines script={} metadata={} style={} content={}",
            insights.scripts.len(),
            insights.metadata.len(),
            insights.styles.len(),
            insights.content.len()
        );
    }
    for injection in report
        .injections
        .scripts
        .iter()
        .chain(&report.injections.metadata)
        .chain(&report.injections.styles)
    {
        debug!("{url}: injected <{}> {}", injection.tag, injection.description);
    }
    for line in report
        .display_lines(true)
        .filter(|line| line.class.is_some_and(|class| class != LineClass::Content))
        .take(20)
    {
        if let (Some(number), Some(class)) = (line.rendered_number, line.class) {
            debug!("{url}: rendered:{number} [{}] {}", class.label(), line.text.trim());
        }
    }
}

async fn consume_events(
    mut rx: UnboundedReceiver<CrawlEvent>,
    mut sink: OutputSink,
    diff_dir: Option<PathBuf>,
    context_lines: usize,
) -> io::Result<AppState> {
    let mut state = AppState::default();
    while let Some(event) = rx.recv().await {
        let pending = handle_crawl_event(&mut state, Some(&mut sink), event)?;
        if let (Some(dir), Some(record)) = (diff_dir.as_ref(), pending) {
            write_artifacts_off_runtime(dir.clone(), record, context_lines).await;
        }
        if state.done {
            break;
        }
    }
    sink.finalize()?;
    Ok(state)
}

fn summary_line(state: &AppState, output_path: &str) -> String {
    format!(
        "finished crawl: records={} spa={} avg_speed={:.1} avg_seo={:.1} output={}",
        state.parsed,
        state.spa_count,
        state.average_speed_score(),
        state.average_seo_score(),
        output_path
    )
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(err) = init_logger(cli.log_level) {
        eprintln!("logger already initialised: {err}");
    }

    let config = CrawlConfig::from_cli(&cli);
    let client = build_fetch_client(config.timeout).context("building HTTP client")?;
    let targets = collect_targets(&cli, &client).await?;
    let Some(first_target) = targets.first().cloned() else {
        bail!("no URLs to crawl; pass URLs, --urls-file or --sitemap");
    };

    let configured_format: DataFormat = cli.format.into();
    let output_format = cli
        .output
        .as_deref()
        .map(|path| detect_data_format(path, configured_format))
        .unwrap_or(configured_format);
    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&first_target, output_format));
    let sink = OutputSink::new(&output_path, output_format)
        .with_context(|| format!("creating output file {output_path}"))?;

    let settings = BrowserSettings {
        endpoint: cli.webdriver_url.clone(),
        driver_binary: cli.webdriver_binary.clone(),
        driver_start_timeout: Duration::from_millis(cli.webdriver_start_timeout_ms),
        browser: cli.browser,
        user_agent: BROWSER_USER_AGENT.to_string(),
    };
    let session = Arc::new(RenderSession::new(settings).context("building WebDriver client")?);

    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing without dispatching more URLs");
            ctrl_c_flag.store(true, Ordering::Relaxed);
        }
    });

    let (tx, rx) = mpsc::unbounded_channel::<CrawlEvent>();
    let consumer = tokio::spawn(consume_events(
        rx,
        sink,
        cli.diff_dir.as_deref().map(PathBuf::from),
        cli.context_lines,
    ));

    info!(
        "crawling {} URLs (timeout={}s js_wait={}s js={} concurrency={})",
        targets.len(),
        config.timeout.as_secs(),
        config.js_wait.as_secs(),
        config.enable_js,
        config.concurrency
    );
    let session_status = session.clone();
    let result = run_crawl(targets, &config, client, session, cancel, tx).await;

    let state = consumer
        .await
        .context("event consumer task failed")?
        .with_context(|| format!("writing {output_path}"))?;
    eprintln!("{}", summary_line(&state, &output_path));
    for (tech, count) in state.top_technologies(5) {
        info!("technology {tech}: {count}");
    }
    for err in state.errors.iter().rev() {
        debug!("recent error: {err}");
    }
    let mut issues = state.issue_counts.iter().collect::<Vec<_>>();
    issues.sort_by_key(|(issue, count)| (issue.severity(), Reverse(**count), issue.label()));
    for (issue, count) in issues {
        info!("issue [{}] {}: {count}", issue.severity().label(), issue.label());
    }
    debug!("browser session state at exit: {:?}", session_status.status().await);

    if let Err(err) = result {
        error!("{err}");
        return Err(err.into());
    }
    Ok(())
}
