use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{Id, JoinError, JoinSet};

use super::analysis::{analyze_page, apply_analysis, collect_page_issues};
use super::error::{CrawlError, FetchError, RenderError};
use super::fetch::fetch_document;
use super::render::RenderSession;
use super::types::{CrawlConfig, CrawlEvent, CrawlRecord, RenderedPage};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

type TaskOutcome = Result<(Id, Result<CrawlRecord, CrawlError>), JoinError>;

fn send_status(tx: &UnboundedSender<CrawlEvent>, message: impl Into<String>) {
    let _ = tx.send(CrawlEvent::Status(message.into()));
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn cancelled(cancel: &AtomicBool) {
    while !cancel.load(Ordering::Relaxed) {
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
    }
}

/// Crawls every non-blank target and returns one record per target in
/// completion order.
///
/// Per-target failures never abort the batch. The only error is a browser
/// that could not be launched, which stops the run. Setting `cancel` stops
/// new dispatches; tasks already running are detached and their results
/// dropped. The render session is closed before returning on every path,
/// so detached tasks cannot launch another browser.
pub async fn run_crawl(
    targets: Vec<String>,
    config: &CrawlConfig,
    client: reqwest::Client,
    session: Arc<RenderSession>,
    cancel: Arc<AtomicBool>,
    tx: UnboundedSender<CrawlEvent>,
) -> Result<Vec<CrawlRecord>, CrawlError> {
    let mut queue = targets
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<VecDeque<_>>();
    let total = queue.len();
    let concurrency = config.concurrency.max(1);
    send_status(&tx, format!("crawling {total} URLs with {concurrency} workers"));

    let mut set: JoinSet<Result<CrawlRecord, CrawlError>> = JoinSet::new();
    let mut in_flight: HashMap<Id, String> = HashMap::new();
    let mut records = Vec::with_capacity(total);
    let mut fatal: Option<String> = None;

    loop {
        if cancel.load(Ordering::Relaxed) {
            info!("crawl cancelled; {} tasks detached", set.len());
            set.detach_all();
            break;
        }

        while set.len() < concurrency {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let Some(url) = queue.pop_front() else {
                break;
            };
            let task_url = url.clone();
            let task_config = config.clone();
            let task_client = client.clone();
            let task_session = session.clone();
            let handle = set.spawn(async move {
                crawl_single_url(task_url, &task_config, &task_client, &task_session).await
            });
            in_flight.insert(handle.id(), url);
        }

        if set.is_empty() {
            break;
        }

        let joined = tokio::select! {
            joined = set.join_next_with_id() => joined,
            () = cancelled(&cancel) => continue,
        };
        let Some(joined) = joined else {
            break;
        };
        if cancel.load(Ordering::Relaxed) {
            continue;
        }

        let record = match settle_task(joined, &mut in_flight) {
            Ok(record) => record,
            Err(CrawlError::RendererUnavailable(reason)) => {
                error!("renderer unavailable, aborting run: {reason}");
                fatal = Some(reason);
                set.abort_all();
                while set.join_next().await.is_some() {}
                break;
            }
        };

        info!("processed {}/{}: {}", records.len() + 1, total, record.url);
        for err in &record.errors {
            let _ = tx.send(CrawlEvent::Error(format!("{}: {err}", record.url)));
        }
        let _ = tx.send(CrawlEvent::Record(Box::new(record.clone())));
        records.push(record);
    }

    session.close().await;
    let _ = tx.send(CrawlEvent::Finished);

    match fatal {
        Some(reason) => Err(CrawlError::RendererUnavailable(reason)),
        None => Ok(records),
    }
}

/// Turns one joined task into its record. A task that panicked or was
/// cancelled becomes a minimal failed record for the URL it was crawling.
fn settle_task(
    joined: TaskOutcome,
    in_flight: &mut HashMap<Id, String>,
) -> Result<CrawlRecord, CrawlError> {
    match joined {
        Ok((id, outcome)) => {
            in_flight.remove(&id);
            outcome
        }
        Err(err) => {
            let url = in_flight.remove(&err.id()).unwrap_or_default();
            warn!("crawl task for {url} failed: {err}");
            Ok(CrawlRecord::failed(url, format!("task failed: {err}")))
        }
    }
}

fn launch_failure(err: RenderError) -> CrawlError {
    CrawlError::RendererUnavailable(err.to_string())
}

fn timed_out(url: &str, budget: Duration) -> CrawlRecord {
    CrawlRecord::failed(url, format!("task timed out after {}s", budget.as_secs()))
}

/// Renders under an exclusive lease. `None` when the work exceeded `budget`;
/// waiting for the lease is not counted.
async fn render_within(
    session: &RenderSession,
    url: &str,
    config: &CrawlConfig,
    capture_initial: bool,
    budget: Duration,
) -> Option<Result<RenderedPage, RenderError>> {
    let mut lease = session.lease().await;
    let render = lease.render(url, config.timeout, config.js_wait, capture_initial);
    tokio::time::timeout(budget, render).await.ok()
}

/// Fetch, render and analyze one URL.
///
/// A failed direct fetch falls back to the browser for both documents: the
/// snapshot taken when the body first appears becomes the raw document and
/// the settled snapshot the rendered one.
///
/// Fetching and rendering together get `timeout + js_wait + task_grace`;
/// exceeding it yields a minimal record holding only the URL and the error.
pub async fn crawl_single_url(
    url: String,
    config: &CrawlConfig,
    client: &reqwest::Client,
    session: &RenderSession,
) -> Result<CrawlRecord, CrawlError> {
    let started = Instant::now();
    let budget = config.timeout + config.js_wait + config.task_grace;
    let mut record = CrawlRecord::new(url.clone());

    let fetch = fetch_document(client, &url, config.timeout);
    let fetched = match tokio::time::timeout(budget, fetch).await {
        Ok(fetched) => fetched,
        Err(_) => return Ok(timed_out(&url, budget)),
    };
    let remaining = budget.saturating_sub(started.elapsed());

    let (raw_html, rendered_html, headers) = match fetched {
        Ok(outcome) => {
            record.status_code = outcome.status;
            record.response_time_ms = millis(outcome.elapsed);
            let rendered = if config.enable_js {
                match render_within(session, &url, config, false, remaining).await {
                    None => return Ok(timed_out(&url, budget)),
                    Some(Ok(page)) => page.html,
                    Some(Err(err)) if err.is_fatal() => return Err(launch_failure(err)),
                    Some(Err(err)) => {
                        warn!("render of {url} failed, keeping raw document: {err}");
                        record.errors.push(format!("render failed: {err}"));
                        outcome.body.clone()
                    }
                }
            } else {
                outcome.body.clone()
            };
            (outcome.body, rendered, outcome.headers)
        }
        Err(err) => {
            record.status_code = err.status_code();
            record.errors.push(err.to_string());
            let headers = match err {
                FetchError::Status {
                    elapsed, headers, ..
                } => {
                    record.response_time_ms = millis(elapsed);
                    headers
                }
                _ => HashMap::new(),
            };

            if config.enable_js {
                debug!("fetch of {url} failed, rendering both documents");
                record.used_render_fallback = true;
                let render_started = Instant::now();
                match render_within(session, &url, config, true, remaining).await {
                    None => return Ok(timed_out(&url, budget)),
                    Some(Ok(page)) => {
                        if record.response_time_ms == 0 {
                            record.response_time_ms = millis(render_started.elapsed());
                        }
                        let raw = page.initial_html.unwrap_or_else(|| page.html.clone());
                        (raw, page.html, headers)
                    }
                    Some(Err(err)) if err.is_fatal() => return Err(launch_failure(err)),
                    Some(Err(err)) => {
                        warn!("fallback render of {url} failed: {err}");
                        record.errors.push(format!("render failed: {err}"));
                        (String::new(), String::new(), headers)
                    }
                }
            } else {
                (String::new(), String::new(), headers)
            }
        }
    };

    if !raw_html.is_empty() || !rendered_html.is_empty() {
        let analysis = analyze_page(
            &raw_html,
            &rendered_html,
            &headers,
            Duration::from_millis(record.response_time_ms),
        );
        apply_analysis(&mut record, analysis);
    }
    record.set_documents(raw_html, rendered_html);
    record.issues = collect_page_issues(&record);
    record.elapsed_ms = millis(started.elapsed());
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::fetch::build_fetch_client;
    use crate::app::render::tests::{broken_webdriver, mock_webdriver};
    use crate::app::render::{BrowserSettings, SessionStatus};
    use crate::app::types::{PageIssue, TASK_GRACE};
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use tokio::sync::mpsc;

    const PAGE: &str = "<html><head><title>T</title></head><body><p>Hi</p></body></html>";
    const RENDERED: &str =
        "<html><head><title>T</title></head><body><p>Hi</p><script>alert(1)</script></body></html>";

    fn config(enable_js: bool) -> CrawlConfig {
        CrawlConfig {
            timeout: Duration::from_secs(2),
            js_wait: Duration::ZERO,
            enable_js,
            concurrency: 2,
            task_grace: TASK_GRACE,
        }
    }

    fn session_for(server: &Server) -> Arc<RenderSession> {
        Arc::new(RenderSession::new(BrowserSettings::new(server.url_str(""))).unwrap())
    }

    fn offline_session() -> Arc<RenderSession> {
        Arc::new(RenderSession::new(BrowserSettings::new("http://127.0.0.1:9")).unwrap())
    }

    async fn crawl(
        targets: Vec<String>,
        config: &CrawlConfig,
        session: Arc<RenderSession>,
    ) -> (Result<Vec<CrawlRecord>, CrawlError>, Vec<CrawlEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = build_fetch_client(config.timeout).unwrap();
        let result = run_crawl(
            targets,
            config,
            client,
            session,
            Arc::new(AtomicBool::new(false)),
            tx,
        )
        .await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn one_failed_fetch_still_yields_every_record() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/ok"))
                .times(2)
                .respond_with(status_code(200).body(PAGE)),
        );
        site.expect(
            Expectation::matching(request::method_path("GET", "/gone"))
                .respond_with(status_code(404)),
        );

        let targets = vec![
            site.url("/ok").to_string(),
            site.url("/gone").to_string(),
            site.url("/ok").to_string(),
        ];
        let (result, events) = crawl(targets, &config(false), offline_session()).await;
        let records = result.unwrap();
        assert_eq!(records.len(), 3);

        let gone = records.iter().find(|r| r.url.ends_with("/gone")).unwrap();
        assert_eq!(gone.status_code, 404);
        assert!(!gone.errors.is_empty());
        assert!(gone.issues.contains(&PageIssue::HttpStatus));
        assert!(!gone.used_render_fallback);

        let ok = records.iter().find(|r| r.url.ends_with("/ok")).unwrap();
        assert_eq!(ok.status_code, 200);
        assert_eq!(ok.raw_html(), PAGE);
        assert_eq!(ok.rendered_html(), PAGE);
        assert_eq!(ok.js_percentage, 0.0);
        assert_eq!(ok.seo_data.title, "T");

        let finished = events
            .iter()
            .filter(|e| matches!(e, CrawlEvent::Finished))
            .count();
        assert_eq!(finished, 1);
        let streamed = events
            .iter()
            .filter(|e| matches!(e, CrawlEvent::Record(_)))
            .count();
        assert_eq!(streamed, 3);
    }

    #[tokio::test]
    async fn renderer_launch_failure_aborts_the_run() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/ok"))
                .times(..)
                .respond_with(status_code(200).body(PAGE)),
        );
        let driver = Server::run();
        broken_webdriver(&driver);
        let session = session_for(&driver);

        let targets = vec![site.url("/ok").to_string(); 3];
        let mut cfg = config(true);
        cfg.concurrency = 1;
        let (result, events) = crawl(targets, &cfg, session.clone()).await;
        assert!(matches!(result, Err(CrawlError::RendererUnavailable(_))));
        assert!(!events.iter().any(|e| matches!(e, CrawlEvent::Record(_))));
        assert_eq!(session.status().await, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn rendered_document_replaces_raw_when_js_enabled() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/spa"))
                .respond_with(status_code(200).insert_header("Server", "nginx").body(PAGE)),
        );
        let driver = Server::run();
        mock_webdriver(&driver, RENDERED);

        let (result, _) = crawl(
            vec![site.url("/spa").to_string()],
            &config(true),
            session_for(&driver),
        )
        .await;
        let records = result.unwrap();
        let record = &records[0];
        assert_eq!(record.raw_html(), PAGE);
        assert_eq!(record.rendered_html(), RENDERED);
        assert_eq!(record.size_bytes, PAGE.len());
        assert_eq!(record.technologies, vec!["Nginx"]);
        assert!(record.errors.is_empty());
        assert!(!record.used_render_fallback);
    }

    #[tokio::test]
    async fn failed_fetch_falls_back_to_browser_for_both_documents() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/blocked"))
                .respond_with(status_code(403).insert_header("Server", "cloudflare")),
        );
        let driver = Server::run();
        mock_webdriver(&driver, RENDERED);

        let (result, _) = crawl(
            vec![site.url("/blocked").to_string()],
            &config(true),
            session_for(&driver),
        )
        .await;
        let records = result.unwrap();
        let record = &records[0];
        assert!(record.used_render_fallback);
        assert_eq!(record.status_code, 403);
        assert_eq!(record.rendered_html(), RENDERED);
        assert_eq!(record.raw_html(), RENDERED);
        assert_eq!(record.size_bytes, RENDERED.len());
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.technologies, vec!["Cloudflare"]);
    }

    #[tokio::test]
    async fn page_render_failure_keeps_raw_as_rendered() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/page"))
                .respond_with(status_code(200).body(PAGE)),
        );
        let driver = Server::run();
        driver.expect(
            Expectation::matching(request::method_path("POST", "/session")).respond_with(
                json_encoded(serde_json::json!({ "value": { "sessionId": "s-1" } })),
            ),
        );
        driver.expect(
            Expectation::matching(request::method_path("POST", "/session/s-1/timeouts"))
                .respond_with(json_encoded(serde_json::json!({ "value": null }))),
        );
        driver.expect(
            Expectation::matching(request::method_path("POST", "/session/s-1/url"))
                .respond_with(status_code(500).body("boom")),
        );
        driver.expect(
            Expectation::matching(request::method_path("DELETE", "/session/s-1"))
                .respond_with(json_encoded(serde_json::json!({ "value": null }))),
        );

        let (result, _) = crawl(
            vec![site.url("/page").to_string()],
            &config(true),
            session_for(&driver),
        )
        .await;
        let records = result.unwrap();
        let record = &records[0];
        assert_eq!(record.rendered_html(), record.raw_html());
        assert_eq!(record.js_percentage, 0.0);
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].starts_with("render failed"));
    }

    #[tokio::test]
    async fn blank_targets_are_skipped() {
        let (result, _) = crawl(
            vec![String::new(), "   ".to_string(), "\t\n".to_string()],
            &config(false),
            offline_session(),
        )
        .await;
        assert!(result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(true));
        let records = run_crawl(
            vec!["http://127.0.0.1:9/".to_string(); 4],
            &config(false),
            build_fetch_client(Duration::from_secs(1)).unwrap(),
            offline_session(),
            cancel,
            tx,
        )
        .await
        .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_without_js_has_no_documents() {
        let cfg = config(false);
        let client = build_fetch_client(cfg.timeout).unwrap();
        let record = crawl_single_url(
            "http://127.0.0.1:9/".to_string(),
            &cfg,
            &client,
            &offline_session(),
        )
        .await
        .unwrap();
        assert_eq!(record.status_code, 0);
        assert!(!record.has_documents());
        assert!(!record.used_render_fallback);
        assert_eq!(record.errors.len(), 1);
    }

    #[tokio::test]
    async fn queued_tasks_do_not_spend_budget_waiting_for_the_browser() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/ok"))
                .times(4)
                .respond_with(status_code(200).body(PAGE)),
        );
        let driver = Server::run();
        mock_webdriver(&driver, RENDERED);

        // Renders are serialized, so the last task waits about three settle
        // windows for the browser; its own work stays well inside the budget.
        let cfg = CrawlConfig {
            timeout: Duration::from_secs(2),
            js_wait: Duration::from_secs(1),
            enable_js: true,
            concurrency: 4,
            task_grace: Duration::ZERO,
        };
        let targets = vec![site.url("/ok").to_string(); 4];
        let (result, _) = crawl(targets, &cfg, session_for(&driver)).await;
        let records = result.unwrap();
        assert_eq!(records.len(), 4);
        for record in &records {
            assert!(record.errors.is_empty(), "{}: {:?}", record.url, record.errors);
            assert_eq!(record.rendered_html(), RENDERED);
        }
    }

    #[tokio::test]
    async fn task_over_budget_becomes_minimal_record() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/slow-render"))
                .respond_with(status_code(200).body(PAGE)),
        );
        let driver = Server::run();
        driver.expect(
            Expectation::matching(request::method_path("POST", "/session")).respond_with(
                json_encoded(serde_json::json!({ "value": { "sessionId": "s-1" } })),
            ),
        );
        driver.expect(
            Expectation::matching(request::method_path("POST", "/session/s-1/timeouts"))
                .respond_with(json_encoded(serde_json::json!({ "value": null }))),
        );
        driver.expect(
            Expectation::matching(request::method_path("POST", "/session/s-1/url")).respond_with(
                delay_and_then(
                    Duration::from_millis(1500),
                    json_encoded(serde_json::json!({ "value": null })),
                ),
            ),
        );
        driver.expect(
            Expectation::matching(request::method_path("DELETE", "/session/s-1"))
                .respond_with(json_encoded(serde_json::json!({ "value": null }))),
        );

        let cfg = CrawlConfig {
            timeout: Duration::from_secs(1),
            js_wait: Duration::ZERO,
            enable_js: true,
            concurrency: 1,
            task_grace: Duration::ZERO,
        };
        let (result, _) = crawl(
            vec![site.url("/slow-render").to_string()],
            &cfg,
            session_for(&driver),
        )
        .await;
        let records = result.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.url.ends_with("/slow-render"));
        assert_eq!(record.errors, vec!["task timed out after 1s".to_string()]);
        assert_eq!(record.status_code, 0);
        assert!(!record.has_documents());
        assert!(record.technologies.is_empty());
    }

    #[tokio::test]
    async fn panicked_task_becomes_failed_record() {
        let mut set: JoinSet<Result<CrawlRecord, CrawlError>> = JoinSet::new();
        let handle = set.spawn(async {
            let missing: Option<CrawlRecord> = None;
            Ok(missing.expect("analysis blew up"))
        });
        let mut in_flight = HashMap::from([(handle.id(), "https://a.test/".to_string())]);

        let joined = set.join_next_with_id().await.unwrap();
        let record = settle_task(joined, &mut in_flight).unwrap();
        assert_eq!(record.url, "https://a.test/");
        assert_eq!(record.errors.len(), 1);
        assert!(record.errors[0].starts_with("task failed"));
        assert!(in_flight.is_empty());
    }

    #[tokio::test]
    async fn cancel_after_dispatch_drops_in_flight_results() {
        let site = Server::run();
        site.expect(
            Expectation::matching(request::method_path("GET", "/slow")).respond_with(
                delay_and_then(Duration::from_millis(500), status_code(200).body(PAGE)),
            ),
        );
        // No expectations: the detached task must never reach the browser.
        let driver = Server::run();
        let session = session_for(&driver);

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::Relaxed);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let records = run_crawl(
            vec![site.url("/slow").to_string()],
            &config(true),
            build_fetch_client(Duration::from_secs(2)).unwrap(),
            session.clone(),
            cancel,
            tx,
        )
        .await
        .unwrap();
        assert!(records.is_empty());

        // Let the detached task finish its fetch and try to render.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(session.is_closed());
        assert_eq!(session.status().await, SessionStatus::Uninitialized);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(!events.iter().any(|e| matches!(e, CrawlEvent::Record(_))));
        assert!(matches!(events.last(), Some(CrawlEvent::Finished)));
    }
}
