//! Renderer session: one lazily launched browser shared by every crawl task.
//!
//! The session is an owned handle created at run start and passed to the
//! orchestrator. All browser work happens under a single async mutex, so
//! navigations are serialized while plain network fetches for other targets
//! keep running in parallel.

use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{Mutex, MutexGuard};

use super::error::RenderError;
use super::fetch::BROWSER_USER_AGENT;
use super::types::{BrowserArg, RenderedPage};
use super::webdriver::{
    find_free_local_port, start_webdriver, stop_webdriver, webdriver_capabilities,
    webdriver_create_session, webdriver_delete_session, webdriver_navigate, webdriver_reachable,
    webdriver_set_page_load_timeout, webdriver_snapshot,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How to reach (or start) the WebDriver endpoint.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub endpoint: String,
    pub driver_binary: Option<String>,
    pub driver_start_timeout: Duration,
    pub browser: BrowserArg,
    pub user_agent: String,
}

impl BrowserSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            driver_binary: None,
            driver_start_timeout: Duration::from_secs(12),
            browser: BrowserArg::Chrome,
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Ready,
    Failed,
}

struct Browser {
    endpoint: String,
    session_id: String,
    driver: Option<Child>,
}

enum SessionState {
    Uninitialized,
    Ready(Browser),
    Failed(String),
}

pub struct RenderSession {
    settings: BrowserSettings,
    client: reqwest::Client,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl RenderSession {
    pub fn new(settings: BrowserSettings) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            settings,
            client,
            state: Mutex::new(SessionState::Uninitialized),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn status(&self) -> SessionStatus {
        match &*self.state.lock().await {
            SessionState::Uninitialized => SessionStatus::Uninitialized,
            SessionState::Ready(_) => SessionStatus::Ready,
            SessionState::Failed(_) => SessionStatus::Failed,
        }
    }

    /// Waits for exclusive use of the browser. Time spent here is not part
    /// of any page budget; callers bound only the work done on the lease.
    pub async fn lease(&self) -> RenderLease<'_> {
        RenderLease {
            session: self,
            state: self.state.lock().await,
        }
    }

    /// Leases the browser and renders `url`. See [`RenderLease::render`].
    #[cfg(test)]
    pub async fn render(
        &self,
        url: &str,
        timeout: Duration,
        settle: Duration,
        capture_initial: bool,
    ) -> Result<RenderedPage, RenderError> {
        self.lease()
            .await
            .render(url, timeout, settle, capture_initial)
            .await
    }

    async fn launch(&self) -> Result<Browser, String> {
        let (endpoint, driver) = match &self.settings.driver_binary {
            Some(binary) => {
                let port = find_free_local_port()?;
                let child =
                    start_webdriver(binary, port, self.settings.driver_start_timeout).await?;
                (format!("http://127.0.0.1:{port}"), Some(child))
            }
            None => {
                if !webdriver_reachable(&self.settings.endpoint).await {
                    return Err(format!(
                        "webdriver endpoint {} is unreachable",
                        self.settings.endpoint
                    ));
                }
                (self.settings.endpoint.clone(), None)
            }
        };

        let caps = webdriver_capabilities(self.settings.browser, &self.settings.user_agent);
        match webdriver_create_session(&self.client, &endpoint, &caps).await {
            Ok(session_id) => Ok(Browser {
                endpoint,
                session_id,
                driver,
            }),
            Err(err) => {
                stop_webdriver(driver);
                Err(err)
            }
        }
    }

    async fn navigate_and_capture(
        &self,
        browser: &Browser,
        url: &str,
        timeout: Duration,
        settle: Duration,
        capture_initial: bool,
    ) -> Result<RenderedPage, RenderError> {
        let endpoint = browser.endpoint.as_str();
        let session_id = browser.session_id.as_str();

        if let Err(err) =
            webdriver_set_page_load_timeout(&self.client, endpoint, session_id, timeout).await
        {
            debug!("page load timeout not applied: {err}");
        }
        webdriver_navigate(&self.client, endpoint, session_id, url)
            .await
            .map_err(|reason| RenderError::Navigation {
                url: url.to_string(),
                reason,
            })?;

        let started = Instant::now();
        let initial = loop {
            let last_error = match webdriver_snapshot(&self.client, endpoint, session_id).await {
                Ok(snapshot) if snapshot.ready => break snapshot.html,
                Ok(_) => None,
                Err(err) => {
                    debug!("readiness poll for {url} failed: {err}");
                    Some(err)
                }
            };
            if started.elapsed() >= timeout {
                return Err(match last_error {
                    Some(err) => RenderError::Browser(err),
                    None => RenderError::ReadyTimeout {
                        url: url.to_string(),
                        waited: started.elapsed(),
                    },
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        };

        // Fixed settle window; no attempt to detect network idle.
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        let settled = webdriver_snapshot(&self.client, endpoint, session_id)
            .await
            .map_err(RenderError::Browser)?;

        Ok(RenderedPage {
            initial_html: capture_initial.then_some(initial),
            html: settled.html,
        })
    }

    /// Releases the browser and refuses every later render with a non-fatal
    /// [`RenderError::Browser`], so work still running after the crawl ends
    /// cannot launch another browser. A no-op on the browser when nothing
    /// was launched; close failures are logged and the instance is dropped
    /// regardless.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.closed.store(true, Ordering::Relaxed);
        self.release(&mut state).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    async fn release(&self, state: &mut SessionState) {
        let previous = std::mem::replace(state, SessionState::Uninitialized);
        match previous {
            SessionState::Ready(browser) => {
                if let Err(err) =
                    webdriver_delete_session(&self.client, &browser.endpoint, &browser.session_id)
                        .await
                {
                    warn!("closing browser session failed: {err}");
                }
                stop_webdriver(browser.driver);
                info!("browser session closed");
            }
            SessionState::Failed(err) => {
                *state = SessionState::Failed(err);
            }
            SessionState::Uninitialized => {}
        }
    }
}

/// Exclusive hold on the session's browser.
pub struct RenderLease<'a> {
    session: &'a RenderSession,
    state: MutexGuard<'a, SessionState>,
}

impl RenderLease<'_> {
    /// Navigates to `url`, waits up to `timeout` for a `<body>`, sleeps
    /// `settle` and returns the serialized document.
    ///
    /// A launch failure is returned as [`RenderError::Launch`] and leaves the
    /// session failed for good; every other error only concerns this page.
    pub async fn render(
        &mut self,
        url: &str,
        timeout: Duration,
        settle: Duration,
        capture_initial: bool,
    ) -> Result<RenderedPage, RenderError> {
        let session = self.session;
        if session.is_closed() {
            return Err(RenderError::Browser("session closed".to_string()));
        }
        if matches!(*self.state, SessionState::Uninitialized) {
            match session.launch().await {
                Ok(browser) => {
                    info!(
                        "browser session {} ready at {}",
                        browser.session_id, browser.endpoint
                    );
                    *self.state = SessionState::Ready(browser);
                }
                Err(err) => {
                    warn!("browser launch failed: {err}");
                    *self.state = SessionState::Failed(err.clone());
                    return Err(RenderError::Launch(err));
                }
            }
        }

        let browser = match &*self.state {
            SessionState::Ready(browser) => browser,
            SessionState::Failed(err) => return Err(RenderError::Launch(err.clone())),
            SessionState::Uninitialized => {
                return Err(RenderError::Browser("session not initialized".to_string()));
            }
        };
        session
            .navigate_and_capture(browser, url, timeout, settle, capture_initial)
            .await
    }
}
