use std::fs::{self, File};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use log::debug;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use url::{Host, Url};

use super::types::BrowserArg;

pub const WINDOW_WIDTH: u32 = 1920;
pub const WINDOW_HEIGHT: u32 = 1080;

/// One `document` snapshot returned by the page script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub ready: bool,
    pub html: String,
}

/// Headless capabilities with images, popups and notifications suppressed.
pub fn webdriver_capabilities(browser: BrowserArg, user_agent: &str) -> Value {
    match browser {
        BrowserArg::Firefox => {
            let args = vec![
                "-headless".to_string(),
                format!("--width={WINDOW_WIDTH}"),
                format!("--height={WINDOW_HEIGHT}"),
            ];
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": {
                            "args": args,
                            "prefs": {
                                "general.useragent.override": user_agent,
                                "permissions.default.image": 2,
                                "dom.disable_open_during_load": true,
                                "dom.webnotifications.enabled": false,
                                "browser.cache.disk.enable": false
                            }
                        }
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = vec![
                "--headless=new".to_string(),
                "--disable-gpu".to_string(),
                "--disable-dev-shm-usage".to_string(),
                format!("--window-size={WINDOW_WIDTH},{WINDOW_HEIGHT}"),
                format!("--user-agent={user_agent}"),
                "--no-first-run".to_string(),
                "--no-default-browser-check".to_string(),
                "--disable-crash-reporter".to_string(),
            ];
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": {
                            "args": args,
                            "prefs": {
                                "profile.managed_default_content_settings.images": 2,
                                "profile.default_content_settings.popups": 0,
                                "profile.default_content_setting_values.notifications": 2
                            }
                        }
                    }
                }
            })
        }
    }
}

pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    format!("{}...", input.chars().take(max_chars).collect::<String>())
}

async fn send_command(request: reqwest::RequestBuilder, step: &str) -> Result<Value, String> {
    let res = request
        .send()
        .await
        .map_err(|e| format!("{step} request failed: {e}"))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| format!("{step} response read failed: {e}"))?;
    if !status.is_success() {
        return Err(format!(
            "{step} HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&body, 240)
        ));
    }

    let value: Value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&body).map_err(|e| format!("{step} parse failed: {e}"))?
    };
    if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = value
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        return Err(format!("{err}: {message}"));
    }
    Ok(value)
}

fn session_url(endpoint: &str, session_id: &str, tail: &str) -> String {
    format!(
        "{}/session/{}{}",
        endpoint.trim_end_matches('/'),
        session_id,
        tail
    )
}

pub async fn webdriver_create_session(
    client: &reqwest::Client,
    endpoint: &str,
    capabilities: &Value,
) -> Result<String, String> {
    let session_endpoint = format!("{}/session", endpoint.trim_end_matches('/'));
    let request = client.post(&session_endpoint).json(capabilities);
    let value = send_command(request, "session create").await?;
    value
        .pointer("/value/sessionId")
        .and_then(|v| v.as_str())
        .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .ok_or_else(|| {
            format!(
                "session id missing in response: {}",
                truncate_for_log(&value.to_string(), 220)
            )
        })
}

pub async fn webdriver_set_page_load_timeout(
    client: &reqwest::Client,
    endpoint: &str,
    session_id: &str,
    timeout: Duration,
) -> Result<(), String> {
    let url = session_url(endpoint, session_id, "/timeouts");
    let body = json!({ "pageLoad": timeout.as_millis() as u64 });
    send_command(client.post(url).json(&body), "set timeouts").await?;
    Ok(())
}

pub async fn webdriver_navigate(
    client: &reqwest::Client,
    endpoint: &str,
    session_id: &str,
    url: &str,
) -> Result<(), String> {
    let nav_endpoint = session_url(endpoint, session_id, "/url");
    send_command(client.post(nav_endpoint).json(&json!({ "url": url })), "navigate").await?;
    Ok(())
}

/// Serializes the current document. `ready` reports whether a `<body>`
/// element exists yet.
pub async fn webdriver_snapshot(
    client: &reqwest::Client,
    endpoint: &str,
    session_id: &str,
) -> Result<DocumentSnapshot, String> {
    let exec_endpoint = session_url(endpoint, session_id, "/execute/sync");
    let script = r#"
        return {
            ready: !!document.body,
            html: document.documentElement ? document.documentElement.outerHTML : ""
        };
    "#;
    let value = send_command(
        client
            .post(exec_endpoint)
            .json(&json!({ "script": script, "args": [] })),
        "execute snapshot",
    )
    .await?;

    let ready = value
        .pointer("/value/ready")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let html = value
        .pointer("/value/html")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(DocumentSnapshot { ready, html })
}

pub async fn webdriver_delete_session(
    client: &reqwest::Client,
    endpoint: &str,
    session_id: &str,
) -> Result<(), String> {
    let delete_endpoint = session_url(endpoint, session_id, "");
    send_command(client.delete(delete_endpoint), "delete session").await?;
    Ok(())
}

/// True when a TCP connection to the endpoint's host and port succeeds.
/// IP literals (including bracketed IPv6) are connected to directly.
pub async fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(9515);
    let addr = match parsed.host() {
        Some(Host::Ipv4(ip)) => SocketAddr::new(IpAddr::V4(ip), port).to_string(),
        Some(Host::Ipv6(ip)) => SocketAddr::new(IpAddr::V6(ip), port).to_string(),
        Some(Host::Domain(domain)) => format!("{domain}:{port}"),
        None => return false,
    };
    matches!(
        tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

pub fn find_free_local_port() -> Result<u16, String> {
    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|e| format!("free port bind failed: {e}"))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| format!("local addr failed: {e}"))
}

fn configure_webdriver_command(cmd: &mut Command, bin: &str, port: u16) {
    let lower = bin.to_ascii_lowercase();
    if lower.contains("geckodriver") {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

fn webdriver_log_path(port: u16) -> Result<PathBuf, String> {
    let dir = std::env::temp_dir().join("rendiff");
    fs::create_dir_all(&dir).map_err(|e| format!("log dir create failed: {e}"))?;
    Ok(dir.join(format!("webdriver-{port}.log")))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let mut tail = text.lines().rev().take(lines.max(1)).collect::<Vec<_>>();
    tail.reverse();
    let tail = tail.join(" | ");
    if tail.is_empty() { None } else { Some(tail) }
}

/// Spawns a local driver binary and waits for its port to accept
/// connections.
pub async fn start_webdriver(
    binary: &str,
    port: u16,
    start_timeout: Duration,
) -> Result<Child, String> {
    let endpoint = format!("http://127.0.0.1:{port}");
    let log_path = webdriver_log_path(port)?;
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .map_err(|e| format!("failed to open webdriver log {}: {e}", log_path.display()))?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| format!("failed to clone webdriver log handle: {e}"))?;

    let mut cmd = Command::new(binary);
    configure_webdriver_command(&mut cmd, binary, port);
    cmd.stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null());
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn {binary}: {e}"))?;
    debug!("spawned {binary} on port {port}");

    let steps = (start_timeout.as_millis() / 200).max(1);
    for _ in 0..steps {
        if webdriver_reachable(&endpoint).await {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut err = format!(
                "{binary} exited early with status {status} (log: {})",
                log_path.display()
            );
            if let Some(tail) = read_log_tail(&log_path, 30) {
                err = format!("{err}; tail: {tail}");
            }
            return Err(err);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = child.kill();
    let _ = child.wait();
    let mut err = format!(
        "{binary} did not become ready in time (log: {})",
        log_path.display()
    );
    if let Some(tail) = read_log_tail(&log_path, 30) {
        err = format!("{err}; tail: {tail}");
    }
    Err(err)
}

pub fn stop_webdriver(mut child: Option<Child>) {
    if let Some(ref mut c) = child {
        let _ = c.kill();
        let _ = c.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};

    #[test]
    fn chrome_capabilities_are_headless_and_quiet() {
        let caps = webdriver_capabilities(BrowserArg::Chrome, "UA/1.0");
        let args = caps
            .pointer("/capabilities/alwaysMatch/goog:chromeOptions/args")
            .and_then(|v| v.as_array())
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>();
        assert!(args.contains(&"--headless=new"));
        assert!(args.contains(&"--window-size=1920,1080"));
        assert!(args.contains(&"--user-agent=UA/1.0"));
        assert_eq!(
            caps.pointer(
                "/capabilities/alwaysMatch/goog:chromeOptions/prefs/profile.managed_default_content_settings.images"
            ),
            Some(&json!(2))
        );
    }

    #[test]
    fn firefox_capabilities_override_user_agent() {
        let caps = webdriver_capabilities(BrowserArg::Firefox, "UA/2.0");
        assert_eq!(
            caps.pointer(
                "/capabilities/alwaysMatch/moz:firefoxOptions/prefs/general.useragent.override"
            ),
            Some(&json!("UA/2.0"))
        );
    }

    #[test]
    fn truncation_marks_cut_text() {
        assert_eq!(truncate_for_log("abc", 5), "abc");
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
    }

    #[tokio::test]
    async fn session_id_is_read_from_value() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/session")).respond_with(
                json_encoded(json!({ "value": { "sessionId": "s-1", "capabilities": {} } })),
            ),
        );
        let client = reqwest::Client::new();
        let endpoint = server.url_str("");
        let caps = webdriver_capabilities(BrowserArg::Chrome, "UA");
        let id = webdriver_create_session(&client, &endpoint, &caps).await.unwrap();
        assert_eq!(id, "s-1");
    }

    #[tokio::test]
    async fn webdriver_error_payload_becomes_err() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/session/s-1/url")).respond_with(
                json_encoded(json!({
                    "value": { "error": "timeout", "message": "page load timed out" }
                })),
            ),
        );
        let client = reqwest::Client::new();
        let err = webdriver_navigate(&client, &server.url_str(""), "s-1", "https://a.test/")
            .await
            .unwrap_err();
        assert_eq!(err, "timeout: page load timed out");
    }

    #[tokio::test]
    async fn snapshot_reports_readiness_and_html() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/session/s-1/execute/sync"))
                .respond_with(json_encoded(json!({
                    "value": { "ready": true, "html": "<html><body></body></html>" }
                }))),
        );
        let client = reqwest::Client::new();
        let snapshot = webdriver_snapshot(&client, &server.url_str(""), "s-1")
            .await
            .unwrap();
        assert!(snapshot.ready);
        assert_eq!(snapshot.html, "<html><body></body></html>");
    }

    #[tokio::test]
    async fn ipv6_literal_endpoint_is_reachable() {
        let Ok(listener) = tokio::net::TcpListener::bind("[::1]:0").await else {
            // Host without IPv6 loopback.
            return;
        };
        let port = listener.local_addr().unwrap().port();
        assert!(webdriver_reachable(&format!("http://[::1]:{port}/")).await);
        assert!(webdriver_reachable(&format!("http://[::1]:{port}")).await);
    }

    #[tokio::test]
    async fn ipv4_literal_endpoint_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(webdriver_reachable(&format!("http://127.0.0.1:{port}")).await);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_detected() {
        assert!(!webdriver_reachable("http://127.0.0.1:9").await);
        assert!(!webdriver_reachable("not a url").await);
    }
}
