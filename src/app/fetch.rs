use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use url::Url;

use super::error::FetchError;
use super::types::FetchOutcome;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";

/// Client for the unrendered fetch. Compression is negotiated by reqwest
/// itself so bodies arrive decoded.
pub fn build_fetch_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .pool_max_idle_per_host(8)
        .build()
}

/// Single GET of `url`, no retries. Non-2xx and transport failures both
/// come back as errors so the caller can fall back to the browser.
pub async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<FetchOutcome, FetchError> {
    let parsed = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let started = Instant::now();
    let res = client
        .get(parsed)
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;
    let status = res.status();
    if !status.is_success() {
        let elapsed = started.elapsed();
        debug!("fetch {url} returned HTTP {}", status.as_u16());
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            elapsed,
            headers: header_map_to_owned(res.headers()),
        });
    }

    let headers = header_map_to_owned(res.headers());
    let body = res.text().await.map_err(|source| FetchError::Transport {
        url: url.to_string(),
        source,
    })?;
    let elapsed = started.elapsed();

    Ok(FetchOutcome {
        status: status.as_u16(),
        elapsed,
        body,
        headers,
    })
}

fn header_map_to_owned(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

/// Fetches a sitemap once and returns every `<loc>` it lists. Failures are
/// logged and produce an empty list.
pub async fn fetch_sitemap_urls(client: &reqwest::Client, sitemap_url: &str) -> Vec<String> {
    let text = match client.get(sitemap_url).send().await {
        Ok(res) if res.status().is_success() => match res.text().await {
            Ok(text) => text,
            Err(err) => {
                warn!("sitemap {sitemap_url} body read failed: {err}");
                return Vec::new();
            }
        },
        Ok(res) => {
            warn!("sitemap {sitemap_url} returned HTTP {}", res.status().as_u16());
            return Vec::new();
        }
        Err(err) => {
            warn!("sitemap {sitemap_url} request failed: {err}");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let urls = extract_xml_loc_values(&text)
        .into_iter()
        .filter(|loc| seen.insert(loc.clone()))
        .collect::<Vec<_>>();
    info!("found {} URLs in sitemap {sitemap_url}", urls.len());
    urls
}

pub fn extract_xml_loc_values(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    while let Some(open_idx) = xml[start..].find("<loc>") {
        let open = start + open_idx + 5;
        let Some(close_rel) = xml[open..].find("</loc>") else {
            break;
        };
        let close = open + close_rel;
        let value = xml[open..close].trim();
        if !value.is_empty() {
            out.push(value.replace("&amp;", "&"));
        }
        start = close + 6;
    }
    out
}
