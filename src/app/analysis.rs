use std::collections::HashMap;
use std::time::Duration;

use scraper::{Html, Selector};

use super::types::{CrawlRecord, PageIssue, SeoData};

const SCRIPT_TECHNOLOGIES: [(&str, &str); 4] = [
    ("react", "React"),
    ("vue", "Vue.js"),
    ("angular", "Angular"),
    ("jquery", "jQuery"),
];

const SERVER_TECHNOLOGIES: [(&str, &str); 3] = [
    ("nginx", "Nginx"),
    ("apache", "Apache"),
    ("cloudflare", "Cloudflare"),
];

const SPA_FRAMEWORKS: [&str; 3] = ["React", "Vue.js", "Angular"];

/// Everything derived from one raw/rendered pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageAnalysis {
    pub js_additions: usize,
    pub js_percentage: f64,
    pub seo_data: SeoData,
    pub seo_score: u8,
    pub technologies: Vec<String>,
    pub spa_score: u8,
    pub is_spa: bool,
    pub speed_score: u8,
}

pub fn analyze_page(
    raw_html: &str,
    rendered_html: &str,
    headers: &HashMap<String, String>,
    response_time: Duration,
) -> PageAnalysis {
    let (js_additions, js_percentage) = script_growth(raw_html, rendered_html);
    let source = if rendered_html.is_empty() {
        raw_html
    } else {
        rendered_html
    };
    let doc = Html::parse_document(source);

    let seo_data = extract_seo_data(&doc);
    let seo_score = compute_seo_score(&seo_data);
    let technologies = detect_technologies(&doc, headers);
    let spa_score = compute_spa_score(js_percentage, &technologies, &doc);

    PageAnalysis {
        js_additions,
        js_percentage,
        seo_score,
        seo_data,
        is_spa: spa_score > 50,
        spa_score,
        technologies,
        speed_score: analyze_page_speed(response_time, raw_html.len()),
    }
}

pub fn apply_analysis(record: &mut CrawlRecord, analysis: PageAnalysis) {
    record.js_additions = analysis.js_additions;
    record.js_percentage = analysis.js_percentage;
    record.seo_data = analysis.seo_data;
    record.seo_score = analysis.seo_score;
    record.technologies = analysis.technologies;
    record.spa_score = analysis.spa_score;
    record.is_spa = analysis.is_spa;
    record.speed_score = analysis.speed_score;
}

/// Lines the rendered document gained over the raw one, and that growth as
/// a percentage of the rendered line count.
pub fn script_growth(raw_html: &str, rendered_html: &str) -> (usize, f64) {
    if rendered_html.is_empty() {
        return (0, 0.0);
    }
    let raw_lines = raw_html.matches('\n').count();
    let rendered_lines = rendered_html.matches('\n').count();
    let additions = rendered_lines.saturating_sub(raw_lines);
    let percentage = additions as f64 / rendered_lines.max(1) as f64 * 100.0;
    (additions, percentage.clamp(0.0, 100.0))
}

pub fn analyze_page_speed(response_time: Duration, size_bytes: usize) -> u8 {
    let mut score = 100i32;
    let secs = response_time.as_secs_f64();
    if secs > 3.0 {
        score -= 30;
    } else if secs > 1.0 {
        score -= 15;
    }

    if size_bytes > 1024 * 1024 {
        score -= 25;
    } else if size_bytes > 512 * 1024 {
        score -= 10;
    }
    score.max(0) as u8
}

pub fn compute_seo_score(seo: &SeoData) -> u8 {
    let mut score = 100i32;
    if seo.title.is_empty() {
        score -= 20;
    }
    if seo.meta_description.is_empty() {
        score -= 15;
    }
    if seo.h1_count != 1 {
        score -= 10;
    }
    if seo.images_without_alt > 0 {
        score -= 10;
    }
    score.max(0) as u8
}

fn extract_first_text(doc: &Html, selector: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    for el in doc.select(&selector) {
        let text = normalize_text(&el.text().collect::<Vec<_>>().join(" "));
        if !text.is_empty() {
            return text;
        }
    }

    String::new()
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_attr(doc: &Html, selector: &str, attr: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    doc.select(&selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn count_elements(doc: &Html, selector: &str) -> usize {
    Selector::parse(selector)
        .ok()
        .map(|sel| doc.select(&sel).count())
        .unwrap_or(0)
}

fn images_missing_alt(doc: &Html) -> usize {
    let Ok(selector) = Selector::parse("img") else {
        return 0;
    };
    doc.select(&selector)
        .filter(|el| el.value().attr("alt").unwrap_or_default().is_empty())
        .count()
}

fn link_breakdown(doc: &Html) -> (usize, usize) {
    let Ok(selector) = Selector::parse("a[href]") else {
        return (0, 0);
    };
    let mut internal = 0usize;
    let mut external = 0usize;
    for el in doc.select(&selector) {
        let href = el.value().attr("href").unwrap_or_default().trim();
        let lower = href.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            external += 1;
        } else {
            internal += 1;
        }
    }
    (internal, external)
}

fn count_words(doc: &Html) -> usize {
    doc.root_element()
        .text()
        .map(|chunk| chunk.split_whitespace().count())
        .sum()
}

/// SEO attributes of a parsed document; absent elements default to
/// empty/zero/false.
pub fn extract_seo_data(doc: &Html) -> SeoData {
    let (internal_links, external_links) = link_breakdown(doc);
    SeoData {
        title: extract_first_text(doc, "title"),
        meta_description: extract_attr(doc, "meta[name=\"description\"]", "content"),
        h1_count: count_elements(doc, "h1"),
        h2_count: count_elements(doc, "h2"),
        images_without_alt: images_missing_alt(doc),
        internal_links,
        external_links,
        word_count: count_words(doc),
        canonical_url: extract_attr(doc, "link[rel=\"canonical\"]", "href"),
        meta_robots: extract_attr(doc, "meta[name=\"robots\"]", "content"),
        og_title: extract_attr(doc, "meta[property=\"og:title\"]", "content"),
        og_description: extract_attr(doc, "meta[property=\"og:description\"]", "content"),
        schema_markup: count_elements(doc, "script[type=\"application/ld+json\"]") > 0,
    }
}

/// Substring hits against a fixed vocabulary. Repeats are kept: two React
/// bundles produce two entries.
pub fn detect_technologies(doc: &Html, headers: &HashMap<String, String>) -> Vec<String> {
    let mut technologies = Vec::new();

    if let Ok(selector) = Selector::parse("script[src]") {
        for el in doc.select(&selector) {
            let src = el.value().attr("src").unwrap_or_default().to_ascii_lowercase();
            if let Some((_, name)) = SCRIPT_TECHNOLOGIES
                .iter()
                .find(|(needle, _)| src.contains(needle))
            {
                technologies.push(name.to_string());
            }
        }
    }

    let server = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("server"))
        .map(|(_, value)| value.to_ascii_lowercase())
        .unwrap_or_default();
    if let Some((_, name)) = SERVER_TECHNOLOGIES
        .iter()
        .find(|(needle, _)| server.contains(needle))
    {
        technologies.push(name.to_string());
    }

    let html = doc.html().to_ascii_lowercase();
    if html.contains("wp-content") || html.contains("wordpress") {
        technologies.push("WordPress".to_string());
    } else if html.contains("drupal") {
        technologies.push("Drupal".to_string());
    } else if html.contains("joomla") {
        technologies.push("Joomla".to_string());
    }

    technologies
}

pub fn compute_spa_score(js_percentage: f64, technologies: &[String], doc: &Html) -> u8 {
    let mut score = 0u8;
    if js_percentage > 30.0 {
        score += 30;
    }
    if technologies
        .iter()
        .any(|tech| SPA_FRAMEWORKS.contains(&tech.as_str()))
    {
        score += 40;
    }
    if count_elements(doc, "div#root, div#app") > 0 {
        score += 30;
    }
    score
}

pub fn collect_page_issues(record: &CrawlRecord) -> Vec<PageIssue> {
    let mut issues = Vec::new();
    if record.status_code != 200 {
        issues.push(PageIssue::HttpStatus);
    }
    if record.response_time_ms > 3000 {
        issues.push(PageIssue::SlowResponse);
    }
    if record.speed_score < 50 {
        issues.push(PageIssue::PoorSpeedScore);
    }
    if record.seo_score < 70 {
        issues.push(PageIssue::LowSeoScore);
    }
    if record.seo_data.title.is_empty() {
        issues.push(PageIssue::MissingTitle);
    }
    if record.seo_data.meta_description.is_empty() {
        issues.push(PageIssue::MissingMetaDescription);
    }
    if record.js_percentage > 80.0 {
        issues.push(PageIssue::ExcessiveScriptModification);
    }
    issues
}
