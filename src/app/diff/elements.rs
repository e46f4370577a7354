use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

const EVENT_ATTRIBUTES: [&str; 6] = [
    "onclick",
    "onload",
    "onmouseover",
    "onmouseout",
    "onchange",
    "onsubmit",
];

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionKind {
    Script,
    Metadata,
    Stylesheet,
}

/// An element present in the rendered document but not in the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Injection {
    pub kind: InjectionKind,
    pub tag: String,
    pub description: String,
    pub preview: String,
    pub content: String,
    /// Script `src`, stylesheet `href`, or `"inline"`.
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InjectionReport {
    pub scripts: Vec<Injection>,
    pub metadata: Vec<Injection>,
    pub styles: Vec<Injection>,
}

impl InjectionReport {
    pub fn total(&self) -> usize {
        self.scripts.len() + self.metadata.len() + self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Element-set differences between two documents. Positions are ignored:
/// an element counts as injected only when no identical serialization exists
/// anywhere in the original.
pub fn find_injections(original_html: &str, rendered_html: &str) -> InjectionReport {
    let original = Html::parse_document(original_html);
    let rendered = Html::parse_document(rendered_html);

    let mut scripts = injected_elements(&original, &rendered, "script")
        .into_iter()
        .map(script_injection)
        .collect::<Vec<_>>();
    scripts.extend(injected_event_handlers(&original, &rendered));

    let metadata = injected_elements(&original, &rendered, "meta")
        .into_iter()
        .map(meta_injection)
        .collect();

    let styles = injected_elements(&original, &rendered, "style, link[rel~=\"stylesheet\"]")
        .into_iter()
        .map(style_injection)
        .collect();

    InjectionReport {
        scripts,
        metadata,
        styles,
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

/// Rendered elements matching `selector` whose serialization is absent from
/// the original, in document order and without repeats.
fn injected_elements<'a>(
    original: &Html,
    rendered: &'a Html,
    selector: &str,
) -> Vec<ElementRef<'a>> {
    let Some(selector) = parse_selector(selector) else {
        return Vec::new();
    };
    let existing = original
        .select(&selector)
        .map(|el| el.html())
        .collect::<HashSet<_>>();
    let mut seen = HashSet::new();
    rendered
        .select(&selector)
        .filter(|el| {
            let html = el.html();
            !existing.contains(&html) && seen.insert(html)
        })
        .collect()
}

fn injected_event_handlers(original: &Html, rendered: &Html) -> Vec<Injection> {
    let mut out = Vec::new();
    for attr in EVENT_ATTRIBUTES {
        let Some(selector) = parse_selector(&format!("[{attr}]")) else {
            continue;
        };
        let existing = original
            .select(&selector)
            .filter_map(|el| el.value().attr(attr))
            .collect::<HashSet<_>>();
        let mut seen = HashSet::new();
        for el in rendered.select(&selector) {
            let Some(value) = el.value().attr(attr) else {
                continue;
            };
            if existing.contains(value) || !seen.insert(value) {
                continue;
            }
            let tag = el.value().name().to_string();
            out.push(Injection {
                kind: InjectionKind::Script,
                description: format!("Inline {attr} handler on <{tag}>"),
                tag,
                preview: truncate_preview(value),
                content: value.to_string(),
                source: Some("inline".to_string()),
            });
        }
    }
    out
}

fn script_injection(el: ElementRef<'_>) -> Injection {
    let body = el.inner_html();
    match el.value().attr("src") {
        Some(src) => Injection {
            kind: InjectionKind::Script,
            tag: "script".to_string(),
            description: format!("External script: {src}"),
            preview: truncate_preview(&el.html()),
            content: el.html(),
            source: Some(src.to_string()),
        },
        None => Injection {
            kind: InjectionKind::Script,
            tag: "script".to_string(),
            description: format!("Inline script ({} chars)", body.trim().chars().count()),
            preview: truncate_preview(body.trim()),
            content: el.html(),
            source: Some("inline".to_string()),
        },
    }
}

fn meta_injection(el: ElementRef<'_>) -> Injection {
    let value = el.value();
    let key = value
        .attr("name")
        .or_else(|| value.attr("property"))
        .or_else(|| value.attr("http-equiv"))
        .or_else(|| value.attr("charset").map(|_| "charset"))
        .unwrap_or("meta");
    let content = value
        .attr("content")
        .or_else(|| value.attr("charset"))
        .unwrap_or_default();
    Injection {
        kind: InjectionKind::Metadata,
        tag: "meta".to_string(),
        description: format!("Meta {key}: {}", truncate_preview(content)),
        preview: truncate_preview(&el.html()),
        content: el.html(),
        source: None,
    }
}

fn style_injection(el: ElementRef<'_>) -> Injection {
    let tag = el.value().name().to_string();
    if tag == "link" {
        let href = el.value().attr("href").unwrap_or_default().to_string();
        Injection {
            kind: InjectionKind::Stylesheet,
            description: format!("Stylesheet link: {href}"),
            tag,
            preview: truncate_preview(&el.html()),
            content: el.html(),
            source: Some(href),
        }
    } else {
        let body = el.inner_html();
        Injection {
            kind: InjectionKind::Stylesheet,
            description: format!("Inline style block ({} chars)", body.trim().chars().count()),
            tag,
            preview: truncate_preview(body.trim()),
            content: el.html(),
            source: Some("inline".to_string()),
        }
    }
}

fn truncate_preview(input: &str) -> String {
    if input.chars().count() <= PREVIEW_CHARS {
        return input.to_string();
    }
    let mut out = input.chars().take(PREVIEW_CHARS).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_script_is_reported_once() {
        let report = find_injections(
            "<html><body><p>Hi</p></body></html>",
            "<html><body><p>Hi</p><script>alert(1)</script></body></html>",
        );
        assert_eq!(report.scripts.len(), 1);
        let script = &report.scripts[0];
        assert_eq!(script.source.as_deref(), Some("inline"));
        assert_eq!(script.preview, "alert(1)");
        assert_eq!(script.content, "<script>alert(1)</script>");
        assert!(report.metadata.is_empty());
        assert!(report.styles.is_empty());
    }

    #[test]
    fn only_new_meta_is_reported() {
        let report = find_injections(
            r#"<html><head><meta name="description" content="A"></head></html>"#,
            r#"<html><head><meta name="description" content="A"><meta property="og:title" content="B"></head></html>"#,
        );
        assert_eq!(report.metadata.len(), 1);
        assert_eq!(report.metadata[0].description, "Meta og:title: B");
        assert!(report.scripts.is_empty());
    }

    #[test]
    fn moved_elements_are_not_injections() {
        let report = find_injections(
            r#"<html><head><script src="/a.js"></script></head><body><p>x</p></body></html>"#,
            r#"<html><head></head><body><p>x</p><script src="/a.js"></script></body></html>"#,
        );
        assert!(report.is_empty());
    }

    #[test]
    fn external_scripts_and_styles_carry_their_source() {
        let report = find_injections(
            "<html><head></head><body></body></html>",
            r#"<html><head>
                <script src="https://cdn.test/app.js"></script>
                <link rel="preload stylesheet" href="/late.css">
                <link rel="icon" href="/favicon.ico">
                <style>body { color: red }</style>
            </head><body></body></html>"#,
        );
        assert_eq!(report.scripts.len(), 1);
        assert_eq!(report.scripts[0].source.as_deref(), Some("https://cdn.test/app.js"));
        assert_eq!(report.styles.len(), 2);
        assert_eq!(report.styles[0].source.as_deref(), Some("/late.css"));
        assert_eq!(report.styles[1].source.as_deref(), Some("inline"));
        assert_eq!(report.styles[1].tag, "style");
    }

    #[test]
    fn event_handlers_compare_values_per_attribute() {
        let report = find_injections(
            r#"<html><body><button onclick="go()">a</button></body></html>"#,
            r#"<html><body>
                <button onclick="go()" class="x">a</button>
                <a href="/" onclick="track()">b</a>
                <img src="i.png" onload="go()">
            </body></html>"#,
        );
        let handlers = report
            .scripts
            .iter()
            .map(|i| i.description.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            handlers,
            vec!["Inline onclick handler on <a>", "Inline onload handler on <img>"]
        );
    }

    #[test]
    fn identical_documents_have_no_injections() {
        let html = r#"<html><head><meta charset="utf-8"><style>p{}</style></head><body><script>x()</script></body></html>"#;
        assert!(find_injections(html, html).is_empty());
    }

    #[test]
    fn long_previews_are_truncated() {
        let body = "x".repeat(250);
        let report = find_injections(
            "<html></html>",
            &format!("<html><body><script>{body}</script></body></html>"),
        );
        assert_eq!(report.scripts[0].preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(report.scripts[0].content.contains(&body));
    }
}
