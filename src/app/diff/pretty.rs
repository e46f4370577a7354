use scraper::{ElementRef, Html, Node};

const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];

/// Re-serializes `html` one node per line, indented one space per depth.
///
/// Attributes are sorted by name and whitespace-only text is dropped, so two
/// documents that differ only in formatting produce the same lines. Empty or
/// whitespace-only input produces no lines at all rather than the skeleton
/// the parser would synthesize.
pub fn pretty_lines(html: &str) -> Vec<String> {
    if html.trim().is_empty() {
        return Vec::new();
    }

    let doc = Html::parse_document(html);
    let mut lines = Vec::new();
    for child in doc.tree.root().children() {
        write_node(child.value(), ElementRef::wrap(child), 0, false, &mut lines);
    }
    lines
}

fn write_node(
    node: &Node,
    element: Option<ElementRef<'_>>,
    depth: usize,
    raw_text: bool,
    lines: &mut Vec<String>,
) {
    match node {
        Node::Doctype(doctype) => {
            lines.push(format!("{}<!DOCTYPE {}>", indent(depth), doctype.name()));
        }
        Node::Comment(comment) => {
            let body = comment.split_whitespace().collect::<Vec<_>>().join(" ");
            lines.push(format!("{}<!-- {} -->", indent(depth), body));
        }
        Node::Text(text) => {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if raw_text {
                    lines.push(format!("{}{}", indent(depth), line));
                } else {
                    lines.push(format!("{}{}", indent(depth), escape_text(line)));
                }
            }
        }
        Node::Element(_) => {
            if let Some(element) = element {
                write_element(element, depth, lines);
            }
        }
        _ => {}
    }
}

fn write_element(element: ElementRef<'_>, depth: usize, lines: &mut Vec<String>) {
    let name = element.value().name();
    lines.push(format!("{}{}", indent(depth), open_tag(element)));
    if VOID_ELEMENTS.contains(&name) {
        return;
    }

    let raw_text = RAW_TEXT_ELEMENTS.contains(&name);
    for child in element.children() {
        write_node(
            child.value(),
            ElementRef::wrap(child),
            depth + 1,
            raw_text,
            lines,
        );
    }
    lines.push(format!("{}</{}>", indent(depth), name));
}

fn open_tag(element: ElementRef<'_>) -> String {
    let mut attrs = element.value().attrs().collect::<Vec<_>>();
    attrs.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(b.1)));

    let mut tag = format!("<{}", element.value().name());
    for (name, value) in attrs {
        tag.push(' ');
        tag.push_str(name);
        tag.push_str("=\"");
        tag.push_str(&escape_attr(value));
        tag.push('"');
    }
    tag.push('>');
    tag
}

fn indent(depth: usize) -> String {
    " ".repeat(depth)
}

fn escape_text(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(input: &str) -> String {
    input.replace('&', "&amp;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_one_node_per_line() {
        let lines = pretty_lines("<html><body><p>Hi</p></body></html>");
        assert_eq!(
            lines,
            vec![
                "<html>", " <head>", " </head>", " <body>", "  <p>", "   Hi", "  </p>",
                " </body>", "</html>",
            ]
        );
    }

    #[test]
    fn formatting_noise_is_removed() {
        let a = pretty_lines(r#"<div   class="x"  id="a">  Hello  </div>"#);
        let b = pretty_lines("<div id=\"a\" class=\"x\">\n\nHello\n</div>");
        assert_eq!(a, b);
        assert!(a.contains(&"  <div class=\"x\" id=\"a\">".to_string()));
    }

    #[test]
    fn void_and_raw_text_elements() {
        let lines = pretty_lines(
            r#"<html><head><meta charset="utf-8"><script>if (a < b) { go(); }</script></head></html>"#,
        );
        assert!(lines.contains(&"  <meta charset=\"utf-8\">".to_string()));
        assert!(!lines.iter().any(|l| l.trim() == "</meta>"));
        assert!(lines.contains(&"   if (a < b) { go(); }".to_string()));
    }

    #[test]
    fn doctype_comment_and_escaping() {
        let html = "<!doctype html><html><body><!-- a\n b --><p>1 &lt; 2</p></body></html>";
        let lines = pretty_lines(html);
        assert_eq!(lines[0], "<!DOCTYPE html>");
        assert!(lines.contains(&"  <!-- a b -->".to_string()));
        assert!(lines.contains(&"   1 &lt; 2".to_string()));
    }

    #[test]
    fn empty_input_has_no_lines() {
        assert!(pretty_lines("").is_empty());
        assert!(pretty_lines(" \n\t").is_empty());
    }

    #[test]
    fn output_is_deterministic() {
        let html = r#"<html><head><title>T</title><link rel="stylesheet" href="/a.css"></head><body><div data-b="2" data-a="1">x</div></body></html>"#;
        assert_eq!(pretty_lines(html), pretty_lines(html));
    }
}
