use serde::Serialize;

/// What a changed markup line most likely carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineClass {
    Script,
    Metadata,
    Stylesheet,
    Content,
}

impl LineClass {
    pub fn label(self) -> &'static str {
        match self {
            LineClass::Script => "script",
            LineClass::Metadata => "metadata",
            LineClass::Stylesheet => "stylesheet",
            LineClass::Content => "content",
        }
    }
}

/// Substring heuristics over one serialized line, checked in priority order.
pub fn classify_line(line: &str) -> LineClass {
    let lower = line.to_ascii_lowercase();
    if lower.contains("<script") || lower.contains("javascript:") {
        LineClass::Script
    } else if lower.contains("<meta") || lower.contains("content=") {
        LineClass::Metadata
    } else if lower.contains("<style") || (lower.contains("<link") && lower.contains("stylesheet"))
    {
        LineClass::Stylesheet
    } else {
        LineClass::Content
    }
}
