use super::matcher::{OpTag, SequenceMatcher};

pub const ORIGINAL_LABEL: &str = "Original HTML";
pub const RENDERED_LABEL: &str = "Rendered HTML";

/// Unified diff lines without trailing newlines. Identical inputs produce an
/// empty vector, headers included.
pub fn unified_diff(original: &[String], rendered: &[String], context: usize) -> Vec<String> {
    let matcher = SequenceMatcher::new(original, rendered);
    let mut out = Vec::new();
    for group in matcher.grouped_opcodes(context) {
        if out.is_empty() {
            out.push(format!("--- {ORIGINAL_LABEL}"));
            out.push(format!("+++ {RENDERED_LABEL}"));
        }
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        out.push(format!(
            "@@ -{} +{} @@",
            format_range(first.a_start, last.a_end),
            format_range(first.b_start, last.b_end)
        ));
        for code in &group {
            if code.tag == OpTag::Equal {
                for line in &original[code.a_start..code.a_end] {
                    out.push(format!(" {line}"));
                }
                continue;
            }
            if matches!(code.tag, OpTag::Replace | OpTag::Delete) {
                for line in &original[code.a_start..code.a_end] {
                    out.push(format!("-{line}"));
                }
            }
            if matches!(code.tag, OpTag::Replace | OpTag::Insert) {
                for line in &rendered[code.b_start..code.b_end] {
                    out.push(format!("+{line}"));
                }
            }
        }
    }
    out
}

fn format_range(start: usize, stop: usize) -> String {
    let length = stop - start;
    match length {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, length),
    }
}
