//! Structural comparison of an original document against its rendered form.
//!
//! Two independent passes run over the same pair: a line diff of the
//! pretty-printed markup (where did things change) and an element-set diff
//! of the parsed trees (what was added).

pub mod classify;
pub mod elements;
pub mod matcher;
pub mod pretty;
pub mod unified;

use serde::Serialize;

use super::types::CrawlRecord;
use classify::{LineClass, classify_line};
use elements::{InjectionReport, find_injections};
use matcher::{OpTag, Opcode, SequenceMatcher};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffStatistics {
    pub original_lines: usize,
    pub rendered_lines: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub lines_modified: usize,
    pub similarity: f64,
    /// Replace runs in the line diff.
    pub structural_changes: usize,
    /// Added or modified rendered lines the classifier tagged as script.
    pub script_lines: usize,
    pub metadata_lines: usize,
    pub script_injections: usize,
    pub metadata_injections: usize,
    pub stylesheet_injections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineChange {
    Equal,
    Added,
    Removed,
    Modified,
}

/// One display row. Line numbers are 1-based; a side is `None` when the line
/// does not exist there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub change: LineChange,
    pub original_number: Option<usize>,
    pub rendered_number: Option<usize>,
    pub text: String,
    pub class: Option<LineClass>,
}

/// Rendered lines of every insert/replace run, bucketed by classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeInsights {
    pub scripts: Vec<String>,
    pub metadata: Vec<String>,
    pub styles: Vec<String>,
    pub content: Vec<String>,
}

impl ChangeInsights {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
            && self.metadata.is_empty()
            && self.styles.is_empty()
            && self.content.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DiffReport {
    pub stats: DiffStatistics,
    pub lines: Vec<DiffLine>,
    pub injections: InjectionReport,
    pub opcodes: Vec<Opcode>,
    original: Vec<String>,
    rendered: Vec<String>,
}

impl DiffReport {
    /// Computed fresh on every call; nothing is cached.
    pub fn compare(original_html: &str, rendered_html: &str) -> Self {
        let original = pretty::pretty_lines(original_html);
        let rendered = pretty::pretty_lines(rendered_html);
        let matcher = SequenceMatcher::new(&original, &rendered);
        let opcodes = matcher.opcodes();
        let injections = find_injections(original_html, rendered_html);

        let mut stats = DiffStatistics {
            original_lines: original.len(),
            rendered_lines: rendered.len(),
            similarity: matcher.ratio(),
            script_injections: injections.scripts.len(),
            metadata_injections: injections.metadata.len(),
            stylesheet_injections: injections.styles.len(),
            ..DiffStatistics::default()
        };
        let mut lines = Vec::with_capacity(original.len().max(rendered.len()));

        for code in &opcodes {
            match code.tag {
                OpTag::Equal => {
                    for offset in 0..code.a_len() {
                        lines.push(DiffLine {
                            change: LineChange::Equal,
                            original_number: Some(code.a_start + offset + 1),
                            rendered_number: Some(code.b_start + offset + 1),
                            text: rendered[code.b_start + offset].clone(),
                            class: None,
                        });
                    }
                }
                OpTag::Delete => {
                    stats.lines_removed += code.a_len();
                    push_original_side(&mut lines, &original, code, LineChange::Removed);
                }
                OpTag::Insert => {
                    stats.lines_added += code.b_len();
                    push_rendered_side(&mut lines, &mut stats, &rendered, code, LineChange::Added);
                }
                OpTag::Replace => {
                    stats.lines_modified += code.a_len().max(code.b_len());
                    stats.structural_changes += 1;
                    push_original_side(&mut lines, &original, code, LineChange::Modified);
                    push_rendered_side(
                        &mut lines,
                        &mut stats,
                        &rendered,
                        code,
                        LineChange::Modified,
                    );
                }
            }
        }

        Self {
            stats,
            lines,
            injections,
            opcodes,
            original,
            rendered,
        }
    }

    pub fn for_record(record: &CrawlRecord) -> Self {
        Self::compare(record.raw_html(), record.rendered_html())
    }

    pub fn display_lines(&self, changes_only: bool) -> impl Iterator<Item = &DiffLine> {
        self.lines
            .iter()
            .filter(move |line| !changes_only || line.change != LineChange::Equal)
    }

    pub fn insights(&self) -> ChangeInsights {
        let mut insights = ChangeInsights::default();
        for code in &self.opcodes {
            if !matches!(code.tag, OpTag::Insert | OpTag::Replace) {
                continue;
            }
            for line in &self.rendered[code.b_start..code.b_end] {
                let text = line.trim().to_string();
                match classify_line(line) {
                    LineClass::Script => insights.scripts.push(text),
                    LineClass::Metadata => insights.metadata.push(text),
                    LineClass::Stylesheet => insights.styles.push(text),
                    LineClass::Content => insights.content.push(text),
                }
            }
        }
        insights
    }

    pub fn unified(&self, context: usize) -> Vec<String> {
        unified::unified_diff(&self.original, &self.rendered, context)
    }
}

fn push_original_side(
    lines: &mut Vec<DiffLine>,
    original: &[String],
    code: &Opcode,
    change: LineChange,
) {
    for index in code.a_start..code.a_end {
        lines.push(DiffLine {
            change,
            original_number: Some(index + 1),
            rendered_number: None,
            text: original[index].clone(),
            class: None,
        });
    }
}

fn push_rendered_side(
    lines: &mut Vec<DiffLine>,
    stats: &mut DiffStatistics,
    rendered: &[String],
    code: &Opcode,
    change: LineChange,
) {
    for index in code.b_start..code.b_end {
        let class = classify_line(&rendered[index]);
        match class {
            LineClass::Script => stats.script_lines += 1,
            LineClass::Metadata => stats.metadata_lines += 1,
            _ => {}
        }
        lines.push(DiffLine {
            change,
            original_number: None,
            rendered_number: Some(index + 1),
            text: rendered[index].clone(),
            class: Some(class),
        });
    }
}
