use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpTag {
    Equal,
    Insert,
    Delete,
    Replace,
}

/// One alignment run: `a[a_start..a_end]` against `b[b_start..b_end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub tag: OpTag,
    pub a_start: usize,
    pub a_end: usize,
    pub b_start: usize,
    pub b_end: usize,
}

impl Opcode {
    fn new(tag: OpTag, a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> Self {
        Self {
            tag,
            a_start,
            a_end,
            b_start,
            b_end,
        }
    }

    pub fn a_len(&self) -> usize {
        self.a_end - self.a_start
    }

    pub fn b_len(&self) -> usize {
        self.b_end - self.b_start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Match {
    a: usize,
    b: usize,
    size: usize,
}

/// Sequences shorter than this never have popular elements.
const AUTOJUNK_MIN_LEN: usize = 200;

/// Ratcliff/Obershelp alignment: repeatedly takes the longest contiguous
/// matching block and recurses on both sides of it.
///
/// For `b` of 200 or more items, any item occurring more than
/// `len(b) / 100 + 1` times is "popular" and cannot start a match, though
/// matches still extend across it. On pretty-printed markup this keeps lines
/// such as `</div>` from making alignment quadratic.
pub struct SequenceMatcher<'a, T> {
    a: &'a [T],
    b: &'a [T],
    b2j: HashMap<&'a T, Vec<usize>>,
    matching_blocks: Vec<Match>,
}

/// Run lengths of the previous and current row, indexed by `j + 1`, plus
/// the slots each row wrote so they can be cleared without a full sweep.
struct RowScratch {
    prev: Vec<usize>,
    next: Vec<usize>,
    prev_set: Vec<usize>,
    next_set: Vec<usize>,
}

impl RowScratch {
    fn new(len: usize) -> Self {
        Self {
            prev: vec![0; len + 1],
            next: vec![0; len + 1],
            prev_set: Vec::new(),
            next_set: Vec::new(),
        }
    }

    fn advance(&mut self) {
        for &slot in &self.prev_set {
            self.prev[slot] = 0;
        }
        std::mem::swap(&mut self.prev, &mut self.next);
        std::mem::swap(&mut self.prev_set, &mut self.next_set);
        self.next_set.clear();
    }

    fn reset(&mut self) {
        for &slot in &self.prev_set {
            self.prev[slot] = 0;
        }
        for &slot in &self.next_set {
            self.next[slot] = 0;
        }
        self.prev_set.clear();
        self.next_set.clear();
    }
}

impl<'a, T: Eq + Hash> SequenceMatcher<'a, T> {
    pub fn new(a: &'a [T], b: &'a [T]) -> Self {
        let mut b2j: HashMap<&'a T, Vec<usize>> = HashMap::new();
        for (j, item) in b.iter().enumerate() {
            b2j.entry(item).or_default().push(j);
        }
        if b.len() >= AUTOJUNK_MIN_LEN {
            let popular = b.len() / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= popular);
        }
        let mut matcher = Self {
            a,
            b,
            b2j,
            matching_blocks: Vec::new(),
        };
        matcher.matching_blocks = matcher.compute_matching_blocks();
        matcher
    }

    fn find_longest_match(
        &self,
        scratch: &mut RowScratch,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> Match {
        let mut best = Match {
            a: alo,
            b: blo,
            size: 0,
        };
        for i in alo..ahi {
            if let Some(positions) = self.b2j.get(&self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = scratch.prev[j] + 1;
                    scratch.next[j + 1] = k;
                    scratch.next_set.push(j + 1);
                    if k > best.size {
                        best = Match {
                            a: i + 1 - k,
                            b: j + 1 - k,
                            size: k,
                        };
                    }
                }
            }
            scratch.advance();
        }
        scratch.reset();

        // Popular items never seed a match but may extend one.
        while best.a > alo && best.b > blo && self.a[best.a - 1] == self.b[best.b - 1] {
            best.a -= 1;
            best.b -= 1;
            best.size += 1;
        }
        while best.a + best.size < ahi
            && best.b + best.size < bhi
            && self.a[best.a + best.size] == self.b[best.b + best.size]
        {
            best.size += 1;
        }
        best
    }

    fn compute_matching_blocks(&self) -> Vec<Match> {
        let (la, lb) = (self.a.len(), self.b.len());
        let mut scratch = RowScratch::new(lb);
        let mut queue = vec![(0, la, 0, lb)];
        let mut blocks = Vec::new();
        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let m = self.find_longest_match(&mut scratch, alo, ahi, blo, bhi);
            if m.size == 0 {
                continue;
            }
            if alo < m.a && blo < m.b {
                queue.push((alo, m.a, blo, m.b));
            }
            if m.a + m.size < ahi && m.b + m.size < bhi {
                queue.push((m.a + m.size, ahi, m.b + m.size, bhi));
            }
            blocks.push(m);
        }
        blocks.sort_by_key(|m| (m.a, m.b));

        // Fold adjacent blocks together.
        let mut merged: Vec<Match> = Vec::with_capacity(blocks.len() + 1);
        for block in blocks {
            match merged.last_mut() {
                Some(last) if last.a + last.size == block.a && last.b + last.size == block.b => {
                    last.size += block.size;
                }
                _ => merged.push(block),
            }
        }
        merged.push(Match {
            a: la,
            b: lb,
            size: 0,
        });
        merged
    }

    pub fn matches(&self) -> usize {
        self.matching_blocks.iter().map(|m| m.size).sum()
    }

    /// `2 * matches / (len(a) + len(b))`, and 1.0 when both are empty.
    pub fn ratio(&self) -> f64 {
        let total = self.a.len() + self.b.len();
        if total == 0 {
            return 1.0;
        }
        2.0 * self.matches() as f64 / total as f64
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        let mut out = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        for m in &self.matching_blocks {
            let tag = if i < m.a && j < m.b {
                Some(OpTag::Replace)
            } else if i < m.a {
                Some(OpTag::Delete)
            } else if j < m.b {
                Some(OpTag::Insert)
            } else {
                None
            };
            if let Some(tag) = tag {
                out.push(Opcode::new(tag, i, m.a, j, m.b));
            }
            i = m.a + m.size;
            j = m.b + m.size;
            if m.size > 0 {
                out.push(Opcode::new(OpTag::Equal, m.a, i, m.b, j));
            }
        }
        out
    }

    /// Opcodes split into hunks with at most `context` equal lines around
    /// each change. Nothing is returned when the sequences are identical.
    pub fn grouped_opcodes(&self, context: usize) -> Vec<Vec<Opcode>> {
        let mut codes = self.opcodes();
        if codes.is_empty() {
            codes.push(Opcode::new(OpTag::Equal, 0, 1, 0, 1));
        }
        if let Some(first) = codes.first_mut() {
            if first.tag == OpTag::Equal {
                first.a_start = first.a_start.max(first.a_end.saturating_sub(context));
                first.b_start = first.b_start.max(first.b_end.saturating_sub(context));
            }
        }
        if let Some(last) = codes.last_mut() {
            if last.tag == OpTag::Equal {
                last.a_end = last.a_end.min(last.a_start + context);
                last.b_end = last.b_end.min(last.b_start + context);
            }
        }

        let span = context * 2;
        let mut groups = Vec::new();
        let mut group = Vec::new();
        for mut code in codes {
            if code.tag == OpTag::Equal && code.a_len() > span {
                group.push(Opcode::new(
                    OpTag::Equal,
                    code.a_start,
                    code.a_end.min(code.a_start + context),
                    code.b_start,
                    code.b_end.min(code.b_start + context),
                ));
                groups.push(std::mem::take(&mut group));
                code.a_start = code.a_start.max(code.a_end.saturating_sub(context));
                code.b_start = code.b_start.max(code.b_end.saturating_sub(context));
            }
            group.push(code);
        }
        if !group.is_empty() && !(group.len() == 1 && group[0].tag == OpTag::Equal) {
            groups.push(group);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn tags(codes: &[Opcode]) -> Vec<(&'static str, usize, usize, usize, usize)> {
        codes
            .iter()
            .map(|c| {
                let tag = match c.tag {
                    OpTag::Equal => "equal",
                    OpTag::Insert => "insert",
                    OpTag::Delete => "delete",
                    OpTag::Replace => "replace",
                };
                (tag, c.a_start, c.a_end, c.b_start, c.b_end)
            })
            .collect()
    }

    #[test]
    fn opcodes_match_classic_example() {
        let (a, b) = (chars("qabxcd"), chars("abycdf"));
        let matcher = SequenceMatcher::new(&a, &b);
        assert_eq!(
            tags(&matcher.opcodes()),
            vec![
                ("delete", 0, 1, 0, 0),
                ("equal", 1, 3, 0, 2),
                ("replace", 3, 4, 2, 3),
                ("equal", 4, 6, 3, 5),
                ("insert", 6, 6, 5, 6),
            ]
        );
    }

    #[test]
    fn ratio_counts_matching_elements() {
        let (a, b) = (chars("abcd"), chars("bcde"));
        let matcher = SequenceMatcher::new(&a, &b);
        assert_eq!(matcher.matches(), 3);
        assert!((matcher.ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_sequences() {
        let empty: Vec<char> = Vec::new();
        let matcher = SequenceMatcher::new(&empty, &empty);
        assert!(matcher.opcodes().is_empty());
        assert_eq!(matcher.ratio(), 1.0);
        assert!(matcher.grouped_opcodes(3).is_empty());

        let b = chars("xy");
        let matcher = SequenceMatcher::new(&empty, &b);
        assert_eq!(tags(&matcher.opcodes()), vec![("insert", 0, 0, 0, 2)]);
        assert_eq!(matcher.ratio(), 0.0);
    }

    #[test]
    fn identical_sequences_have_no_hunks() {
        let a = chars("abcdef");
        let matcher = SequenceMatcher::new(&a, &a);
        assert_eq!(tags(&matcher.opcodes()), vec![("equal", 0, 6, 0, 6)]);
        assert!(matcher.grouped_opcodes(3).is_empty());
    }

    #[test]
    fn groups_trim_context_and_split_far_changes() {
        let a: Vec<u32> = (0..30).collect();
        let mut b = a.clone();
        b[2] = 100;
        b[25] = 200;
        let matcher = SequenceMatcher::new(&a, &b);
        let groups = matcher.grouped_opcodes(2);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            tags(&groups[0]),
            vec![("equal", 0, 2, 0, 2), ("replace", 2, 3, 2, 3), ("equal", 3, 5, 3, 5)]
        );
        assert_eq!(
            tags(&groups[1]),
            vec![("equal", 23, 25, 23, 25), ("replace", 25, 26, 25, 26), ("equal", 26, 28, 26, 28)]
        );
    }

    #[test]
    fn popular_items_extend_but_do_not_seed_matches() {
        let a = vec!["</div>"; 300];
        let matcher = SequenceMatcher::new(&a, &a);
        assert!(matcher.b2j.is_empty());
        assert_eq!(tags(&matcher.opcodes()), vec![("equal", 0, 300, 0, 300)]);
        assert_eq!(matcher.ratio(), 1.0);
    }

    #[test]
    fn unique_lines_anchor_runs_of_popular_ones() {
        let mut a = Vec::new();
        for i in 0..100 {
            a.push(format!("item {i}"));
            a.push("</div>".to_string());
            a.push("</div>".to_string());
        }
        let mut b = a.clone();
        b.insert(150, "<script>".to_string());
        let matcher = SequenceMatcher::new(&a, &b);
        assert!(!matcher.b2j.contains_key(&"</div>".to_string()));
        assert_eq!(
            tags(&matcher.opcodes()),
            vec![
                ("equal", 0, 150, 0, 150),
                ("insert", 150, 150, 150, 151),
                ("equal", 150, 300, 151, 301),
            ]
        );
    }
}
