//! Pure three-way line merge
//!
//! `merge3` composes two pairwise line diffs against the common base into
//! diff3 semantics: regions where only one side changed take that side,
//! identical changes collapse, and overlapping different changes become
//! explicit conflict regions. No line from either side is dropped silently.
//!
//! Lines keep their terminators throughout, so concatenating rendered
//! regions reproduces input bytes exactly outside conflict markup.

use std::collections::HashMap;

use similar::{capture_diff_slices, Algorithm, DiffOp};

/// One merged region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    Clean(Vec<String>),
    Conflict { a: Vec<String>, b: Vec<String> },
}

/// Sentinel markers for rendered conflicts. Automated detection (and the
/// `conflicts: unresolved` front-matter flag) keys off these.
pub const OURS_MARKER: &str = "<<<<<<< Your Edits";
pub const SEPARATOR_MARKER: &str = "=======";
pub const THEIRS_MARKER: &str = ">>>>>>> Incoming Changes";

/// True when `text` contains a rendered conflict block.
pub fn contains_conflict_markers(text: &str) -> bool {
    text.lines().any(|l| l.starts_with(OURS_MARKER))
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Monotonic base-index → side-index map from the Equal runs of a pairwise
/// diff.
fn match_map(ops: &[DiffOp]) -> HashMap<usize, usize> {
    let mut map = HashMap::new();
    for op in ops {
        if let DiffOp::Equal {
            old_index,
            new_index,
            len,
        } = op
        {
            for k in 0..*len {
                map.insert(old_index + k, new_index + k);
            }
        }
    }
    map
}

fn to_owned_lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|s| s.to_string()).collect()
}

/// Three-way merge of `ours` and `theirs` against their common `base`.
pub fn merge3(ours: &str, base: &str, theirs: &str) -> Vec<Region> {
    let base_lines = split_lines(base);
    let ours_lines = split_lines(ours);
    let theirs_lines = split_lines(theirs);

    let ours_ops = capture_diff_slices(Algorithm::Myers, &base_lines, &ours_lines);
    let theirs_ops = capture_diff_slices(Algorithm::Myers, &base_lines, &theirs_lines);
    let base_to_ours = match_map(&ours_ops);
    let base_to_theirs = match_map(&theirs_ops);

    // Anchors: base lines present unchanged in both sides. Equal runs from
    // Myers diffs are monotonic, so anchor side indices increase with the
    // base index.
    let anchors: Vec<(usize, usize, usize)> = (0..base_lines.len())
        .filter_map(|bi| {
            let oi = *base_to_ours.get(&bi)?;
            let ti = *base_to_theirs.get(&bi)?;
            Some((bi, oi, ti))
        })
        .collect();

    let mut regions: Vec<Region> = Vec::new();
    let (mut pb, mut po, mut pt) = (0usize, 0usize, 0usize);

    let mut emit_unstable = |regions: &mut Vec<Region>,
                             b: &[&str],
                             o: &[&str],
                             t: &[&str]| {
        if b.is_empty() && o.is_empty() && t.is_empty() {
            return;
        }
        if o == b {
            if !t.is_empty() {
                regions.push(Region::Clean(to_owned_lines(t)));
            }
        } else if t == b || o == t {
            if !o.is_empty() {
                regions.push(Region::Clean(to_owned_lines(o)));
            }
        } else {
            regions.push(Region::Conflict {
                a: to_owned_lines(o),
                b: to_owned_lines(t),
            });
        }
    };

    let mut idx = 0;
    while idx < anchors.len() {
        let (bi, oi, ti) = anchors[idx];
        emit_unstable(
            &mut regions,
            &base_lines[pb..bi],
            &ours_lines[po..oi],
            &theirs_lines[pt..ti],
        );

        // Extend the stable run as far as the anchors stay contiguous.
        let mut run = 1;
        while idx + run < anchors.len() {
            let (nb, no, nt) = anchors[idx + run];
            if nb == bi + run && no == oi + run && nt == ti + run {
                run += 1;
            } else {
                break;
            }
        }
        regions.push(Region::Clean(to_owned_lines(&base_lines[bi..bi + run])));
        pb = bi + run;
        po = oi + run;
        pt = ti + run;
        idx += run;
    }
    emit_unstable(
        &mut regions,
        &base_lines[pb..],
        &ours_lines[po..],
        &theirs_lines[pt..],
    );

    coalesce(regions)
}

/// Merge adjacent clean regions so trivial merges come back as one region.
fn coalesce(regions: Vec<Region>) -> Vec<Region> {
    let mut out: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        match region {
            Region::Clean(lines) => {
                if let Some(Region::Clean(prev)) = out.last_mut() {
                    prev.extend(lines);
                } else {
                    out.push(Region::Clean(lines));
                }
            }
            conflict => out.push(conflict),
        }
    }
    out
}

/// Rendered merge output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub merged_text: String,
    pub had_conflict: bool,
}

/// Formatter for conflict regions: receives both sides' lines and returns
/// the rendered block.
pub type ConflictFormatter = dyn Fn(&[String], &[String]) -> String + Send + Sync;

fn push_lines(out: &mut String, lines: &[String]) {
    for line in lines {
        out.push_str(line);
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// Default conflict rendering: labeled blocks wrapped in sentinel markers.
pub fn default_conflict_formatter(a: &[String], b: &[String]) -> String {
    let mut out = String::new();
    out.push_str(OURS_MARKER);
    out.push('\n');
    push_lines(&mut out, a);
    out.push_str(SEPARATOR_MARKER);
    out.push('\n');
    push_lines(&mut out, b);
    out.push_str(THEIRS_MARKER);
    out.push('\n');
    out
}

/// Concatenate regions into the merged text. Clean regions pass through
/// unchanged; conflicts are rendered by `formatter` (the default labeled
/// blocks when `None`).
pub fn render_regions(regions: &[Region], formatter: Option<&ConflictFormatter>) -> Rendered {
    let mut merged_text = String::new();
    let mut had_conflict = false;
    for region in regions {
        match region {
            Region::Clean(lines) => {
                for line in lines {
                    merged_text.push_str(line);
                }
            }
            Region::Conflict { a, b } => {
                had_conflict = true;
                if !merged_text.is_empty() && !merged_text.ends_with('\n') {
                    merged_text.push('\n');
                }
                let block = match formatter {
                    Some(f) => f(a, b),
                    None => default_conflict_formatter(a, b),
                };
                merged_text.push_str(&block);
            }
        }
    }
    Rendered {
        merged_text,
        had_conflict,
    }
}
