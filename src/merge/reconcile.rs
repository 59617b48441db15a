//! Two-way reconciliation
//!
//! Used when no base snapshot exists (first import of a pre-existing note,
//! or a lost snapshot): without a common ancestor we cannot diff, but
//! tracking markers still let us union highlight-by-highlight. The current
//! note's blocks are kept verbatim — user edits inside them survive — and
//! incoming blocks whose annotation id is not yet present are appended in
//! source order.

use std::collections::{HashMap, HashSet};

use crate::codec::{self, FrontMatter};
use crate::model::{Annotation, CommentStyle};

/// Keys the importer owns: on re-import the incoming values win. Everything
/// else in front-matter belongs to the user and is preserved untouched.
pub const IMPORT_OWNED_KEYS: &[&str] = &["title", "authors", "series", "language"];

/// Merge front-matter: start from the current mapping (user keys and their
/// order preserved), overwrite import-owned keys with incoming values.
/// `kohl-uid` is never taken from the incoming side.
pub fn merge_front_matter(current: &FrontMatter, incoming: &FrontMatter) -> FrontMatter {
    let mut merged = current.clone();
    for key in IMPORT_OWNED_KEYS {
        if let Some(value) = incoming.get(key) {
            merged.set(key, value.clone());
        }
    }
    merged
}

/// Union the tracked highlight blocks of `current_body` and `rendered_body`,
/// deduplicated by annotation id. Current blocks keep their order and their
/// (possibly user-edited) content; new incoming blocks are appended sorted
/// by `(page, position, time)`.
pub fn reconcile_bodies(
    current_body: &str,
    rendered_body: &str,
    incoming: &[Annotation],
    style: CommentStyle,
) -> String {
    let current = codec::extract_highlights(current_body, style);
    let rendered = codec::extract_highlights(rendered_body, style);

    let have: HashSet<&str> = current.ids().collect();
    let order: HashMap<String, (u32, String, String)> = incoming
        .iter()
        .map(|a| (a.id(), a.sort_key()))
        .collect();

    let mut fresh: Vec<&codec::TrackedBlock> = rendered
        .blocks
        .iter()
        .filter(|b| !have.contains(b.id.as_str()))
        .collect();
    // Renderer output is already sorted; re-sort in case the caller
    // assembled the rendered body from multiple sources. Blocks without a
    // matching incoming annotation keep rendered order, at the end.
    fresh.sort_by_key(|b| (order.get(&b.id).is_none(), order.get(&b.id).cloned()));

    let mut out = String::with_capacity(current_body.len() + rendered_body.len() / 2);
    out.push_str(&current.preamble);
    for block in &current.blocks {
        out.push_str(&block.block);
    }
    for block in fresh {
        if !out.is_empty() && !out.ends_with("\n\n") {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str(&block.block);
    }
    out
}

/// The tracked segment of a block: the marker line plus the contiguous
/// blockquote lines under it. Prose the user adds below a highlight is part
/// of the block span but not of the segment.
fn tracked_segment(block: &str) -> String {
    let mut lines = block.lines();
    let mut segment = String::new();
    if let Some(marker) = lines.next() {
        segment.push_str(marker);
        segment.push('\n');
    }
    for line in lines {
        if line.starts_with("> ") || line == ">" {
            segment.push_str(line);
            segment.push('\n');
        } else {
            break;
        }
    }
    segment
}

/// Build the "theirs" side for a three-way merge.
///
/// The rendered body alone is the wrong `theirs`: a highlight the source
/// rewrote (new annotation id) would silently replace the local copy even
/// when the user still wants it. Instead, walk the base's block sequence
/// and keep every base block that (a) the incoming set no longer carries
/// and (b) whose tracked segment the user has not touched since the
/// snapshot — those are source-side removals of content the user kept.
/// Blocks whose segment the user rewrote are left out, so the line merge
/// surfaces a real conflict between the user's version and the incoming
/// one. Incoming blocks keep their rendered order.
pub fn union_theirs(
    base_body: &str,
    current_body: &str,
    rendered_body: &str,
    style: CommentStyle,
) -> String {
    let base = codec::extract_highlights(base_body, style);
    let current = codec::extract_highlights(current_body, style);
    let rendered = codec::extract_highlights(rendered_body, style);
    if base.blocks.is_empty() {
        return rendered_body.to_string();
    }

    let rendered_pos: HashMap<&str, usize> = rendered
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id.as_str(), i))
        .collect();
    let current_segments: HashMap<&str, String> = current
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), tracked_segment(&b.block)))
        .collect();

    let mut out = String::with_capacity(rendered_body.len());
    out.push_str(&rendered.preamble);
    let mut next_rendered = 0usize;
    for block in &base.blocks {
        if let Some(&pos) = rendered_pos.get(block.id.as_str()) {
            if pos >= next_rendered {
                for rb in &rendered.blocks[next_rendered..=pos] {
                    out.push_str(&rb.block);
                }
                next_rendered = pos + 1;
            }
        } else if current_segments.get(block.id.as_str())
            == Some(&tracked_segment(&block.block))
        {
            out.push_str(&block.block);
        }
        // Otherwise the user rewrote or deleted the tracked segment;
        // leaving it out lets the line merge decide (conflict or clean
        // deletion).
    }
    for rb in &rendered.blocks[next_rendered..] {
        out.push_str(&rb.block);
    }
    out
}
