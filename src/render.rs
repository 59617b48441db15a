//! Default body renderer
//!
//! A plain Markdown rendering of annotations: page section headers,
//! tracking markers in the configured style, blockquoted highlight text,
//! and the user's note below it. Pure — identical inputs always produce
//! identical output, which the merge pipeline depends on.
//!
//! Shells with their own template system supply their own
//! [`BodyRenderer`]; this one keeps the engine usable out of the box.

use crate::codec;
use crate::model::{Annotation, BookMetadata, CommentStyle};
use crate::ports::BodyRenderer;

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl BodyRenderer for MarkdownRenderer {
    fn render(
        &self,
        _metadata: &BookMetadata,
        annotations: &[Annotation],
        comment_style: CommentStyle,
        max_highlight_gap: u32,
    ) -> String {
        let mut out = String::new();
        let mut last_page: Option<u32> = None;

        for annotation in annotations {
            let new_section = match last_page {
                None => true,
                // Nearby pages stay under one header.
                Some(prev) => annotation.page.saturating_sub(prev) > max_highlight_gap,
            };
            if new_section {
                out.push_str(&format!("###### Page {}\n\n", annotation.page));
            }

            if let Some(marker) = codec::marker_for(comment_style, &annotation.id()) {
                out.push_str(&marker);
                out.push('\n');
            }
            for line in annotation.text.lines() {
                out.push_str("> ");
                out.push_str(line);
                out.push('\n');
            }
            if let Some(note) = &annotation.note {
                out.push('\n');
                out.push_str("**Note:** ");
                out.push_str(note);
                out.push('\n');
            }
            out.push('\n');
            last_page = Some(annotation.page);
        }

        out
    }
}
