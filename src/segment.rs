//! Heading-based document segmentation.
//!
//! A document is split at every line whose heading level equals the
//! configured marker level. Each split produces one [`Block`] whose ID is
//! the hash of its key, so re-segmenting unchanged text yields the same IDs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash;

/// Level used when the configured marker is not a valid `#` run.
pub const DEFAULT_HEADING_LEVEL: u8 = 3;

const MAX_HEADING_LEVEL: usize = 6;

/// A heading-delimited slice of a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: u32,
    pub key: String,
    pub text: String,
}

impl Block {
    pub fn new(key: String, text: String) -> Self {
        Self {
            id: hash::block_id(&key),
            key,
            text,
        }
    }
}

/// Segmenter output for one document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentBlocks {
    pub file_path: String,
    pub document_name: String,
    pub blocks: Vec<Block>,
}

/// Markdown heading level (1-6) that splits a document into blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadingLevel(u8);

impl HeadingLevel {
    /// Parse a marker such as `"###"` or `"### "`.
    /// Anything that is not a run of one to six `#` falls back to level 3.
    pub fn from_marker(marker: &str) -> Self {
        let marker = marker.trim();
        let valid = !marker.is_empty()
            && marker.len() <= MAX_HEADING_LEVEL
            && marker.bytes().all(|b| b == b'#');

        if valid {
            Self(marker.len() as u8)
        } else {
            Self(DEFAULT_HEADING_LEVEL)
        }
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    pub fn marker(&self) -> String {
        "#".repeat(self.0 as usize)
    }
}

impl Default for HeadingLevel {
    fn default() -> Self {
        Self(DEFAULT_HEADING_LEVEL)
    }
}

impl fmt::Display for HeadingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.marker())
    }
}

/// Classify a line as a heading, returning its level and trimmed title.
///
/// Runs of more than six `#` are level 6 headings whose title keeps the
/// extra `#` characters.
pub fn classify_line(line: &str) -> Option<(u8, &str)> {
    let run = line.bytes().take_while(|b| *b == b'#').count();
    if run == 0 {
        return None;
    }

    let level = run.min(MAX_HEADING_LEVEL);
    Some((level as u8, line[level..].trim()))
}

/// Strip a heading's leading `#` run and surrounding whitespace.
pub fn heading_title(heading_text: &str) -> &str {
    let trimmed = heading_text.trim_start();
    match classify_line(trimmed) {
        Some((_, title)) => title,
        None => trimmed.trim(),
    }
}

pub fn heading_key(title: &str, document_name: &str) -> String {
    format!("{title} of {document_name}")
}

/// Key of the block that starts at a clicked heading.
///
/// The configured marker is stripped when the heading starts with it;
/// otherwise any leading `#` run is stripped.
pub fn clicked_heading_key(document_name: &str, heading_text: &str, heading_marker: &str) -> String {
    let text = heading_text.trim();
    let marker = heading_marker.trim();
    let title = match text.strip_prefix(marker) {
        Some(rest) if !marker.is_empty() && !rest.starts_with('#') => rest.trim(),
        _ => heading_title(text),
    };
    heading_key(title, document_name)
}

pub fn prologue_key(document_name: &str) -> String {
    format!("prologue_of_{document_name}")
}

pub fn full_document_key(document_name: &str) -> String {
    format!("full_document_of_{document_name}")
}

/// Split `text` into blocks at headings of level `level`.
///
/// # Arguments
/// * `file_path` - Vault-relative path of the document
/// * `document_name` - File name used in block keys
/// * `text` - Raw markdown
/// * `level` - Heading level that starts a new block
///
/// # Returns
/// A [`DocumentBlocks`] with an optional prologue block followed by one block
/// per heading, or a single full-document block when no heading matches.
pub fn segment(
    file_path: &str,
    document_name: &str,
    text: &str,
    level: HeadingLevel,
) -> DocumentBlocks {
    let lines: Vec<&str> = text.split('\n').collect();

    let split_points: Vec<(usize, String)> = lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| match classify_line(line) {
            Some((l, title)) if l == level.level() => {
                Some((idx, heading_key(title, document_name)))
            }
            _ => None,
        })
        .collect();

    let mut blocks = Vec::new();

    if split_points.is_empty() {
        let content = text.trim();
        if !content.is_empty() {
            blocks.push(Block::new(
                full_document_key(document_name),
                content.to_string(),
            ));
        }
    } else {
        let prologue = lines[..split_points[0].0].join("\n");
        let prologue = prologue.trim();
        if !prologue.is_empty() {
            blocks.push(Block::new(
                prologue_key(document_name),
                prologue.to_string(),
            ));
        }

        for (i, (start, key)) in split_points.iter().enumerate() {
            let end = split_points
                .get(i + 1)
                .map(|(next, _)| *next)
                .unwrap_or(lines.len());
            let content = lines[*start..end].join("\n");
            blocks.push(Block::new(key.clone(), content.trim().to_string()));
        }
    }

    log::debug!(
        "segmented {file_path} into {} blocks at level {level}",
        blocks.len()
    );

    DocumentBlocks {
        file_path: file_path.to_string(),
        document_name: document_name.to_string(),
        blocks,
    }
}
