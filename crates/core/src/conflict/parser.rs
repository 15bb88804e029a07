//! Line-based three-way text merge and conflict-marker parsing.
//!
//! Uses `diffy` to merge the ancestor, "ours" (source branch) and "theirs"
//! (target branch) versions of a file. A conflicted merge comes back as text
//! with diff3-style markers, which is split here into [`Section`]s so that
//! each conflicting hunk can be resolved on its own.

use std::collections::BTreeMap;

use diffy::{ConflictStyle, MergeOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

const MARKER_CHARS: [char; 4] = ['<', '|', '=', '>'];
const DEFAULT_MARKER_LEN: usize = 7;

/// Which side of a conflicting hunk to keep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Ours,
    Theirs,
}

/// A conflicting region of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictHunk {
    /// Position of the hunk within the file, starting at 0.
    pub id: usize,
    pub ours: String,
    pub base: String,
    pub theirs: String,
}

/// A piece of a conflicted file: either text both sides agree on or a
/// conflicting hunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Section {
    Unchanged { text: String },
    Conflict(ConflictHunk),
}

/// Outcome of a three-way text merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMerge {
    Clean(String),
    Conflicted(Vec<Section>),
}

/// Merge `ours` and `theirs` against `base`.
///
/// Markers are made longer than any run of marker characters in the
/// inputs, so text such as a Markdown heading underline never reads as a
/// marker. Fails only when the merged output cannot be split back into
/// sections.
pub fn merge_text(base: &str, ours: &str, theirs: &str) -> Result<TextMerge, String> {
    let marker_len = [base, ours, theirs]
        .iter()
        .map(|text| longest_marker_run(text) + 1)
        .fold(DEFAULT_MARKER_LEN, usize::max);

    let mut options = MergeOptions::new();
    options
        .set_conflict_style(ConflictStyle::Diff3)
        .set_conflict_marker_length(marker_len);
    match options.merge(base, ours, theirs) {
        Ok(merged) => Ok(TextMerge::Clean(merged)),
        Err(conflicted) => {
            let sections = parse_sections(&conflicted, marker_len)?;
            debug!(hunks = hunk_count(&sections), marker_len, "text merge conflicted");
            Ok(TextMerge::Conflicted(sections))
        }
    }
}

fn longest_marker_run(text: &str) -> usize {
    let mut longest = 0;
    let mut run = 0;
    let mut prev = None;
    for c in text.chars() {
        if MARKER_CHARS.contains(&c) && prev == Some(c) {
            run += 1;
        } else if MARKER_CHARS.contains(&c) {
            run = 1;
        } else {
            run = 0;
        }
        longest = longest.max(run);
        prev = Some(c);
    }
    longest
}

/// The exact marker lines a merge with `len`-character markers emits.
struct Markers {
    ours: String,
    base: String,
    split: String,
    theirs: String,
}

impl Markers {
    fn new(len: usize) -> Self {
        Self {
            ours: format!("{} ours\n", "<".repeat(len)),
            base: format!("{} original\n", "|".repeat(len)),
            split: format!("{}\n", "=".repeat(len)),
            theirs: format!("{} theirs\n", ">".repeat(len)),
        }
    }
}

/// If `line` ends with `marker`, the text in front of it.
///
/// A hunk side without a trailing newline runs straight into the next
/// marker, so the marker is not always at the start of a line.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.strip_suffix(marker)
}

/// Split merge output carrying `marker_len`-character diff3 markers into
/// sections.
fn parse_sections(text: &str, marker_len: usize) -> Result<Vec<Section>, String> {
    enum State {
        Outside,
        Ours,
        Base,
        Theirs,
    }

    let markers = Markers::new(marker_len);
    let mut sections = Vec::new();
    let mut unchanged = String::new();
    let mut hunk = ConflictHunk {
        id: 0,
        ours: String::new(),
        base: String::new(),
        theirs: String::new(),
    };
    let mut state = State::Outside;
    let mut next_id = 0;

    for line in text.split_inclusive('\n') {
        match state {
            State::Outside => {
                if line == markers.ours {
                    if !unchanged.is_empty() {
                        sections.push(Section::Unchanged {
                            text: std::mem::take(&mut unchanged),
                        });
                    }
                    hunk.id = next_id;
                    next_id += 1;
                    state = State::Ours;
                } else {
                    unchanged.push_str(line);
                }
            }
            State::Ours => {
                if let Some(rest) = strip_marker(line, &markers.base) {
                    hunk.ours.push_str(rest);
                    state = State::Base;
                } else if let Some(rest) = strip_marker(line, &markers.split) {
                    hunk.ours.push_str(rest);
                    state = State::Theirs;
                } else {
                    hunk.ours.push_str(line);
                }
            }
            State::Base => {
                if let Some(rest) = strip_marker(line, &markers.split) {
                    hunk.base.push_str(rest);
                    state = State::Theirs;
                } else {
                    hunk.base.push_str(line);
                }
            }
            State::Theirs => {
                if let Some(rest) = strip_marker(line, &markers.theirs) {
                    hunk.theirs.push_str(rest);
                    let done = std::mem::replace(
                        &mut hunk,
                        ConflictHunk {
                            id: 0,
                            ours: String::new(),
                            base: String::new(),
                            theirs: String::new(),
                        },
                    );
                    sections.push(Section::Conflict(done));
                    state = State::Outside;
                } else {
                    hunk.theirs.push_str(line);
                }
            }
        }
    }

    if !matches!(state, State::Outside) {
        return Err("unterminated conflict hunk".to_string());
    }
    if !unchanged.is_empty() {
        sections.push(Section::Unchanged { text: unchanged });
    }
    Ok(sections)
}

/// Whether `text` still holds a complete conflict block: a `<<<<<<<` line,
/// then a `=======` line, then a `>>>>>>>` line.
pub fn contains_conflict_block(text: &str) -> bool {
    let mut expected = ["<<<<<<<", "=======", ">>>>>>>"].into_iter().peekable();
    for line in text.lines() {
        match expected.peek() {
            Some(marker) if line.starts_with(*marker) => {
                expected.next();
            }
            Some(_) => {}
            None => break,
        }
    }
    expected.peek().is_none()
}

/// Number of conflicting hunks among `sections`.
pub fn hunk_count(sections: &[Section]) -> usize {
    sections
        .iter()
        .filter(|s| matches!(s, Section::Conflict(_)))
        .count()
}

/// Rebuild a file from its sections, picking a side for every hunk.
///
/// Returns the id of the first hunk without a choice as the error.
pub fn render(sections: &[Section], choices: &BTreeMap<usize, Side>) -> Result<String, usize> {
    let mut out = String::new();
    for section in sections {
        match section {
            Section::Unchanged { text } => out.push_str(text),
            Section::Conflict(hunk) => match choices.get(&hunk.id) {
                Some(Side::Ours) => out.push_str(&hunk.ours),
                Some(Side::Theirs) => out.push_str(&hunk.theirs),
                None => return Err(hunk.id),
            },
        }
    }
    Ok(out)
}
