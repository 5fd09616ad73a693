//! Unified diff → ordered [`ChangeUnit`]s.
//!
//! Accepts `git diff` output (with `diff --git` headers) as well as plain
//! unified diffs that start directly at `---`/`+++`. Hunk line counts are
//! checked against the body, so a truncated diff is rejected instead of
//! silently producing a partial change set.

use crate::types::{ChangeUnit, FileStatus};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("malformed diff at line {line}: {reason}")]
    ParseError { line: usize, reason: String },
}

fn parse_error(line: usize, reason: impl Into<String>) -> DiffError {
    DiffError::ParseError {
        line,
        reason: reason.into(),
    }
}

// ── Parser state ──

#[derive(Debug, Default)]
struct FileHeader {
    old_path: Option<String>,
    new_path: Option<String>,
    status: Option<FileStatus>,
    /// Set once the `+++` line or a hunk was read. A later `---` then starts
    /// the next file of a plain unified diff.
    complete: bool,
}

impl FileHeader {
    fn status(&self) -> FileStatus {
        self.status.unwrap_or(FileStatus::Modified)
    }

    fn path(&self) -> Option<&str> {
        match self.status() {
            FileStatus::Deleted => self.old_path.as_deref().or(self.new_path.as_deref()),
            _ => self.new_path.as_deref().or(self.old_path.as_deref()),
        }
    }
}

#[derive(Debug)]
struct OpenHunk {
    file: String,
    status: FileStatus,
    old_start: u32,
    old_count: u32,
    new_start: u32,
    new_count: u32,
    old_left: u32,
    new_left: u32,
    body: Vec<String>,
    added: Vec<String>,
    removed: Vec<String>,
}

impl OpenHunk {
    fn is_complete(&self) -> bool {
        self.old_left == 0 && self.new_left == 0
    }

    fn into_unit(self) -> ChangeUnit {
        let (start, count) = match (self.status, self.new_count) {
            (FileStatus::Deleted, _) => (self.old_start.max(1), self.old_count),
            // Pure removal inside a kept file: anchor on the new-side line.
            (_, 0) => (self.new_start.max(1), 1),
            _ => (self.new_start.max(1), self.new_count),
        };
        ChangeUnit {
            file: self.file,
            start_line: start,
            end_line: start + count.max(1) - 1,
            content: self.body.join("\n"),
            status: self.status,
            added: self.added,
            removed: self.removed,
        }
    }
}

// ── Public API ──

/// Parse a unified diff into change units ordered by file path, then start line.
///
/// Parsing is pure: the same input always yields an equal sequence, which lets
/// callers compare two extractions to detect an unchanged proposal. Empty input
/// yields an empty sequence.
pub fn extract(diff: &str) -> Result<Vec<ChangeUnit>, DiffError> {
    let mut units = Vec::new();
    let mut header: Option<FileHeader> = None;
    let mut hunk: Option<OpenHunk> = None;

    for (idx, line) in diff.lines().enumerate() {
        let lineno = idx + 1;

        if let Some(open) = hunk.as_mut() {
            if line.starts_with('\\') {
                continue; // "\ No newline at end of file"
            }
            consume_body_line(open, line, lineno)?;
            if open.is_complete() {
                if let Some(done) = hunk.take() {
                    units.push(done.into_unit());
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            header = Some(parse_git_header(rest, lineno)?);
        } else if line.starts_with("new file mode") {
            if let Some(h) = header.as_mut() {
                h.status = Some(FileStatus::Added);
            }
        } else if line.starts_with("deleted file mode") {
            if let Some(h) = header.as_mut() {
                h.status = Some(FileStatus::Deleted);
            }
        } else if let Some(path) = line.strip_prefix("rename from ") {
            let h = header.get_or_insert_with(FileHeader::default);
            h.old_path = Some(path.trim().to_string());
            h.status = Some(FileStatus::Renamed);
        } else if let Some(path) = line.strip_prefix("rename to ") {
            let h = header.get_or_insert_with(FileHeader::default);
            h.new_path = Some(path.trim().to_string());
            h.status = Some(FileStatus::Renamed);
        } else if let Some(rest) = line.strip_prefix("--- ") {
            if header.as_ref().is_some_and(|h| h.complete) {
                header = None;
            }
            let h = header.get_or_insert_with(FileHeader::default);
            match header_path(rest) {
                None => h.status = Some(FileStatus::Added),
                Some(p) => {
                    if h.status != Some(FileStatus::Renamed) {
                        h.old_path = Some(strip_side_prefix(&p, "a/"));
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let h = header.get_or_insert_with(FileHeader::default);
            h.complete = true;
            match header_path(rest) {
                None => h.status = Some(FileStatus::Deleted),
                Some(p) => {
                    if h.status != Some(FileStatus::Renamed) {
                        h.new_path = Some(strip_side_prefix(&p, "b/"));
                    }
                }
            }
        } else if line.starts_with("@@") {
            let h = header
                .as_mut()
                .ok_or_else(|| parse_error(lineno, "hunk before any file header"))?;
            h.complete = true;
            let file = h
                .path()
                .ok_or_else(|| parse_error(lineno, "hunk for a file with no path"))?
                .to_string();
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(line, lineno)?;
            let open = OpenHunk {
                file,
                status: h.status(),
                old_start,
                old_count,
                new_start,
                new_count,
                old_left: old_count,
                new_left: new_count,
                body: Vec::new(),
                added: Vec::new(),
                removed: Vec::new(),
            };
            if open.is_complete() {
                units.push(open.into_unit());
            } else {
                hunk = Some(open);
            }
        } else if header.is_some()
            && (line.starts_with('+') || line.starts_with('-') || line.starts_with(' '))
        {
            return Err(parse_error(lineno, "change line outside of a hunk"));
        }
        // Anything else (index, mode, similarity, binary notices, preamble) is metadata.
    }

    if let Some(open) = hunk {
        return Err(parse_error(
            diff.lines().count(),
            format!(
                "diff ended inside a hunk of {} ({} old / {} new lines missing)",
                open.file, open.old_left, open.new_left
            ),
        ));
    }

    units.sort_by(|a, b| {
        a.file
            .cmp(&b.file)
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
    Ok(units)
}

/// Distinct file paths touched by a change set.
pub fn changed_files(units: &[ChangeUnit]) -> BTreeSet<String> {
    units.iter().map(|u| u.file.clone()).collect()
}

/// Render change units as Markdown, one fenced diff block per unit.
pub fn format_units(units: &[ChangeUnit]) -> String {
    let mut out = String::new();
    for unit in units {
        out.push_str(&format!(
            "### {} (lines {}-{}, {:?})\n```diff\n{}\n```\n\n",
            unit.file, unit.start_line, unit.end_line, unit.status, unit.content
        ));
    }
    out
}

// ── Helpers ──

fn consume_body_line(open: &mut OpenHunk, line: &str, lineno: usize) -> Result<(), DiffError> {
    let (marker, text) = match line.chars().next() {
        Some(c @ ('+' | '-' | ' ')) => (c, &line[1..]),
        // Some tools strip the single space from empty context lines.
        None => (' ', ""),
        Some(_) => {
            return Err(parse_error(
                lineno,
                format!(
                    "hunk shorter than its header ({} old / {} new lines missing)",
                    open.old_left, open.new_left
                ),
            ))
        }
    };

    match marker {
        '+' => {
            if open.new_left == 0 {
                return Err(parse_error(lineno, "more added lines than the hunk header declares"));
            }
            open.new_left -= 1;
            open.added.push(text.to_string());
        }
        '-' => {
            if open.old_left == 0 {
                return Err(parse_error(lineno, "more removed lines than the hunk header declares"));
            }
            open.old_left -= 1;
            open.removed.push(text.to_string());
        }
        _ => {
            if open.old_left == 0 || open.new_left == 0 {
                return Err(parse_error(lineno, "more context lines than the hunk header declares"));
            }
            open.old_left -= 1;
            open.new_left -= 1;
        }
    }
    open.body.push(format!("{marker}{text}"));
    Ok(())
}

fn parse_git_header(rest: &str, lineno: usize) -> Result<FileHeader, DiffError> {
    let malformed = || parse_error(lineno, format!("malformed diff --git header: {rest}"));
    let rest = rest.trim_end();
    let old = rest.strip_prefix("a/").ok_or_else(malformed)?;
    let split = old.rfind(" b/").ok_or_else(malformed)?;
    let (old_path, new_path) = (&old[..split], &old[split + 3..]);
    if old_path.is_empty() || new_path.is_empty() {
        return Err(malformed());
    }
    Ok(FileHeader {
        old_path: Some(old_path.to_string()),
        new_path: Some(new_path.to_string()),
        status: None,
        complete: false,
    })
}

/// Path from a `---`/`+++` line, or `None` for `/dev/null`.
fn header_path(rest: &str) -> Option<String> {
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    if path == "/dev/null" {
        None
    } else {
        Some(path.to_string())
    }
}

fn strip_side_prefix(path: &str, prefix: &str) -> String {
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

/// Parse `@@ -a[,b] +c[,d] @@ ...`. Missing counts default to 1.
fn parse_hunk_header(line: &str, lineno: usize) -> Result<(u32, u32, u32, u32), DiffError> {
    let malformed = || parse_error(lineno, format!("malformed hunk header: {line}"));
    let inner = line.strip_prefix("@@ ").ok_or_else(malformed)?;
    let end = inner.find(" @@").ok_or_else(malformed)?;
    let mut parts = inner[..end].split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(malformed)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }
    let (old_start, old_count) = parse_range(old).ok_or_else(malformed)?;
    let (new_start, new_count) = parse_range(new).ok_or_else(malformed)?;
    Ok((old_start, old_count, new_start, new_count))
}

fn parse_range(s: &str) -> Option<(u32, u32)> {
    match s.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}
