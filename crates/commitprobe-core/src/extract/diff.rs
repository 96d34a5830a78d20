//! Unified diff parsing.
//!
//! Understands `git diff` output (extended headers, renames, binary markers)
//! as well as plain `---`/`+++` unified diffs. Each file section is parsed
//! independently so one malformed section does not hide the others.

use std::sync::OnceLock;

use regex::Regex;

use super::ExtractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Added,
    Removed,
}

impl LineKind {
    fn prefix(&self) -> char {
        match self {
            LineKind::Context => ' ',
            LineKind::Added => '+',
            LineKind::Removed => '-',
        }
    }
}

/// One line of a hunk with its position on each side (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: LineKind,
    pub text: String,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
    /// The raw `@@ ... @@` line.
    pub header: String,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Render back to unified diff text (header plus prefixed lines).
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.header.len() + self.lines.len() * 32);
        out.push_str(&self.header);
        out.push('\n');
        for line in &self.lines {
            out.push(line.kind.prefix());
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    pub fn has_changes(&self) -> bool {
        self.lines.iter().any(|l| l.kind != LineKind::Context)
    }
}

/// All changes to one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    /// `None` for files created by the commit.
    pub old_path: Option<String>,
    /// `None` for files deleted by the commit.
    pub new_path: Option<String>,
    pub is_rename: bool,
    pub is_binary: bool,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    /// Display path: the post-commit path when the file still exists.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn is_new(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.new_path.is_none()
    }

    /// A textual change: not binary, and touches content or moves the file.
    pub fn is_textual(&self) -> bool {
        !self.is_binary && (self.hunks.iter().any(Hunk::has_changes) || self.is_rename)
    }

    /// Unified diff text of every hunk in this file.
    pub fn render_hunks(&self) -> String {
        self.hunks.iter().map(Hunk::render).collect()
    }
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex")
    })
}

/// Parse `@@ -a,b +c,d @@` (counts default to 1 when omitted).
pub fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32)> {
    let caps = hunk_header_re().captures(line)?;
    let num = |i: usize, default: u32| -> Option<u32> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(default),
        }
    };
    Some((num(1, 0)?, num(2, 1)?, num(3, 0)?, num(4, 1)?))
}

/// Strip the `a/`/`b/` prefix, surrounding quotes and any trailing timestamp.
/// Returns `None` for `/dev/null`.
fn clean_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = raw.trim_matches('"');
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

#[derive(Default)]
struct Section {
    file: FileDiff,
    saw_old_header: bool,
    error: Option<ExtractError>,
    open: Option<OpenHunk>,
}

struct OpenHunk {
    hunk: Hunk,
    old_left: u32,
    new_left: u32,
    next_old: u32,
    next_new: u32,
}

impl OpenHunk {
    fn is_complete(&self) -> bool {
        self.old_left == 0 && self.new_left == 0
    }
}

impl Section {
    fn is_blank(&self) -> bool {
        self.file.old_path.is_none()
            && self.file.new_path.is_none()
            && self.file.hunks.is_empty()
            && self.open.is_none()
            && !self.saw_old_header
    }

    fn close_hunk(&mut self) {
        if let Some(open) = self.open.take() {
            if !open.is_complete() && self.error.is_none() {
                self.error = Some(ExtractError::TruncatedHunk {
                    path: self.file.path().to_string(),
                    header: open.hunk.header.clone(),
                });
            }
            self.file.hunks.push(open.hunk);
        }
    }

    fn finish(mut self) -> Option<Result<FileDiff, ExtractError>> {
        self.close_hunk();
        if self.is_blank() {
            return None;
        }
        Some(match self.error {
            Some(err) => Err(err),
            None => Ok(self.file),
        })
    }
}

/// Append a git-style diff adding `path` with content `source`.
pub fn write_added_file(out: &mut String, path: &str, source: &str) {
    use std::fmt::Write;

    let count = source.lines().count();
    let _ = write!(
        out,
        "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{count} @@\n"
    );
    for line in source.lines() {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    if !source.ends_with('\n') {
        out.push_str("\\ No newline at end of file\n");
    }
}

/// Parse a unified diff into per-file results, in diff order.
pub fn parse_unified_diff(text: &str) -> Vec<Result<FileDiff, ExtractError>> {
    let mut out = Vec::new();
    let mut current = Section::default();

    for raw_line in text.lines() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);

        // Inside a hunk with lines still expected, everything is hunk body.
        if let Some(open) = current.open.as_mut() {
            if !open.is_complete() {
                if consume_hunk_line(open, line) {
                    continue;
                }
                // Anything else ends the hunk early; fall through to headers.
            } else if line.starts_with('\\') {
                continue;
            }
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            push_section(&mut out, std::mem::take(&mut current));
            if let Some((a, b)) = rest.rsplit_once(" b/") {
                current.file.old_path = clean_path(a);
                current.file.new_path = clean_path(&format!("b/{b}"));
            }
            continue;
        }

        if line.starts_with("--- ") {
            // A second `---` without `diff --git` starts a new plain-diff section.
            if current.saw_old_header || !current.file.hunks.is_empty() || current.open.is_some() {
                push_section(&mut out, std::mem::take(&mut current));
            }
            current.close_hunk();
            current.saw_old_header = true;
            current.file.old_path = clean_path(&line[4..]);
            continue;
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            if current.saw_old_header && current.file.hunks.is_empty() && current.open.is_none() {
                current.file.new_path = clean_path(rest);
                continue;
            }
        }

        if line.starts_with("new file mode") {
            current.file.old_path = None;
            continue;
        }
        if line.starts_with("deleted file mode") {
            current.file.new_path = None;
            continue;
        }
        if let Some(from) = line.strip_prefix("rename from ") {
            current.file.is_rename = true;
            current.file.old_path = clean_path(from);
            continue;
        }
        if let Some(to) = line.strip_prefix("rename to ") {
            current.file.is_rename = true;
            current.file.new_path = clean_path(to);
            continue;
        }
        if (line.starts_with("Binary files ") && line.ends_with(" differ"))
            || line == "GIT binary patch"
        {
            current.file.is_binary = true;
            continue;
        }

        if line.starts_with("@@") {
            current.close_hunk();
            match parse_hunk_header(line) {
                Some((old_start, old_len, new_start, new_len)) => {
                    current.open = Some(OpenHunk {
                        hunk: Hunk {
                            old_start,
                            old_len,
                            new_start,
                            new_len,
                            header: line.to_string(),
                            lines: Vec::new(),
                        },
                        old_left: old_len,
                        new_left: new_len,
                        next_old: old_start,
                        next_new: new_start,
                    });
                }
                None => {
                    if current.error.is_none() {
                        current.error = Some(ExtractError::MalformedHunkHeader {
                            path: current.file.path().to_string(),
                            header: line.to_string(),
                        });
                    }
                }
            }
            continue;
        }

        // index, similarity, mode lines and stray text are ignored.
    }

    push_section(&mut out, current);
    out
}

fn push_section(out: &mut Vec<Result<FileDiff, ExtractError>>, section: Section) {
    if let Some(result) = section.finish() {
        out.push(result);
    }
}

/// Returns `false` when `line` cannot belong to the hunk body.
fn consume_hunk_line(open: &mut OpenHunk, line: &str) -> bool {
    if line.starts_with('\\') {
        return true;
    }
    let (kind, text) = match line.chars().next() {
        Some('+') => (LineKind::Added, &line[1..]),
        Some('-') => (LineKind::Removed, &line[1..]),
        Some(' ') => (LineKind::Context, &line[1..]),
        // Some tools strip the space of an empty context line.
        None => (LineKind::Context, ""),
        Some(_) => return false,
    };

    let (old_line, new_line) = match kind {
        LineKind::Context => {
            if open.old_left == 0 || open.new_left == 0 {
                return false;
            }
            open.old_left -= 1;
            open.new_left -= 1;
            let pos = (Some(open.next_old), Some(open.next_new));
            open.next_old += 1;
            open.next_new += 1;
            pos
        }
        LineKind::Added => {
            if open.new_left == 0 {
                return false;
            }
            open.new_left -= 1;
            let pos = (None, Some(open.next_new));
            open.next_new += 1;
            pos
        }
        LineKind::Removed => {
            if open.old_left == 0 {
                return false;
            }
            open.old_left -= 1;
            let pos = (Some(open.next_old), None);
            open.next_old += 1;
            pos
        }
    };

    open.hunk.lines.push(DiffLine {
        kind,
        text: text.to_string(),
        old_line,
        new_line,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODIFY: &str = "diff --git a/pkg/io.py b/pkg/io.py\nindex 1111111..2222222 100644\n--- a/pkg/io.py\n+++ b/pkg/io.py\n@@ -1,4 +1,5 @@\n import os\n-def load(p):\n+def load(p, mode='r'):\n+    # read\n     return open(p).read()\n \n";

    #[test]
    fn test_parse_modification_line_numbers() {
        let files = parse_unified_diff(MODIFY);
        assert_eq!(files.len(), 1);
        let file = files[0].as_ref().expect("parsed");
        assert_eq!(file.old_path.as_deref(), Some("pkg/io.py"));
        assert_eq!(file.new_path.as_deref(), Some("pkg/io.py"));
        assert_eq!(file.hunks.len(), 1);

        let hunk = &file.hunks[0];
        let removed: Vec<_> = hunk
            .lines
            .iter()
            .filter(|l| l.kind == LineKind::Removed)
            .map(|l| l.old_line)
            .collect();
        let added: Vec<_> = hunk
            .lines
            .iter()
            .filter(|l| l.kind == LineKind::Added)
            .map(|l| l.new_line)
            .collect();
        assert_eq!(removed, vec![Some(2)]);
        assert_eq!(added, vec![Some(2), Some(3)]);
        assert!(file.is_textual());
    }

    #[test]
    fn test_parse_new_deleted_and_binary() {
        let text = "diff --git a/new.py b/new.py\nnew file mode 100644\n--- /dev/null\n+++ b/new.py\n@@ -0,0 +1 @@\n+x = 1\ndiff --git a/old.py b/old.py\ndeleted file mode 100644\n--- a/old.py\n+++ /dev/null\n@@ -1 +0,0 @@\n-y = 2\ndiff --git a/logo.png b/logo.png\nBinary files a/logo.png and b/logo.png differ\n";
        let files: Vec<FileDiff> = parse_unified_diff(text)
            .into_iter()
            .map(|r| r.expect("parsed"))
            .collect();
        assert_eq!(files.len(), 3);
        assert!(files[0].is_new());
        assert_eq!(files[0].path(), "new.py");
        assert!(files[1].is_deleted());
        assert_eq!(files[1].path(), "old.py");
        assert!(files[2].is_binary);
        assert!(!files[2].is_textual());
    }

    #[test]
    fn test_parse_rename() {
        let text = "diff --git a/a.py b/b.py\nsimilarity index 100%\nrename from a.py\nrename to b.py\n";
        let files = parse_unified_diff(text);
        let file = files[0].as_ref().expect("parsed");
        assert!(file.is_rename);
        assert_eq!(file.old_path.as_deref(), Some("a.py"));
        assert_eq!(file.new_path.as_deref(), Some("b.py"));
        assert!(file.is_textual());
    }

    #[test]
    fn test_malformed_header_is_isolated_to_its_file() {
        let text = "--- a/x.py\n+++ b/x.py\n@@ garbage @@\n+oops\n--- a/y.py\n+++ b/y.py\n@@ -1 +1 @@\n-a\n+b\n";
        let files = parse_unified_diff(text);
        assert_eq!(files.len(), 2);
        assert!(matches!(
            files[0],
            Err(ExtractError::MalformedHunkHeader { .. })
        ));
        assert_eq!(files[1].as_ref().expect("second parses").path(), "y.py");
    }

    #[test]
    fn test_removed_line_that_looks_like_header() {
        let text = "--- a/x.sql\n+++ b/x.sql\n@@ -1,2 +1,1 @@\n--- comment\n keep\n";
        let files = parse_unified_diff(text);
        let file = files[0].as_ref().expect("parsed");
        assert_eq!(file.hunks[0].lines[0].kind, LineKind::Removed);
        assert_eq!(file.hunks[0].lines[0].text, "-- comment");
    }

    #[test]
    fn test_hunk_header_defaults() {
        assert_eq!(parse_hunk_header("@@ -3 +4 @@ fn x"), Some((3, 1, 4, 1)));
        assert_eq!(parse_hunk_header("@@ -0,0 +1,2 @@"), Some((0, 0, 1, 2)));
        assert_eq!(parse_hunk_header("@@ nope @@"), None);
    }

    #[test]
    fn test_no_newline_marker_ignored() {
        let text = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n\\ No newline at end of file\n";
        let files = parse_unified_diff(text);
        let file = files[0].as_ref().expect("parsed");
        assert_eq!(file.hunks[0].lines.len(), 2);
    }
}
