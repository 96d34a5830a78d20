//! Diff unit extraction.
//!
//! Turns a commit (unified diff plus the pre- and post-commit text of every
//! changed file) into an ordered list of [`CommitUnit`]s. Every changed line
//! is attributed to the innermost definition enclosing it; lines outside all
//! definitions go to a per-file `<module>` unit, which is dropped when it
//! holds only blank lines and the file has other units. Files that cannot be
//! split syntactically degrade to one `whole_file` unit.

pub mod diff;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::unit::{CommitUnit, Fingerprint, UnitId, UnitKind};
use crate::syntax::{self, DefinitionSpan, Language};

pub use diff::{parse_unified_diff, write_added_file, DiffLine, FileDiff, Hunk, LineKind};

/// Symbol of the per-file unit holding module-level statements.
pub const MODULE_SYMBOL: &str = "<module>";
/// Symbol of the fallback unit covering a whole file.
pub const WHOLE_FILE_SYMBOL: &str = "<file>";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("malformed hunk header in {path}: {header}")]
    MalformedHunkHeader { path: String, header: String },

    #[error("hunk in {path} ended before its declared length: {header}")]
    TruncatedHunk { path: String, header: String },
}

/// Everything the extractor needs to know about one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInput {
    pub commit_id: String,
    /// Unified diff of the commit against its parent.
    pub diff: String,
    /// Parent-side text of changed files, by old path.
    pub pre_sources: BTreeMap<String, String>,
    /// Commit-side text of changed files, by new path.
    pub post_sources: BTreeMap<String, String>,
    /// Unchanged files of the tree at the commit. Never extracted; only
    /// materialized next to the changed files when tests run.
    #[serde(default)]
    pub context_sources: BTreeMap<String, String>,
}

impl CommitInput {
    pub fn new(commit_id: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            commit_id: commit_id.into(),
            diff: diff.into(),
            ..Default::default()
        }
    }

    pub fn with_pre_source(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.pre_sources.insert(path.into(), source.into());
        self
    }

    pub fn with_post_source(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.post_sources.insert(path.into(), source.into());
        self
    }

    pub fn with_context_source(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.context_sources.insert(path.into(), source.into());
        self
    }

    /// Baseline input: every file is presented as added by `commit_id`, so
    /// the whole tree is extracted, scored and tested.
    pub fn baseline<I, P, S>(commit_id: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = (P, S)>,
        P: Into<String>,
        S: Into<String>,
    {
        let mut input = Self::new(commit_id, String::new());
        for (path, source) in files {
            let (path, source) = (path.into(), source.into());
            if source.is_empty() {
                continue;
            }
            diff::write_added_file(&mut input.diff, &path, &source);
            input.post_sources.insert(path, source);
        }
        input
    }

    /// Files a test sandbox sees: the unchanged tree overlaid with the
    /// commit-side text of changed files.
    pub fn workspace_files(&self) -> BTreeMap<String, String> {
        let mut files = self.context_sources.clone();
        files.extend(
            self.post_sources
                .iter()
                .map(|(path, source)| (path.clone(), source.clone())),
        );
        files
    }
}

/// Result of extracting one commit.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub units: Vec<CommitUnit>,
    /// Files with a content change (a rename counts unless moves are detected).
    pub changed_files: usize,
    /// Pure renames recognized as moves.
    pub moved_files: usize,
    pub binary_files: usize,
    /// File sections skipped because their diff could not be parsed.
    pub skipped: Vec<ExtractError>,
}

impl Extraction {
    /// Nothing to analyze: empty diff, binary-only, mode-only or pure moves.
    pub fn is_empty_commit(&self) -> bool {
        self.changed_files == 0 && self.skipped.is_empty()
    }
}

/// Split a commit into units.
///
/// Malformed file sections are skipped; the call only fails when nothing at
/// all could be extracted and at least one section was malformed.
pub fn extract(input: &CommitInput, move_detection: bool) -> Result<Extraction, ExtractError> {
    let mut extraction = Extraction::default();

    for parsed in parse_unified_diff(&input.diff) {
        let file = match parsed {
            Ok(file) => file,
            Err(err) => {
                warn!(commit = %input.commit_id, error = %err, "skipping unparseable diff section");
                extraction.skipped.push(err);
                continue;
            }
        };

        if file.is_binary {
            extraction.binary_files += 1;
            continue;
        }
        if !file.is_textual() {
            continue;
        }
        if file.is_rename && move_detection && !file.hunks.iter().any(Hunk::has_changes) {
            extraction.moved_files += 1;
            continue;
        }
        extraction.changed_files += 1;

        for change in file_changes(&file, input, move_detection) {
            let units = units_for_change(&change, input);
            debug!(
                path = change.path(),
                units = units.len(),
                "extracted units"
            );
            extraction.units.extend(units);
        }
    }

    if extraction.units.is_empty() && !extraction.skipped.is_empty() {
        return Err(extraction.skipped.swap_remove(0));
    }
    Ok(extraction)
}

/// One side-consistent view of a file's changes. A rename without move
/// detection becomes two of these (a deletion and an addition).
struct FileChange<'a> {
    old_path: Option<&'a str>,
    new_path: Option<&'a str>,
    /// Removed lines (old numbering) with the new-side line they sit at.
    removed: BTreeMap<u32, u32>,
    /// Added lines (new numbering).
    added: BTreeSet<u32>,
    hunks: &'a [Hunk],
}

impl FileChange<'_> {
    fn path(&self) -> &str {
        self.new_path.or(self.old_path).unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

fn line_count(source: &str) -> u32 {
    source.lines().count() as u32
}

fn file_changes<'a>(
    file: &'a FileDiff,
    input: &'a CommitInput,
    move_detection: bool,
) -> Vec<FileChange<'a>> {
    if file.is_rename && !move_detection {
        let old = file.old_path.as_deref();
        let new = file.new_path.as_deref();

        let removed = match old.and_then(|p| input.pre_sources.get(p)) {
            Some(src) => (1..=line_count(src)).map(|l| (l, 1)).collect(),
            None => side_lines(&file.hunks, true).into_iter().map(|l| (l, 1)).collect(),
        };
        let added = match new.and_then(|p| input.post_sources.get(p)) {
            Some(src) => (1..=line_count(src)).collect(),
            None => side_lines(&file.hunks, false),
        };

        return vec![
            FileChange {
                old_path: old,
                new_path: None,
                removed,
                added: BTreeSet::new(),
                hunks: &file.hunks,
            },
            FileChange {
                old_path: None,
                new_path: new,
                removed: BTreeMap::new(),
                added,
                hunks: &file.hunks,
            },
        ];
    }

    let mut removed = BTreeMap::new();
    let mut added = BTreeSet::new();
    for hunk in &file.hunks {
        let mut cursor = hunk.new_start.max(1);
        for line in &hunk.lines {
            match line.kind {
                LineKind::Removed => {
                    if let Some(old) = line.old_line {
                        removed.insert(old, cursor);
                    }
                }
                LineKind::Added => {
                    if let Some(new) = line.new_line {
                        added.insert(new);
                        cursor = new;
                    }
                }
                LineKind::Context => {
                    if let Some(new) = line.new_line {
                        cursor = new;
                    }
                }
            }
        }
    }

    vec![FileChange {
        old_path: file.old_path.as_deref(),
        new_path: file.new_path.as_deref(),
        removed,
        added,
        hunks: &file.hunks,
    }]
}

/// Every line number a hunk set shows on one side.
fn side_lines(hunks: &[Hunk], old_side: bool) -> BTreeSet<u32> {
    hunks
        .iter()
        .flat_map(|h| h.lines.iter())
        .filter_map(|l| if old_side { l.old_line } else { l.new_line })
        .collect()
}

/// Text of one side as far as the hunks show it.
fn reconstruct(hunks: &[Hunk], old_side: bool) -> String {
    hunks
        .iter()
        .flat_map(|h| h.lines.iter())
        .filter(|l| match l.kind {
            LineKind::Context => true,
            LineKind::Removed => old_side,
            LineKind::Added => !old_side,
        })
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

enum SideSpans {
    /// The file does not exist on this side.
    Absent,
    Parsed(Vec<DefinitionSpan>),
    /// Unsupported language, missing text or syntax errors.
    Unusable,
}

fn side_spans(language: Option<Language>, path: Option<&str>, source: Option<&String>) -> SideSpans {
    if path.is_none() {
        return SideSpans::Absent;
    }
    match (language, source) {
        (Some(lang), Some(src)) => match syntax::definition_spans(lang, src) {
            Some(spans) => SideSpans::Parsed(spans),
            None => SideSpans::Unusable,
        },
        _ => SideSpans::Unusable,
    }
}

fn units_for_change(change: &FileChange<'_>, input: &CommitInput) -> Vec<CommitUnit> {
    if change.is_empty() {
        return Vec::new();
    }
    let language = Language::from_path(change.path());
    let pre_src = change.old_path.and_then(|p| input.pre_sources.get(p));
    let post_src = change.new_path.and_then(|p| input.post_sources.get(p));

    let pre = side_spans(language, change.old_path, pre_src);
    let post = side_spans(language, change.new_path, post_src);

    let (pre_spans, post_spans) = match (pre, post) {
        (SideSpans::Unusable, _) | (_, SideSpans::Unusable) => {
            return vec![whole_file_unit(change, language, pre_src, post_src)];
        }
        (SideSpans::Absent, SideSpans::Absent) => return Vec::new(),
        (pre, post) => (into_spans(pre), into_spans(post)),
    };

    split_by_definitions(
        change,
        language,
        pre_src.map(String::as_str),
        post_src.map(String::as_str),
        &pre_spans,
        &post_spans,
    )
}

fn into_spans(side: SideSpans) -> Option<Vec<DefinitionSpan>> {
    match side {
        SideSpans::Parsed(spans) => Some(spans),
        _ => None,
    }
}

fn whole_file_unit(
    change: &FileChange<'_>,
    language: Option<Language>,
    pre_src: Option<&String>,
    post_src: Option<&String>,
) -> CommitUnit {
    let pre_body = change
        .old_path
        .map(|_| pre_src.cloned().unwrap_or_else(|| reconstruct(change.hunks, true)));
    let post_body = change
        .new_path
        .map(|_| post_src.cloned().unwrap_or_else(|| reconstruct(change.hunks, false)));

    let end = post_body
        .as_deref()
        .or(pre_body.as_deref())
        .map(line_count)
        .unwrap_or(1)
        .max(1);

    let fingerprint = Fingerprint::of_unit(
        UnitKind::WholeFile,
        WHOLE_FILE_SYMBOL,
        pre_body.as_deref(),
        post_body.as_deref(),
    );

    CommitUnit {
        id: UnitId::new(change.path(), WHOLE_FILE_SYMBOL, 1, end),
        kind: UnitKind::WholeFile,
        language,
        diff: change.hunks.iter().map(Hunk::render).collect(),
        pre_body,
        post_body,
        signature: None,
        context_signatures: Vec::new(),
        fingerprint,
    }
}

/// A boundary: qualified symbol plus its ordinal among same-named
/// definitions. Units past the first carry it as a suffix (`Foo#2`).
type BoundaryKey = (String, usize);

#[derive(Default)]
struct Touched {
    pre: BTreeSet<u32>,
    post: BTreeSet<u32>,
    /// New-side positions of removed lines.
    anchors: BTreeSet<u32>,
}

fn boundary_at(spans: &[DefinitionSpan], line: u32) -> BoundaryKey {
    match syntax::innermost_at(spans, line) {
        Some(span) => {
            let ordinal = spans
                .iter()
                .filter(|s| s.symbol == span.symbol && s.start_line < span.start_line)
                .count();
            (span.symbol.clone(), ordinal)
        }
        None => (MODULE_SYMBOL.to_string(), 0),
    }
}

fn span_for<'s>(spans: Option<&'s [DefinitionSpan]>, key: &BoundaryKey) -> Option<&'s DefinitionSpan> {
    spans?
        .iter()
        .filter(|s| s.symbol == key.0)
        .nth(key.1)
}

fn slice_lines(source: &str, start: u32, end: u32) -> String {
    source
        .lines()
        .skip(start.saturating_sub(1) as usize)
        .take(end.saturating_sub(start) as usize + 1)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lines outside every top-level definition.
fn module_body(source: &str, spans: &[DefinitionSpan]) -> String {
    source
        .lines()
        .enumerate()
        .filter(|(idx, _)| {
            let line = *idx as u32 + 1;
            !spans.iter().any(|s| s.depth == 0 && s.contains_line(line))
        })
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n")
}

fn split_by_definitions(
    change: &FileChange<'_>,
    language: Option<Language>,
    pre_src: Option<&str>,
    post_src: Option<&str>,
    pre_spans: &Option<Vec<DefinitionSpan>>,
    post_spans: &Option<Vec<DefinitionSpan>>,
) -> Vec<CommitUnit> {
    let pre_spans = pre_spans.as_deref();
    let post_spans = post_spans.as_deref();

    let mut touched: BTreeMap<BoundaryKey, Touched> = BTreeMap::new();
    if let Some(spans) = pre_spans {
        for (&line, &anchor) in &change.removed {
            let entry = touched.entry(boundary_at(spans, line)).or_default();
            entry.pre.insert(line);
            entry.anchors.insert(anchor);
        }
    }
    if let Some(spans) = post_spans {
        for &line in &change.added {
            touched
                .entry(boundary_at(spans, line))
                .or_default()
                .post
                .insert(line);
        }
    }

    let reference_spans = post_spans.or(pre_spans).unwrap_or_default();

    let mut units = Vec::with_capacity(touched.len());
    for (key, lines) in &touched {
        let unit = if key.0 == MODULE_SYMBOL {
            module_unit(change, language, pre_src, post_src, pre_spans, post_spans, lines)
        } else {
            match definition_unit(change, language, pre_src, post_src, pre_spans, post_spans, key) {
                Some(unit) => unit,
                None => continue,
            }
        };

        let mut unit = unit;
        unit.diff = diff_for(change.hunks, lines);
        unit.context_signatures = reference_spans
            .iter()
            .filter(|s| s.symbol != key.0 || s.start_line != unit.id.start_line)
            .map(|s| s.signature.header.clone())
            .filter(|h| !h.is_empty())
            .collect();
        units.push(unit);
    }

    // Blank lines between definitions are not worth a unit of their own.
    if units.len() > 1 {
        units.retain(|u| u.kind != UnitKind::ModuleBlock || !is_blank_module(u));
    }

    units.sort_by(|a, b| {
        a.id.start_line
            .cmp(&b.id.start_line)
            .then_with(|| a.id.symbol.cmp(&b.id.symbol))
    });
    units
}

fn is_blank_module(unit: &CommitUnit) -> bool {
    [&unit.pre_body, &unit.post_body]
        .into_iter()
        .all(|body| body.as_deref().map_or(true, |b| b.trim().is_empty()))
}

fn definition_unit(
    change: &FileChange<'_>,
    language: Option<Language>,
    pre_src: Option<&str>,
    post_src: Option<&str>,
    pre_spans: Option<&[DefinitionSpan]>,
    post_spans: Option<&[DefinitionSpan]>,
    key: &BoundaryKey,
) -> Option<CommitUnit> {
    let pre_span = span_for(pre_spans, key);
    let post_span = span_for(post_spans, key);
    let reference = post_span.or(pre_span)?;

    let pre_body = pre_span.zip(pre_src).map(|(s, src)| slice_lines(src, s.start_line, s.end_line));
    let post_body = post_span
        .zip(post_src)
        .map(|(s, src)| slice_lines(src, s.start_line, s.end_line));

    let path = if post_span.is_some() {
        change.new_path
    } else {
        change.old_path
    }
    .unwrap_or_default();

    let symbol = match key.1 {
        0 => reference.symbol.clone(),
        n => format!("{}#{}", reference.symbol, n + 1),
    };
    let fingerprint = Fingerprint::of_unit(
        reference.kind,
        &symbol,
        pre_body.as_deref(),
        post_body.as_deref(),
    );

    Some(CommitUnit {
        id: UnitId::new(path, symbol, reference.start_line, reference.end_line),
        kind: reference.kind,
        language,
        diff: String::new(),
        pre_body,
        post_body,
        signature: Some(reference.signature.clone()),
        context_signatures: Vec::new(),
        fingerprint,
    })
}

fn module_unit(
    change: &FileChange<'_>,
    language: Option<Language>,
    pre_src: Option<&str>,
    post_src: Option<&str>,
    pre_spans: Option<&[DefinitionSpan]>,
    post_spans: Option<&[DefinitionSpan]>,
    lines: &Touched,
) -> CommitUnit {
    let pre_body = pre_spans.zip(pre_src).map(|(spans, src)| module_body(src, spans));
    let post_body = post_spans.zip(post_src).map(|(spans, src)| module_body(src, spans));

    // Range on the post side when the file survives, otherwise the pre side.
    let positions: BTreeSet<u32> = if change.new_path.is_some() {
        lines.post.union(&lines.anchors).copied().collect()
    } else {
        lines.pre.clone()
    };
    let start = positions.first().copied().unwrap_or(1);
    let end = positions.last().copied().unwrap_or(start);

    let fingerprint = Fingerprint::of_unit(
        UnitKind::ModuleBlock,
        MODULE_SYMBOL,
        pre_body.as_deref(),
        post_body.as_deref(),
    );

    CommitUnit {
        id: UnitId::new(change.path(), MODULE_SYMBOL, start, end),
        kind: UnitKind::ModuleBlock,
        language,
        diff: String::new(),
        pre_body,
        post_body,
        signature: None,
        context_signatures: Vec::new(),
        fingerprint,
    }
}

/// Hunks containing at least one of the unit's changed lines.
fn diff_for(hunks: &[Hunk], lines: &Touched) -> String {
    hunks
        .iter()
        .filter(|h| {
            h.lines.iter().any(|l| match l.kind {
                LineKind::Removed => l.old_line.is_some_and(|n| lines.pre.contains(&n)),
                LineKind::Added => l.new_line.is_some_and(|n| lines.post.contains(&n)),
                LineKind::Context => false,
            })
        })
        .map(Hunk::render)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRE: &str = "import os\n\ndef load(p):\n    return open(p).read()\n\nclass Reader:\n    size = 4\n\n    def read(self, n):\n        return n\n";
    const POST: &str = "import os\nimport sys\n\ndef load(p, mode='r'):\n    return open(p, mode).read()\n\nclass Reader:\n    size = 4\n\n    def read(self, n):\n        return n * 2\n";
    const DIFF: &str = "diff --git a/pkg/io.py b/pkg/io.py\n--- a/pkg/io.py\n+++ b/pkg/io.py\n@@ -1,4 +1,5 @@\n import os\n+import sys\n \n-def load(p):\n-    return open(p).read()\n+def load(p, mode='r'):\n+    return open(p, mode).read()\n@@ -9,2 +10,2 @@ class Reader:\n     def read(self, n):\n-        return n\n+        return n * 2\n";

    fn input() -> CommitInput {
        CommitInput::new("c1", DIFF)
            .with_pre_source("pkg/io.py", PRE)
            .with_post_source("pkg/io.py", POST)
    }

    #[test]
    fn test_one_unit_per_touched_boundary() {
        let extraction = extract(&input(), false).expect("extract");
        let symbols: Vec<&str> = extraction
            .units
            .iter()
            .map(|u| u.id.symbol.as_str())
            .collect();
        assert_eq!(symbols, vec![MODULE_SYMBOL, "load", "Reader.read"]);
        assert_eq!(extraction.changed_files, 1);

        let load = &extraction.units[1];
        assert_eq!(load.kind, UnitKind::Function);
        assert_eq!(load.id.start_line, 4);
        assert_eq!(load.id.end_line, 5);
        assert!(load.pre_body.as_deref().unwrap().contains("def load(p):"));
        assert!(load.post_body.as_deref().unwrap().contains("mode='r'"));
        assert!(load.diff.starts_with("@@ -1,4 +1,5 @@"));
        assert!(load
            .context_signatures
            .iter()
            .any(|h| h.starts_with("class Reader")));

        let read = &extraction.units[2];
        assert_eq!(read.kind, UnitKind::Method);
        assert!(read.diff.contains("return n * 2"));
        assert!(!read.diff.contains("mode='r'"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let a = extract(&input(), false).expect("extract");
        let b = extract(&input(), false).expect("extract");
        assert_eq!(a.units, b.units);
    }

    #[test]
    fn test_unsupported_language_degrades_to_whole_file() {
        let diff = "--- a/notes.txt\n+++ b/notes.txt\n@@ -1 +1 @@\n-old\n+new\n";
        let input = CommitInput::new("c2", diff)
            .with_pre_source("notes.txt", "old\n")
            .with_post_source("notes.txt", "new\n");
        let extraction = extract(&input, false).expect("extract");
        assert_eq!(extraction.units.len(), 1);
        let unit = &extraction.units[0];
        assert_eq!(unit.kind, UnitKind::WholeFile);
        assert_eq!(unit.post_body.as_deref(), Some("new\n"));
    }

    #[test]
    fn test_missing_source_reconstructs_from_hunks() {
        let diff = "--- a/x.py\n+++ b/x.py\n@@ -1,2 +1,2 @@\n a = 1\n-b = 2\n+b = 3\n";
        let extraction = extract(&CommitInput::new("c3", diff), false).expect("extract");
        let unit = &extraction.units[0];
        assert_eq!(unit.kind, UnitKind::WholeFile);
        assert_eq!(unit.pre_body.as_deref(), Some("a = 1\nb = 2"));
        assert_eq!(unit.post_body.as_deref(), Some("a = 1\nb = 3"));
    }

    #[test]
    fn test_binary_only_commit_is_empty() {
        let diff = "diff --git a/logo.png b/logo.png\nBinary files a/logo.png and b/logo.png differ\n";
        let extraction = extract(&CommitInput::new("c4", diff), false).expect("extract");
        assert!(extraction.units.is_empty());
        assert!(extraction.is_empty_commit());
        assert_eq!(extraction.binary_files, 1);
    }

    #[test]
    fn test_rename_is_delete_plus_add_without_move_detection() {
        let src = "def f():\n    return 1\n";
        let diff = "diff --git a/a.py b/b.py\nsimilarity index 100%\nrename from a.py\nrename to b.py\n";
        let input = CommitInput::new("c5", diff)
            .with_pre_source("a.py", src)
            .with_post_source("b.py", src);

        let split = extract(&input, false).expect("extract");
        assert_eq!(split.units.len(), 2);
        assert_eq!(split.units[0].id.path, "a.py");
        assert!(split.units[0].is_removed());
        assert_eq!(split.units[1].id.path, "b.py");
        assert!(split.units[1].pre_body.is_none());

        let moved = extract(&input, true).expect("extract");
        assert!(moved.units.is_empty());
        assert_eq!(moved.moved_files, 1);
        assert!(moved.is_empty_commit());
    }

    #[test]
    fn test_all_sections_malformed_is_an_error() {
        let diff = "--- a/x.py\n+++ b/x.py\n@@ broken @@\n+x\n";
        let err = extract(&CommitInput::new("c6", diff), false).unwrap_err();
        assert!(matches!(err, ExtractError::MalformedHunkHeader { .. }));
    }

    #[test]
    fn test_baseline_treats_every_file_as_added() {
        let input = CommitInput::baseline(
            "base",
            [
                ("pkg/io.py", POST),
                ("empty.py", ""),
                ("tool.sh", "echo hi"),
            ],
        );
        assert!(!input.post_sources.contains_key("empty.py"));

        let extraction = extract(&input, false).expect("extract");
        assert_eq!(extraction.changed_files, 2);
        assert!(extraction.units.iter().all(|u| u.pre_body.is_none()));
        let symbols: Vec<&str> = extraction
            .units
            .iter()
            .filter(|u| u.id.path == "pkg/io.py")
            .map(|u| u.id.symbol.as_str())
            .collect();
        assert!(symbols.contains(&"load"));
        assert!(symbols.contains(&"Reader.read"));
        let script = extraction
            .units
            .iter()
            .find(|u| u.id.path == "tool.sh")
            .expect("shell unit");
        assert_eq!(script.post_body.as_deref(), Some("echo hi"));
    }

    #[test]
    fn test_workspace_files_overlay_changed_files() {
        let input = input()
            .with_context_source("pkg/util.py", "X = 1\n")
            .with_context_source("pkg/io.py", "stale\n");
        let files = input.workspace_files();
        assert_eq!(files["pkg/util.py"], "X = 1\n");
        assert_eq!(files["pkg/io.py"], POST);
        let extraction = extract(&input, false).expect("extract");
        assert!(extraction.units.iter().all(|u| u.id.path == "pkg/io.py"));
    }

    #[test]
    fn test_duplicate_symbols_get_ordinal_suffix() {
        let input = CommitInput::baseline(
            "dup",
            [
                ("dup.py", "def f():\n    return 1\n\ndef f():\n    return 2\n"),
                (
                    "src/foo.rs",
                    "pub struct Foo {\n    x: u32,\n}\n\nimpl Foo {\n    fn new() -> Self {\n        Foo { x: 0 }\n    }\n}\n",
                ),
            ],
        );
        let extraction = extract(&input, false).expect("extract");
        let find = |path: &str, symbol: &str| {
            extraction
                .units
                .iter()
                .find(|u| u.id.path == path && u.id.symbol == symbol)
                .unwrap_or_else(|| panic!("no {path}::{symbol}"))
        };

        let first = find("dup.py", "f");
        let second = find("dup.py", "f#2");
        assert_eq!((first.id.start_line, second.id.start_line), (1, 4));
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(first.context_signatures, vec!["def f():".to_string()]);

        assert_eq!(find("src/foo.rs", "Foo").id.start_line, 1);
        assert_eq!(find("src/foo.rs", "Foo#2").id.start_line, 5);
        let ids: BTreeSet<_> = extraction.units.iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids.len(), extraction.units.len());
        assert!(extraction.units.iter().all(|u| u.kind != UnitKind::ModuleBlock));
    }

    #[test]
    fn test_deleted_function_keeps_pre_range() {
        let pre = "def a():\n    return 1\n\ndef b():\n    return 2\n";
        let post = "def a():\n    return 1\n";
        let diff = "--- a/m.py\n+++ b/m.py\n@@ -1,5 +1,2 @@\n def a():\n     return 1\n-\n-def b():\n-    return 2\n";
        let input = CommitInput::new("c7", diff)
            .with_pre_source("m.py", pre)
            .with_post_source("m.py", post);
        let extraction = extract(&input, false).expect("extract");
        let b = extraction
            .units
            .iter()
            .find(|u| u.id.symbol == "b")
            .expect("b extracted");
        assert!(b.is_removed());
        assert_eq!(b.id.start_line, 4);
        assert_eq!(b.id.end_line, 5);
    }
}
