//! Commit units: the minimal analyzable pieces of a commit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::syntax::Language;

/// Identity of a unit within a commit: path, qualified symbol and line range.
///
/// The line range refers to the post-commit file when the unit still exists
/// after the commit, otherwise to the pre-commit file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub path: String,
    pub symbol: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl UnitId {
    pub fn new(path: impl Into<String>, symbol: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            path: path.into(),
            symbol: symbol.into(),
            start_line: start,
            end_line: end,
        }
    }

    /// Number of lines covered by the unit (at least one).
    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    /// Returns `true` when `line` falls inside the unit's range.
    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.start_line && line <= self.end_line
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}::{}@L{}-{}",
            self.path, self.symbol, self.start_line, self.end_line
        )
    }
}

/// Syntactic kind of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Function,
    Method,
    /// Class, struct, trait, interface or impl block.
    Class,
    /// Statements outside every definition in a file.
    ModuleBlock,
    /// Fallback when a file cannot be split syntactically.
    WholeFile,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Function => "function",
            UnitKind::Method => "method",
            UnitKind::Class => "class",
            UnitKind::ModuleBlock => "module_block",
            UnitKind::WholeFile => "whole_file",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable content fingerprint of a unit (SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a unit from its kind, qualified symbol and bodies.
    ///
    /// Bodies are normalized first (CRLF folded, trailing whitespace and
    /// blank lines dropped) so formatting-only churn keeps the fingerprint.
    pub fn of_unit(kind: UnitKind, symbol: &str, pre: Option<&str>, post: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(symbol.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_body(pre.unwrap_or_default()).as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_body(post.unwrap_or_default()).as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Wrap an existing hex digest (e.g. one read back from a persistent store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fingerprint of this content at `path`. Synthesized tests import the
    /// unit by its module path, so they are keyed by placement too.
    pub fn placed_at(&self, path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Leading `len` bytes, or the whole value when that is not a char boundary.
    pub fn prefix(&self, len: usize) -> &str {
        self.0.get(..len).unwrap_or(&self.0)
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        self.prefix(12)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_body(body: &str) -> String {
    body.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// A single declared parameter of a callable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub annotation: Option<String>,
}

/// Interface of a unit as it appears in source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSignature {
    /// First line of the definition, trimmed.
    pub header: String,
    pub params: Vec<Param>,
    pub returns: Option<String>,
}

/// A minimal analyzable unit of a commit. Immutable once extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    pub language: Option<Language>,
    /// Hunks touching this unit, in unified diff form.
    pub diff: String,
    /// Full body before the commit (absent for added code).
    pub pre_body: Option<String>,
    /// Full body after the commit (absent for removed code).
    pub post_body: Option<String>,
    pub signature: Option<UnitSignature>,
    /// Headers of the other definitions in the same file.
    pub context_signatures: Vec<String>,
    pub fingerprint: Fingerprint,
}

impl CommitUnit {
    /// The body a model or test should look at: post-commit if present.
    pub fn body(&self) -> &str {
        self.post_body
            .as_deref()
            .or(self.pre_body.as_deref())
            .unwrap_or_default()
    }

    /// Returns `true` when the commit removed the unit entirely.
    pub fn is_removed(&self) -> bool {
        self.post_body.is_none()
    }
}
