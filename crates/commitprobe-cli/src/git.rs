//! Reading a commit out of a git repository.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use commitprobe_core::extract::parse_unified_diff;
use commitprobe_core::{CommitInput, Language};
use tracing::debug;

/// Object id of the empty tree; the parent side of a root commit.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Tracked files larger than this are left out of tree exports.
const MAX_TREE_FILE_BYTES: u64 = 512 * 1024;

fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .context("failed to run git")
}

fn git_stdout(repo: &Path, args: &[&str]) -> Result<String> {
    let output = git(repo, args)?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    git(dir, &["rev-parse", "--is-inside-work-tree"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve `rev` to a full commit SHA.
pub fn resolve_rev(repo: &Path, rev: &str) -> Result<String> {
    let spec = format!("{rev}^{{commit}}");
    let sha = git_stdout(repo, &["rev-parse", "--verify", &spec])?
        .trim()
        .to_string();
    if sha.is_empty() {
        bail!("git rev-parse {rev} returned empty output");
    }
    Ok(sha)
}

/// The commit's first parent, or the empty tree for a root commit.
fn parent_of(repo: &Path, sha: &str) -> String {
    resolve_rev(repo, &format!("{sha}~1")).unwrap_or_else(|_| EMPTY_TREE.to_string())
}

/// Unified diff of `sha` against `parent`, with rename detection.
pub fn commit_diff(repo: &Path, parent: &str, sha: &str) -> Result<String> {
    git_stdout(
        repo,
        &["diff", "--no-color", "--no-ext-diff", "-M", parent, sha],
    )
}

/// Text of `path` at `rev`; `None` when it does not exist there or is not UTF-8.
pub fn file_at(repo: &Path, rev: &str, path: &str) -> Option<String> {
    let object = format!("{rev}:{path}");
    let output = git(repo, &["show", &object]).ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Build the extractor input for `rev`: the diff plus both sides of every
/// changed text file.
pub fn collect_commit(repo: &Path, rev: &str) -> Result<CommitInput> {
    if !is_git_repo(repo) {
        bail!("{} is not inside a git work tree", repo.display());
    }
    let sha = resolve_rev(repo, rev)?;
    let parent = parent_of(repo, &sha);
    let diff = commit_diff(repo, &parent, &sha)?;

    let mut input = CommitInput::new(sha.clone(), diff);
    for file in parse_unified_diff(&input.diff).into_iter().flatten() {
        if file.is_binary {
            continue;
        }
        if let Some(old) = file.old_path.as_deref() {
            if let Some(text) = file_at(repo, &parent, old) {
                input.pre_sources.insert(old.to_string(), text);
            }
        }
        if let Some(new) = file.new_path.as_deref() {
            if let Some(text) = file_at(repo, &sha, new) {
                input.post_sources.insert(new.to_string(), text);
            }
        }
    }
    debug!(
        commit = %sha,
        pre = input.pre_sources.len(),
        post = input.post_sources.len(),
        "collected commit"
    );
    Ok(input)
}

/// A blob in a commit's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub size: u64,
}

/// Regular blobs tracked at `rev` (submodules and symlinks excluded).
pub fn tracked_files(repo: &Path, rev: &str) -> Result<Vec<TreeEntry>> {
    let listing = git_stdout(repo, &["ls-tree", "-r", "-l", "-z", rev])?;
    let mut entries = Vec::new();
    for record in listing.split('\0').filter(|r| !r.is_empty()) {
        let Some((meta, path)) = record.split_once('\t') else {
            continue;
        };
        let fields: Vec<&str> = meta.split_whitespace().collect();
        let [mode, kind, _object, size] = fields[..] else {
            continue;
        };
        if kind != "blob" || mode == "120000" {
            continue;
        }
        let Ok(size) = size.parse() else {
            continue;
        };
        entries.push(TreeEntry {
            path: path.to_string(),
            size,
        });
    }
    Ok(entries)
}

fn is_hidden(path: &str) -> bool {
    path.split('/').any(|component| component.starts_with('.'))
}

/// Fill `input.context_sources` with the unchanged text files of the
/// commit's tree, so synthesized tests can import them. Returns how many
/// files were added.
pub fn collect_context(repo: &Path, input: &mut CommitInput) -> Result<usize> {
    let mut added = 0;
    for entry in tracked_files(repo, &input.commit_id)? {
        if entry.size > MAX_TREE_FILE_BYTES || input.post_sources.contains_key(&entry.path) {
            continue;
        }
        if let Some(text) = file_at(repo, &input.commit_id, &entry.path) {
            input.context_sources.insert(entry.path, text);
            added += 1;
        }
    }
    debug!(commit = %input.commit_id, files = added, "collected tree context");
    Ok(added)
}

/// Baseline input for `rev`: every tracked source file in a supported
/// language is presented as newly added.
pub fn collect_tree(repo: &Path, rev: &str) -> Result<CommitInput> {
    if !is_git_repo(repo) {
        bail!("{} is not inside a git work tree", repo.display());
    }
    let sha = resolve_rev(repo, rev)?;
    let mut files = Vec::new();
    for entry in tracked_files(repo, &sha)? {
        if entry.size > MAX_TREE_FILE_BYTES
            || is_hidden(&entry.path)
            || Language::from_path(&entry.path).is_none()
        {
            continue;
        }
        if let Some(text) = file_at(repo, &sha, &entry.path) {
            files.push((entry.path, text));
        }
    }
    debug!(commit = %sha, files = files.len(), "collected tree baseline");
    Ok(CommitInput::baseline(sha, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["config", "commit.gpgsign", "false"]);
        dir
    }

    fn commit_file(repo: &Path, path: &str, text: &str, message: &str) {
        if let Some(parent) = repo.join(path).parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(repo.join(path), text).unwrap();
        run_git(repo, &["add", path]);
        run_git(repo, &["commit", "-m", message]);
    }

    #[test]
    fn is_git_repo_false_for_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
        assert!(collect_commit(dir.path(), "HEAD").is_err());
    }

    #[test]
    fn resolve_rev_returns_40_hex_chars() {
        let repo = make_git_repo();
        commit_file(repo.path(), "a.py", "x = 1\n", "initial");
        let sha = resolve_rev(repo.path(), "HEAD").unwrap();
        assert_eq!(sha.len(), 40);
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(resolve_rev(repo.path(), "no-such-branch").is_err());
    }

    #[test]
    fn root_commit_diffs_against_empty_tree() {
        let repo = make_git_repo();
        commit_file(repo.path(), "a.py", "def f():\n    return 1\n", "initial");

        let input = collect_commit(repo.path(), "HEAD").unwrap();
        assert!(input.diff.contains("+++ b/a.py"));
        assert!(input.pre_sources.is_empty());
        assert_eq!(input.post_sources["a.py"], "def f():\n    return 1\n");
    }

    #[test]
    fn collect_commit_reads_both_sides() {
        let repo = make_git_repo();
        commit_file(repo.path(), "a.py", "def f():\n    return 1\n", "initial");
        commit_file(repo.path(), "a.py", "def f():\n    return 2\n", "change");

        let input = collect_commit(repo.path(), "HEAD").unwrap();
        assert_eq!(input.commit_id, resolve_rev(repo.path(), "HEAD").unwrap());
        assert!(input.diff.contains("-    return 1"));
        assert!(input.diff.contains("+    return 2"));
        assert_eq!(input.pre_sources["a.py"], "def f():\n    return 1\n");
        assert_eq!(input.post_sources["a.py"], "def f():\n    return 2\n");
    }

    #[test]
    fn file_at_missing_path_is_none() {
        let repo = make_git_repo();
        commit_file(repo.path(), "a.py", "x = 1\n", "initial");
        assert!(file_at(repo.path(), "HEAD", "missing.py").is_none());
    }

    #[test]
    fn collect_context_adds_unchanged_files_only() {
        let repo = make_git_repo();
        commit_file(repo.path(), "util.py", "def twice(x):\n    return 2 * x\n", "util");
        commit_file(repo.path(), "notes.txt", "plain text\n", "notes");
        commit_file(repo.path(), "calc.py", "from util import twice\n", "calc");

        let mut input = collect_commit(repo.path(), "HEAD").unwrap();
        let added = collect_context(repo.path(), &mut input).unwrap();
        assert_eq!(added, 2);
        assert_eq!(input.context_sources["util.py"], "def twice(x):\n    return 2 * x\n");
        assert!(input.context_sources.contains_key("notes.txt"));
        assert!(!input.context_sources.contains_key("calc.py"));
        assert!(input.workspace_files().contains_key("calc.py"));
    }

    #[test]
    fn collect_tree_presents_sources_as_added() {
        let repo = make_git_repo();
        commit_file(repo.path(), "pkg/calc.py", "def add(a, b):\n    return a + b\n", "calc");
        commit_file(repo.path(), "README.md", "# demo\n", "readme");
        commit_file(repo.path(), ".hidden/tool.py", "x = 1\n", "hidden");
        commit_file(repo.path(), "pkg/calc.py", "def add(a, b):\n    return a - b\n", "change");

        let input = collect_tree(repo.path(), "HEAD").unwrap();
        assert_eq!(input.commit_id, resolve_rev(repo.path(), "HEAD").unwrap());
        assert!(input.pre_sources.is_empty());
        let paths: Vec<&str> = input.post_sources.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["pkg/calc.py"]);
        assert!(input.diff.contains("+++ b/pkg/calc.py"));
        assert!(input.diff.contains("+    return a - b"));

        let extraction = commitprobe_core::extract(&input, false).unwrap();
        assert_eq!(extraction.units.len(), 1);
        assert_eq!(extraction.units[0].id.symbol, "add");
    }

    #[test]
    fn tracked_files_reports_sizes() {
        let repo = make_git_repo();
        commit_file(repo.path(), "a.py", "x = 1\n", "initial");
        let entries = tracked_files(repo.path(), "HEAD").unwrap();
        assert_eq!(
            entries,
            vec![TreeEntry {
                path: "a.py".to_string(),
                size: 6
            }]
        );
    }
}
