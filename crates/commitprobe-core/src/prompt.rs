//! Prompt templates.
//!
//! Prompts are pure functions of the unit (and assessment). Synthesis prompts
//! name the unit's module, so tests are cached under the fingerprint placed at
//! the unit's path; risk answers are keyed by content and prompt version only.

use std::fmt::Write;

use crate::domain::assessment::RiskAssessment;
use crate::domain::unit::CommitUnit;
use crate::syntax::Language;

/// Importable module path for a source file (`pkg/io.py` -> `pkg.io`).
pub fn module_path(path: &str) -> String {
    let stem = path.rsplit_once('.').map_or(path, |(stem, _)| stem);
    stem.trim_start_matches("./").replace(['/', '\\'], ".")
}

fn framework_hint(language: Option<Language>) -> &'static str {
    match language {
        Some(Language::Python) => {
            "Write a self-contained Python `unittest` module. Exit status must be non-zero on failure."
        }
        Some(Language::Rust) => "Write Rust `#[test]` functions.",
        Some(Language::JavaScript) | Some(Language::TypeScript) => {
            "Write a script using `node:assert` that exits non-zero on failure."
        }
        Some(Language::Go) => "Write a Go `_test.go` file using the `testing` package.",
        Some(Language::Shell) | None => "Write a shell script that exits 1 when an assertion fails.",
    }
}

fn push_unit_context(out: &mut String, unit: &CommitUnit) {
    let _ = writeln!(out, "File: {}", unit.id.path);
    let _ = writeln!(out, "Unit: {} ({})", unit.id.symbol, unit.kind);
    let _ = writeln!(out, "Lines: {}-{}", unit.id.start_line, unit.id.end_line);
    if let Some(lang) = unit.language {
        let _ = writeln!(out, "Language: {lang}");
    }

    if let Some(sig) = &unit.signature {
        let _ = writeln!(out, "Signature: {}", sig.header);
        for param in &sig.params {
            match &param.annotation {
                Some(ann) => {
                    let _ = writeln!(out, "  param {}: {}", param.name, ann);
                }
                None => {
                    let _ = writeln!(out, "  param {}", param.name);
                }
            }
        }
        if let Some(ret) = &sig.returns {
            let _ = writeln!(out, "  returns {ret}");
        }
    }

    if !unit.context_signatures.is_empty() {
        out.push_str("\nOther definitions in this file:\n");
        for header in &unit.context_signatures {
            let _ = writeln!(out, "  {header}");
        }
    }
}

/// Prompt asking for a defect-risk score.
pub fn risk_prompt(unit: &CommitUnit, prompt_version: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[commitprobe risk {prompt_version}]");
    out.push_str(
        "Estimate the probability that this change introduces a defect.\n\
         Reply with JSON only: {\"score\": <number in [0,1]>, \"tags\": [<short rationale tags>]}\n\n",
    );
    push_unit_context(&mut out, unit);

    out.push_str("\nDiff:\n");
    out.push_str(&unit.diff);
    if !unit.diff.ends_with('\n') {
        out.push('\n');
    }

    if unit.is_removed() {
        out.push_str("\nRemoved body:\n");
    } else {
        out.push_str("\nBody after the change:\n");
    }
    out.push_str(unit.body());
    out.push('\n');
    out
}

/// Prompt asking for a test of a high-risk unit.
///
/// `syntax_error` is set on the single re-prompt after a generated test
/// failed to parse.
pub fn synthesis_prompt(
    unit: &CommitUnit,
    assessment: &RiskAssessment,
    prompt_version: &str,
    test_file: &str,
    syntax_error: Option<&str>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[commitprobe synthesis {prompt_version}]");
    let _ = writeln!(
        out,
        "Write a focused test for the unit below. {}",
        framework_hint(unit.language)
    );
    let _ = writeln!(
        out,
        "The code under test is importable as module `{}`. The test file will be `{}`.",
        module_path(&unit.id.path),
        test_file
    );
    out.push_str("Reply with the test source in a single fenced code block, or {\"declined\": \"<reason>\"}.\n\n");

    push_unit_context(&mut out, unit);

    let _ = writeln!(out, "\nRisk score: {:.2}", assessment.score);
    if !assessment.tags.is_empty() {
        let tags: Vec<&str> = assessment.tags.iter().map(String::as_str).collect();
        let _ = writeln!(out, "Risk rationale: {}", tags.join(", "));
    }

    out.push_str("\nBody:\n");
    out.push_str(unit.body());
    out.push('\n');

    if let Some(err) = syntax_error {
        let _ = writeln!(
            out,
            "\nYour previous answer did not parse: {err}\nReturn a corrected, complete test."
        );
    }
    out
}
