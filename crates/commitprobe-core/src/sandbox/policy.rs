//! Sandbox policy: environment allow-list, network isolation, output caps
//! and per-language command templates.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{SandboxError, SandboxResult};
use crate::syntax::Language;

/// Unroutable proxy every network-aware tool is pointed at.
pub const BLACK_HOLE_PROXY: &str = "http://127.0.0.1:9";

const PROXY_VARS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "all_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkIsolation {
    /// Proxy variables only.
    EnvOnly,
    /// Run inside a fresh network namespace via `unshare -rn` (Linux).
    Unshare,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxPolicy {
    /// Variables copied from the parent environment, when set.
    pub env_allowlist: Vec<String>,
    pub network: NetworkIsolation,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
    /// Interpreter used for the Python coverage harness.
    pub python: String,
    /// Command templates keyed by language name. Placeholders:
    /// `{test_file}`, `{target_file}`, `{workdir}`.
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert(
            Language::JavaScript.as_str().to_string(),
            vec!["node".to_string(), "--test".to_string(), "{test_file}".to_string()],
        );
        commands.insert(
            Language::Go.as_str().to_string(),
            vec!["go".to_string(), "test".to_string(), "./...".to_string()],
        );
        commands.insert(
            Language::Shell.as_str().to_string(),
            vec!["sh".to_string(), "{test_file}".to_string()],
        );
        Self {
            env_allowlist: ["PATH", "LANG", "LC_ALL", "TZ", "SYSTEMROOT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            network: NetworkIsolation::EnvOnly,
            max_output_bytes: 64 * 1024,
            python: "python3".to_string(),
            commands,
        }
    }
}

/// Values substituted into a command template.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub test_file: &'a str,
    pub target_file: &'a str,
    pub workdir: &'a Path,
}

impl SandboxPolicy {
    pub fn validate(&self) -> SandboxResult<()> {
        if self.max_output_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "maxOutputBytes must be positive".to_string(),
            ));
        }
        if self.python.trim().is_empty() {
            return Err(SandboxError::InvalidConfig("python must be set".to_string()));
        }
        if let Some((language, _)) = self.commands.iter().find(|(_, argv)| argv.is_empty()) {
            return Err(SandboxError::InvalidConfig(format!(
                "empty command template for {language}"
            )));
        }
        Ok(())
    }

    pub fn command_template(&self, language: Language) -> Option<&[String]> {
        self.commands.get(language.as_str()).map(Vec::as_slice)
    }

    /// Substitute placeholders and apply network isolation.
    pub fn render(&self, template: &[String], vars: &TemplateVars<'_>) -> Vec<String> {
        let workdir = vars.workdir.display().to_string();
        let argv = template.iter().map(|arg| {
            arg.replace("{test_file}", vars.test_file)
                .replace("{target_file}", vars.target_file)
                .replace("{workdir}", &workdir)
        });
        match self.network {
            NetworkIsolation::EnvOnly => argv.collect(),
            NetworkIsolation::Unshare => ["unshare", "-rn", "--"]
                .iter()
                .map(|s| s.to_string())
                .chain(argv)
                .collect(),
        }
    }

    /// The complete child environment for a sandbox rooted at `workdir`.
    pub fn environment(
        &self,
        workdir: &Path,
        parent: impl Fn(&str) -> Option<String>,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for name in &self.env_allowlist {
            if let Some(value) = parent(name) {
                env.insert(name.clone(), value);
            }
        }
        env.insert("HOME".to_string(), workdir.join("home").display().to_string());
        env.insert("TMPDIR".to_string(), workdir.join("tmp").display().to_string());
        for var in PROXY_VARS {
            env.insert(var.to_string(), BLACK_HOLE_PROXY.to_string());
        }
        env.insert("NO_PROXY".to_string(), String::new());
        env.insert("no_proxy".to_string(), String::new());
        env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        env.insert("PYTHONHASHSEED".to_string(), "0".to_string());
        env
    }
}
