//! Process-based sandbox.
//!
//! Each execution gets a fresh temporary directory, a cleared environment
//! and a hard wall-clock limit. The child is killed when the limit expires
//! or the future is dropped.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::error::{SandboxError, SandboxResult};
use super::harness::{parse_coverage, COVERAGE_FILE, HARNESS_FILE, PYTHON_HARNESS};
use super::policy::{SandboxPolicy, TemplateVars};
use super::request::{ExecutionRequest, ExecutionResult, SandboxFile};
use super::SandboxExecutor;
use crate::syntax::Language;

pub struct ProcessSandbox {
    policy: SandboxPolicy,
}

impl ProcessSandbox {
    pub fn new(policy: SandboxPolicy) -> SandboxResult<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    fn argv(&self, request: &ExecutionRequest, workdir: &Path) -> SandboxResult<Vec<String>> {
        let vars = TemplateVars {
            test_file: &request.test_file,
            target_file: &request.target_file,
            workdir,
        };
        let template = match request.language {
            Some(Language::Python) => vec![
                self.policy.python.clone(),
                format!("{{workdir}}/{HARNESS_FILE}"),
                "{workdir}".to_string(),
                "{test_file}".to_string(),
                "{target_file}".to_string(),
                format!("{{workdir}}/{COVERAGE_FILE}"),
            ],
            Some(language) => self
                .policy
                .command_template(language)
                .ok_or_else(|| SandboxError::NoCommand {
                    language: language.as_str().to_string(),
                })?
                .to_vec(),
            None => {
                return Err(SandboxError::NoCommand {
                    language: "unknown".to_string(),
                })
            }
        };
        Ok(self.policy.render(&template, &vars))
    }
}

/// Resolve `path` under `root`, rejecting absolute paths and `..`.
fn sandbox_path(root: &Path, path: &str) -> SandboxResult<PathBuf> {
    let relative = Path::new(path);
    let clean = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !clean {
        return Err(SandboxError::UnsafePath {
            path: path.to_string(),
        });
    }
    Ok(root.join(relative))
}

async fn materialize(root: &Path, files: &[SandboxFile]) -> SandboxResult<()> {
    for file in files {
        let dest = sandbox_path(root, &file.path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(SandboxError::Workspace)?;
        }
        tokio::fs::write(&dest, &file.contents)
            .await
            .map_err(SandboxError::Workspace)?;
    }
    Ok(())
}

/// Drain `reader`, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (String, bool) {
    let Some(mut reader) = reader else {
        return (String::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl SandboxExecutor for ProcessSandbox {
    async fn execute(&self, request: &ExecutionRequest) -> SandboxResult<ExecutionResult> {
        let dir = tempfile::Builder::new()
            .prefix("commitprobe-")
            .tempdir()
            .map_err(SandboxError::Workspace)?;
        let workdir = dir.path();
        for sub in ["home", "tmp"] {
            tokio::fs::create_dir_all(workdir.join(sub))
                .await
                .map_err(SandboxError::Workspace)?;
        }
        materialize(workdir, &request.files).await?;
        let python = request.language == Some(Language::Python);
        if python {
            materialize(workdir, &[SandboxFile::new(HARNESS_FILE, PYTHON_HARNESS)]).await?;
        }

        let argv = self.argv(request, workdir)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::InvalidConfig("empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .env_clear()
            .envs(self.policy.environment(workdir, |name| std::env::var(name).ok()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %program, test_file = %request.test_file, "sandbox spawn");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.policy.max_output_bytes;
        let limit = request.timeout.max(Duration::from_millis(1));

        let waited = tokio::time::timeout(limit, async {
            tokio::join!(
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            )
        })
        .await;

        let ((stdout, out_cut), (stderr, err_cut), status) = match waited {
            Ok(done) => done,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!(test_file = %request.test_file, limit_ms = limit.as_millis() as u64, "sandbox timeout");
                return Ok(ExecutionResult::timeout(elapsed_ms(start)));
            }
        };
        let status = status.map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        let duration_ms = elapsed_ms(start);

        let executed_lines = if python {
            tokio::fs::read_to_string(workdir.join(COVERAGE_FILE))
                .await
                .ok()
                .and_then(|text| parse_coverage(&text))
        } else {
            None
        };

        Ok(ExecutionResult {
            exit_code: status.code(),
            timed_out: false,
            stdout,
            stderr,
            truncated: out_cut || err_cut,
            executed_lines,
            duration_ms,
        })
    }
}
