//! ExpertWorker — the transport that actually executes an expert (§4.C).
//!
//! This is explicitly a collaborator interface: the core only depends on the
//! trait. `SubprocessWorker` is one concrete implementation (a CLI AI
//! assistant invoked per request), grounded on the teacher's pattern of
//! shelling out and capturing stdout/stderr (see `main.rs`'s CLI dispatch),
//! generalized here into a reusable, cancellable, environment-injecting
//! subprocess runner instead of ad hoc `Command::new` calls scattered through
//! a binary.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;
use crate::types::ExpertInstanceSpec;

/// `invoke(fullPrompt, workdir, instanceSpec?, deadline) -> proposalText`.
#[async_trait]
pub trait ExpertWorker: Send + Sync {
    async fn invoke(
        &self,
        expert_id: &str,
        prompt: &str,
        workdir: &str,
        instance_spec: Option<&ExpertInstanceSpec>,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<String, ClassifiedError>;
}

/// Maps an expert id to the CLI command used to invoke it (e.g. `claude` ->
/// `["claude", "-p"]`). Hosts own the actual mapping; this is deliberately a
/// thin, injectable table rather than hardcoded per-vendor branches.
pub struct SubprocessWorker {
    commands: std::collections::HashMap<String, Vec<String>>,
}

impl SubprocessWorker {
    pub fn new(commands: std::collections::HashMap<String, Vec<String>>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl ExpertWorker for SubprocessWorker {
    async fn invoke(
        &self,
        expert_id: &str,
        prompt: &str,
        workdir: &str,
        instance_spec: Option<&ExpertInstanceSpec>,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<String, ClassifiedError> {
        let argv = self.commands.get(expert_id).ok_or_else(|| {
            ClassifiedError::Unknown(format!("no subprocess command configured for {expert_id}"))
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ClassifiedError::Unknown("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop against orphaned subprocesses: if this `Child` is ever
            // dropped without an explicit `.kill()` (e.g. the future holding
            // it is dropped out from under a cancellation), the OS process
            // is killed anyway (§4.C / §9 "must propagate cancellation by
            // killing the child").
            .kill_on_drop(true);

        if let Some(spec) = instance_spec {
            cmd.env("EXPERT_SEED", spec.seed.to_string());
            cmd.env("EXPERT_TEMPERATURE", spec.temperature.to_string());
            cmd.env("EXPERT_INSTANCE_INDEX", spec.instance_index.to_string());
            cmd.env("EXPERT_REPLICA_COUNT", spec.replica_count.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ClassifiedError::Network(format!("failed to spawn {expert_id}: {e}")))?;

        {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(prompt.as_bytes()).await;
            }
        }

        let start = Instant::now();
        let wait_result = tokio::select! {
            result = tokio::time::timeout(deadline, child.wait()) => result,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ClassifiedError::Timeout(start.elapsed()));
            }
        };

        let status = match wait_result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ClassifiedError::Unknown(format!("wait failed: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                return Err(ClassifiedError::Timeout(deadline));
            }
        };

        let mut stdout_buf = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_end(&mut stdout_buf).await;
        }
        let mut stderr_buf = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_end(&mut stderr_buf).await;
        }
        let stderr_text = String::from_utf8_lossy(&stderr_buf);

        if !status.success() {
            return Err(classify_stderr(&stderr_text));
        }

        Ok(String::from_utf8_lossy(&stdout_buf).into_owned())
    }
}

/// Maps known stderr patterns onto the §4.B error taxonomy; anything
/// unrecognized is `Unknown`, per §4.C ("treats non-zero termination as
/// Unknown unless stderr matches a classifier pattern").
fn classify_stderr(stderr: &str) -> ClassifiedError {
    let lower = stderr.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        ClassifiedError::RateLimit { retry_after: None }
    } else if lower.contains("unauthorized") || lower.contains("401") || lower.contains("api key") {
        ClassifiedError::Auth(stderr.to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ClassifiedError::Timeout(Duration::from_secs(0))
    } else if lower.contains("connection") || lower.contains("dns") || lower.contains("network") {
        ClassifiedError::Network(stderr.to_string())
    } else if lower.contains("500") || lower.contains("502") || lower.contains("503") {
        ClassifiedError::TransientServer5xx {
            status: 503,
            message: stderr.to_string(),
        }
    } else if lower.contains("400") || lower.contains("404") {
        ClassifiedError::PermanentClient4xx {
            status: 400,
            message: stderr.to_string(),
        }
    } else {
        ClassifiedError::Unknown(stderr.to_string())
    }
}
