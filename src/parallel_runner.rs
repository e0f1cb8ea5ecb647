//! ParallelInstanceRunner — fans an expert's replica instances out
//! concurrently and folds them into one [`Proposal`] (§4.F).
//!
//! Grounded on the teacher's concurrent-evaluation fan-out (`JoinSet`-style
//! task spawning over a bounded worker set) but adapted from scoring many
//! candidate decisions to running many replicas of the *same* expert and
//! reconciling their output through a synthesis call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::instance::build_instance_specs;
use crate::prompts;
use crate::retry::RetryController;
use crate::types::{ExpertDescriptor, ExpertInstanceSpec, FocusLabel, Proposal, ProposalOrigin};
use crate::worker::ExpertWorker;

const SYNTHESIS_SEED: u64 = 12345;
const SYNTHESIS_TEMPERATURE: f64 = 0.5;

fn now_monotonic_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Runs every [`ExpertInstanceSpec`] for one expert concurrently and
/// produces a single [`Proposal`] (§4.F):
/// - 0 successes -> failed proposal (`text: None`), `origin: AllFailed`
/// - 1 success -> that text, `origin: Single`
/// - >=2 successes -> one more invocation synthesizing the replicas;
///   `origin: Synthesized` on success, `origin: FallbackLongest` if the
///   synthesis call itself fails.
///
/// Every actual expert invocation (each replica, and the synthesis call)
/// acquires a permit from the process-wide `semaphore` first, bounding
/// `EngineConfig::concurrency.max_concurrent_invocations` in-flight calls
/// across the whole process (§5 "backpressure via a process-wide semaphore").
pub struct ParallelInstanceRunner {
    worker: Arc<dyn ExpertWorker>,
    retry: Arc<RetryController>,
    semaphore: Arc<Semaphore>,
}

impl ParallelInstanceRunner {
    pub fn new(worker: Arc<dyn ExpertWorker>, retry: Arc<RetryController>, semaphore: Arc<Semaphore>) -> Self {
        Self { worker, retry, semaphore }
    }

    pub async fn run(
        &self,
        expert: &ExpertDescriptor,
        replica_count: u32,
        question: &str,
        workdir: &str,
        policy: &RetryPolicy,
        cancel: CancellationToken,
        ultrathink: bool,
    ) -> Proposal {
        let run_start = Instant::now();
        let specs = build_instance_specs(&expert.id, replica_count);
        let actual_replica_count = specs.len() as u32;

        let mut join_set: JoinSet<Option<String>> = JoinSet::new();
        for spec in specs {
            let worker = self.worker.clone();
            let retry = self.retry.clone();
            let expert_clone = expert.clone();
            let question = question.to_string();
            let workdir = workdir.to_string();
            let policy = policy.clone();
            let cancel = cancel.clone();
            let semaphore = self.semaphore.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                invoke_one(
                    worker.as_ref(),
                    &retry,
                    &expert_clone,
                    &question,
                    &workdir,
                    Some(&spec),
                    &policy,
                    cancel,
                    ultrathink,
                )
                .await
            });
        }

        let mut successes: Vec<String> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(text)) = joined {
                successes.push(text);
            }
        }

        let duration_ms = now_monotonic_ms(run_start);

        match successes.len() {
            0 => Proposal {
                expert_id: expert.id.clone(),
                text: None,
                produced_at_monotonic_ms: duration_ms,
                duration_ms,
                replica_count: actual_replica_count,
                origin: ProposalOrigin::AllFailed,
            },
            1 => Proposal {
                expert_id: expert.id.clone(),
                text: Some(successes.remove(0)),
                produced_at_monotonic_ms: duration_ms,
                duration_ms,
                replica_count: actual_replica_count,
                origin: ProposalOrigin::Single,
            },
            _ => {
                let synthesis_spec = ExpertInstanceSpec {
                    expert_id: expert.id.clone(),
                    instance_index: 0,
                    replica_count: actual_replica_count,
                    seed: SYNTHESIS_SEED,
                    temperature: SYNTHESIS_TEMPERATURE,
                    focus_label: FocusLabel::Synthesizer,
                    instructions_text: None,
                };
                let prompt = prompts::synthesis_prompt(expert, question, &successes);

                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("semaphore is never closed");
                let synthesized = self
                    .retry
                    .execute(policy, {
                        let worker = self.worker.clone();
                        let expert_id = expert.id.clone();
                        let workdir = workdir.to_string();
                        let prompt = prompt.clone();
                        let synthesis_spec = synthesis_spec.clone();
                        let cancel = cancel.clone();
                        move || {
                            let worker = worker.clone();
                            let expert_id = expert_id.clone();
                            let workdir = workdir.clone();
                            let prompt = prompt.clone();
                            let synthesis_spec = synthesis_spec.clone();
                            let cancel = cancel.clone();
                            async move {
                                worker
                                    .invoke(
                                        &expert_id,
                                        &prompt,
                                        &workdir,
                                        Some(&synthesis_spec),
                                        policy_deadline(),
                                        cancel,
                                    )
                                    .await
                            }
                        }
                    })
                    .await;

                match synthesized {
                    Ok(text) => Proposal {
                        expert_id: expert.id.clone(),
                        text: Some(text),
                        produced_at_monotonic_ms: now_monotonic_ms(run_start),
                        duration_ms: now_monotonic_ms(run_start),
                        replica_count: actual_replica_count,
                        origin: ProposalOrigin::Synthesized,
                    },
                    Err(_) => {
                        let longest = successes
                            .into_iter()
                            .max_by_key(|t| t.chars().count())
                            .unwrap_or_default();
                        Proposal {
                            expert_id: expert.id.clone(),
                            text: Some(longest),
                            produced_at_monotonic_ms: now_monotonic_ms(run_start),
                            duration_ms: now_monotonic_ms(run_start),
                            replica_count: actual_replica_count,
                            origin: ProposalOrigin::FallbackLongest,
                        }
                    }
                }
            }
        }
    }
}

fn policy_deadline() -> Duration {
    Duration::from_secs(120)
}

async fn invoke_one(
    worker: &dyn ExpertWorker,
    retry: &RetryController,
    expert: &ExpertDescriptor,
    question: &str,
    workdir: &str,
    spec: Option<&ExpertInstanceSpec>,
    policy: &RetryPolicy,
    cancel: CancellationToken,
    ultrathink: bool,
) -> Option<String> {
    let prompt = prompts::propose_prompt(expert, question, workdir, spec, ultrathink);
    let result = retry
        .execute(policy, {
            let expert_id = expert.id.clone();
            let workdir = workdir.to_string();
            let prompt = prompt.clone();
            let spec = spec.cloned();
            let cancel = cancel.clone();
            move || {
                let expert_id = expert_id.clone();
                let workdir = workdir.clone();
                let prompt = prompt.clone();
                let spec = spec.clone();
                let cancel = cancel.clone();
                async move {
                    worker
                        .invoke(
                            &expert_id,
                            &prompt,
                            &workdir,
                            spec.as_ref(),
                            policy_deadline(),
                            cancel,
                        )
                        .await
                }
            }
        })
        .await;

    result.ok()
}
