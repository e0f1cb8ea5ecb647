//! Demo CLI for the multi-expert consensus engine.
//!
//! Runs one `debate()` call against the built-in expert registry, printing
//! progress events to stderr and the synthesized answer to stdout. Wires the
//! deterministic in-process test doubles by default so the binary runs with
//! no API keys or subprocesses configured; pass `--subprocess <expert=cmd>`
//! pairs to route an expert id through a real CLI instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use debate_consensus::progress::{ProgressEvent, ProgressSink};
use debate_consensus::testing::{DeterministicEvaluator, DeterministicWorker};
use debate_consensus::worker::{ExpertWorker, SubprocessWorker};
use debate_consensus::{default_registry, Coordinator, DebateOptions, EngineConfig};

struct StderrProgressSink;

impl ProgressSink for StderrProgressSink {
    fn emit(&self, event: ProgressEvent) {
        eprintln!(
            "[{:>5.1}%] {:?} {}{}",
            event.percentage,
            event.phase,
            event.message.as_deref().unwrap_or(""),
            event
                .expert_id
                .map(|id| format!(" ({id}: {:?})", event.status))
                .unwrap_or_default(),
        );
    }
}

/// `$XDG_CACHE_HOME/debate-consensus/logs` (or the platform equivalent),
/// matching how the teacher locates its own on-disk state.
fn default_log_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("debate-consensus").join("logs"))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1).peekable();
    let mut subprocess_commands: HashMap<String, Vec<String>> = HashMap::new();
    let mut expert_spec: Option<String> = None;
    let mut workdir = "current".to_string();
    let mut log_dir: Option<PathBuf> = default_log_dir();
    let mut question_parts: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--subprocess" => {
                let pair = args.next().expect("--subprocess requires expert=cmd");
                let (id, cmd) = pair
                    .split_once('=')
                    .expect("--subprocess expects expert=cmd");
                subprocess_commands.insert(id.to_string(), cmd.split_whitespace().map(String::from).collect());
            }
            "--experts" => {
                expert_spec = Some(args.next().expect("--experts requires a spec, e.g. claude:2,gpt"));
            }
            "--workdir" => {
                workdir = args.next().expect("--workdir requires a path");
            }
            "--log-dir" => {
                log_dir = Some(PathBuf::from(args.next().expect("--log-dir requires a path")));
            }
            "--no-log" => {
                log_dir = None;
            }
            other => question_parts.push(other.to_string()),
        }
    }

    let question = if question_parts.is_empty() {
        "What is the best approach to handle distributed consensus failures?".to_string()
    } else {
        question_parts.join(" ")
    };

    let worker: Arc<dyn ExpertWorker> = if subprocess_commands.is_empty() {
        Arc::new(DeterministicWorker::new())
    } else {
        Arc::new(SubprocessWorker::new(subprocess_commands))
    };

    let coordinator = Coordinator::new(
        Arc::new(default_registry()),
        worker,
        Arc::new(DeterministicEvaluator),
        None,
        None,
        Arc::new(debate_consensus::learning::NoopLearningSink),
        EngineConfig::default(),
        log_dir,
    );

    let result = coordinator
        .debate(
            &question,
            &workdir,
            expert_spec.as_deref(),
            DebateOptions::default(),
            &StderrProgressSink,
        )
        .await?;

    println!("{}", result.final_text);
    eprintln!(
        "\nconfidence: {:.1} ({:?}), experts: {:?}, from_cache: {}",
        result.confidence.score, result.confidence.level, result.experts_used, result.from_cache
    );

    Ok(())
}
