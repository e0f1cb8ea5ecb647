// Clippy allows for cleaner code
#![allow(clippy::too_many_arguments)]
#![allow(clippy::field_reassign_with_default)]

//! A multi-expert consensus engine: given a question, fans it out to several
//! independently-implemented AI experts, runs a three-round propose/evaluate/
//! improve/synthesize debate over their answers, optionally cross-verifies
//! the winner, and scores the result's confidence.
//!
//! # Architecture
//!
//! ```text
//! question ──► Coordinator ──► ResultCache.lookup ──hit──► return cached
//!                                      miss
//!                                      ├──► Selector           (→ experts[])
//!                                      ├──► DebateRunner(experts)
//!                                      │      ├── ParallelInstanceRunner per expert
//!                                      │      ├── Evaluator.rank
//!                                      │      ├── (opt.) CrossVerifier.verify
//!                                      │      ├── review + improve
//!                                      │      └── synthesize
//!                                      ├──► ConfidenceScorer.score
//!                                      ├──► ResultCache.store
//!                                      └──► progress events + append-only log
//! ```
//!
//! The core never talks to a model provider directly: [`worker::ExpertWorker`],
//! [`evaluator::Evaluator`] and [`evaluator::Analyzer`] are collaborator
//! interfaces an embedder implements (subprocess, HTTP client, or — for
//! tests — the deterministic doubles in [`testing`]).

pub mod cache;
pub mod config;
pub mod confidence;
pub mod coordinator;
pub mod debate;
pub mod dispersion;
pub mod error;
pub mod evaluator;
pub mod instance;
pub mod invalidator;
pub mod learning;
pub mod log;
pub mod parallel_runner;
pub mod progress;
pub mod project_state;
pub mod prompts;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod types;
pub mod verify;
pub mod worker;

pub mod testing;

pub use config::{CacheConfig, ConcurrencyConfig, EngineConfig, RetryPolicy};
pub use coordinator::{Coordinator, DebateOptions};
pub use error::{ClassifiedError, CoreError, RetryAttempt, RetryExhausted};
pub use registry::{default_registry, ExpertRegistry};
pub use types::*;
