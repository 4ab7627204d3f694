//! Sandbox executor: untrusted script execution in isolated workers.
//!
//! User code stays a dynamic scripting language; the engine spawns `python3`
//! interpreter subprocesses and speaks a language-agnostic protocol (source
//! text + serialized context in, serialized result or structured failure
//! out). Workers come from a bounded pool, queue jobs with FIFO fairness,
//! and are recycled after a configurable number of invocations to bound
//! memory growth.
//!
//! Script failures never abort a tick: the orchestrator records them and
//! substitutes the baseline fallback for that binding.

pub mod context;
mod worker;

pub use worker::SandboxLimits;

use crate::config::SimulationConfig;
use crate::models::AgentKind;
use crossbeam::channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use worker::{PythonWorker, WorkerOutcome};

/// Sub-kind of a script failure, exposed in tick logs and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFailureKind {
    Timeout,
    MemoryLimit,
    InvalidReturn,
    RuntimeException,
    ImportDenied,
}

impl fmt::Display for ScriptFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScriptFailureKind::Timeout => "timeout",
            ScriptFailureKind::MemoryLimit => "memory_limit",
            ScriptFailureKind::InvalidReturn => "invalid_return",
            ScriptFailureKind::RuntimeException => "runtime_exception",
            ScriptFailureKind::ImportDenied => "import_denied",
        };
        f.write_str(label)
    }
}

/// Structured failure returned in place of a script result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub kind: ScriptFailureKind,
    pub message: String,
    /// Truncated stack context from the worker, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Identifies which agent a request (and its result) belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingRef {
    pub agent_kind: AgentKind,
    pub entity_id: Option<String>,
}

impl fmt::Display for BindingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(entity) => write!(f, "{}:{}", self.agent_kind, entity),
            None => write!(f, "{}", self.agent_kind),
        }
    }
}

/// One sandbox invocation: source text, cache key, trimmed context.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub binding: BindingRef,
    pub code: String,
    pub code_version: Uuid,
    pub context: serde_json::Value,
}

pub type InvocationResult = Result<serde_json::Value, ScriptFailure>;

/// Language-agnostic execution seam.
///
/// The orchestrator only depends on this trait; tests substitute scripted
/// engines, and a future non-Python runtime plugs in here.
pub trait ScriptEngine: Send + Sync {
    fn execute_batch(&self, requests: Vec<InvocationRequest>) -> Vec<(BindingRef, InvocationResult)>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    code: &'a str,
    code_version: String,
    context: &'a serde_json::Value,
}

struct Job {
    request: InvocationRequest,
    reply: Sender<(BindingRef, InvocationResult)>,
}

/// Process-pool implementation of [`ScriptEngine`].
pub struct SandboxExecutor {
    jobs: Sender<Job>,
    concurrency: usize,
    handles: Vec<JoinHandle<()>>,
}

impl SandboxExecutor {
    pub fn new(pool_size: usize, concurrency: usize, limits: SandboxLimits) -> Self {
        assert!(pool_size > 0, "worker pool must have at least one worker");
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(pool_size);
        for worker_index in 0..pool_size {
            let rx = rx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("sandbox-worker-{}", worker_index))
                    .spawn(move || worker_loop(rx, limits))
                    .expect("spawn sandbox worker thread"),
            );
        }
        Self {
            jobs: tx,
            concurrency: concurrency.max(1),
            handles,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(
            config.worker_pool_size,
            config.script_execution_concurrency,
            SandboxLimits {
                wall_clock: Duration::from_secs_f64(config.script_timeout_seconds),
                cpu_seconds: config.script_cpu_seconds,
                memory_mb: config.script_memory_limit_mb,
                max_invocations: config.worker_max_invocations,
            },
        )
    }
}

impl ScriptEngine for SandboxExecutor {
    fn execute_batch(&self, requests: Vec<InvocationRequest>) -> Vec<(BindingRef, InvocationResult)> {
        let mut results = Vec::with_capacity(requests.len());
        // Dispatch in chunks of the concurrency ceiling; within a chunk the
        // pool runs invocations in parallel.
        for chunk in requests.chunks(self.concurrency) {
            let (reply_tx, reply_rx) = unbounded();
            let mut expected = 0;
            for request in chunk {
                let job = Job {
                    request: request.clone(),
                    reply: reply_tx.clone(),
                };
                if self.jobs.send(job).is_ok() {
                    expected += 1;
                } else {
                    results.push((
                        request.binding.clone(),
                        Err(ScriptFailure {
                            kind: ScriptFailureKind::RuntimeException,
                            message: "sandbox pool is shut down".to_string(),
                            stack: None,
                        }),
                    ));
                }
            }
            drop(reply_tx);
            for _ in 0..expected {
                match reply_rx.recv() {
                    Ok(result) => results.push(result),
                    Err(_) => break,
                }
            }
        }
        results
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        // Closing the job channel drains the pool; worker threads exit once
        // the queue disconnects.
        let (empty_tx, _) = unbounded::<Job>();
        let _ = std::mem::replace(&mut self.jobs, empty_tx);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: crossbeam::channel::Receiver<Job>, limits: SandboxLimits) {
    let mut worker: Option<PythonWorker> = None;

    for job in rx.iter() {
        // Recycle the interpreter after the configured invocation budget.
        if worker
            .as_ref()
            .map(|w| w.invocations >= limits.max_invocations)
            .unwrap_or(false)
        {
            debug!("recycling sandbox worker after invocation budget");
            worker = None;
        }
        if worker.is_none() {
            match PythonWorker::spawn(&limits) {
                Ok(spawned) => worker = Some(spawned),
                Err(err) => {
                    let _ = job.reply.send((
                        job.request.binding.clone(),
                        Err(ScriptFailure {
                            kind: ScriptFailureKind::RuntimeException,
                            message: format!("failed to start script interpreter: {}", err),
                            stack: None,
                        }),
                    ));
                    continue;
                }
            }
        }

        let request_json = serde_json::to_string(&WireRequest {
            code: &job.request.code,
            code_version: job.request.code_version.to_string(),
            context: &job.request.context,
        })
        .expect("request serializes");

        let outcome = worker
            .as_mut()
            .expect("worker present")
            .invoke(&request_json, limits.wall_clock);

        let result = match outcome {
            WorkerOutcome::Reply(result) => result,
            WorkerOutcome::TimedOut => {
                worker = None;
                Err(ScriptFailure {
                    kind: ScriptFailureKind::Timeout,
                    message: format!(
                        "wall-clock limit of {:.2}s exceeded",
                        limits.wall_clock.as_secs_f64()
                    ),
                    stack: None,
                })
            }
            WorkerOutcome::Died(failure) => {
                worker = None;
                Err(failure)
            }
        };
        let _ = job.reply.send((job.request.binding.clone(), result));
    }
}
