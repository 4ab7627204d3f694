//! One sandboxed interpreter child process.
//!
//! Each executor worker thread owns at most one `PythonWorker`. The child
//! runs `python/worker.py` in a loop over line-delimited JSON. OS resource
//! limits (CPU seconds, address space) are installed between fork and exec;
//! the wall-clock budget is enforced here by waiting on the reader channel
//! with a timeout and killing the child when it expires.

use super::{ScriptFailure, ScriptFailureKind};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Harness source shipped inside the binary.
const WORKER_SOURCE: &str = include_str!("../../python/worker.py");

/// Result of a single invocation attempt against a worker process.
pub(crate) enum WorkerOutcome {
    /// The worker answered; payload is the script's result or failure.
    Reply(Result<serde_json::Value, ScriptFailure>),
    /// Wall-clock budget expired; the child has been killed.
    TimedOut,
    /// The child died mid-invocation (CPU limit, OOM kill, crash).
    Died(ScriptFailure),
}

#[derive(Deserialize)]
struct WireError {
    kind: String,
    message: String,
    #[serde(default)]
    stack: String,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    ok: Option<serde_json::Value>,
    #[serde(default)]
    err: Option<WireError>,
}

fn failure_kind(kind: &str) -> ScriptFailureKind {
    match kind {
        "timeout" => ScriptFailureKind::Timeout,
        "memory_limit" => ScriptFailureKind::MemoryLimit,
        "invalid_return" => ScriptFailureKind::InvalidReturn,
        "import_denied" => ScriptFailureKind::ImportDenied,
        _ => ScriptFailureKind::RuntimeException,
    }
}

/// Per-invocation resource caps, copied out of the simulation config.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub wall_clock: Duration,
    pub cpu_seconds: u64,
    pub memory_mb: u64,
    pub max_invocations: u32,
}

pub(crate) struct PythonWorker {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    pub invocations: u32,
}

impl PythonWorker {
    pub fn spawn(limits: &SandboxLimits) -> std::io::Result<Self> {
        let mut command = Command::new("python3");
        command
            .arg("-c")
            .arg(WORKER_SOURCE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let cpu = limits.cpu_seconds;
            let memory_bytes = limits.memory_mb * 1024 * 1024;
            unsafe {
                command.pre_exec(move || {
                    let cpu_limit = libc::rlimit {
                        rlim_cur: cpu,
                        rlim_max: cpu + 1,
                    };
                    libc::setrlimit(libc::RLIMIT_CPU, &cpu_limit);
                    let mem_limit = libc::rlimit {
                        rlim_cur: memory_bytes,
                        rlim_max: memory_bytes,
                    };
                    libc::setrlimit(libc::RLIMIT_AS, &mem_limit);
                    Ok(())
                });
            }
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        // Dedicated reader thread; recv_timeout on the channel gives us a
        // wall-clock wait the blocking read API cannot.
        let (tx, rx) = unbounded();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        debug!(pid = child.id(), "sandbox worker spawned");
        Ok(Self {
            child,
            stdin,
            lines: rx,
            invocations: 0,
        })
    }

    /// Send one request and wait for the reply within the wall-clock budget.
    pub fn invoke(&mut self, request_json: &str, wall_clock: Duration) -> WorkerOutcome {
        self.invocations += 1;

        if writeln!(self.stdin, "{}", request_json).is_err() || self.stdin.flush().is_err() {
            return WorkerOutcome::Died(self.death_failure());
        }

        match self.lines.recv_timeout(wall_clock) {
            Ok(line) => match serde_json::from_str::<WireResponse>(&line) {
                Ok(WireResponse { ok: Some(value), .. }) => WorkerOutcome::Reply(Ok(value)),
                Ok(WireResponse { err: Some(err), .. }) => {
                    WorkerOutcome::Reply(Err(ScriptFailure {
                        kind: failure_kind(&err.kind),
                        message: err.message,
                        stack: if err.stack.is_empty() {
                            None
                        } else {
                            Some(err.stack)
                        },
                    }))
                }
                _ => WorkerOutcome::Reply(Err(ScriptFailure {
                    kind: ScriptFailureKind::RuntimeException,
                    message: "malformed worker response".to_string(),
                    stack: None,
                })),
            },
            Err(RecvTimeoutError::Timeout) => {
                let _ = self.child.kill();
                let _ = self.child.wait();
                WorkerOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => WorkerOutcome::Died(self.death_failure()),
        }
    }

    /// Classify an unexpected child death. A CPU-limit kill (SIGXCPU)
    /// reports as a timeout per the executor contract.
    fn death_failure(&mut self) -> ScriptFailure {
        let _ = self.child.kill();
        let status = self.child.wait().ok();

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(status) = status {
                if status.signal() == Some(libc::SIGXCPU) {
                    return ScriptFailure {
                        kind: ScriptFailureKind::Timeout,
                        message: "cpu time limit exceeded".to_string(),
                        stack: None,
                    };
                }
                if status.signal() == Some(libc::SIGKILL) {
                    return ScriptFailure {
                        kind: ScriptFailureKind::MemoryLimit,
                        message: "worker killed (resource limit)".to_string(),
                        stack: None,
                    };
                }
            }
        }
        #[cfg(not(unix))]
        let _ = status;

        ScriptFailure {
            kind: ScriptFailureKind::RuntimeException,
            message: "sandbox worker terminated unexpectedly".to_string(),
            stack: None,
        }
    }
}

impl Drop for PythonWorker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
