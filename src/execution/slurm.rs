//! Slurm Backend
//!
//! Submits `sbatch` invocations (as built by
//! [`SlurmAdapter`](super::adapter::SlurmAdapter)) and follows the cluster
//! job through `sacct` until it ends. A job counts as finished only once
//! the scheduler reports a terminal state; `sbatch` returning is just the
//! acknowledgement that the job was queued.
//!
//! # State Mapping
//!
//! | Slurm state                              | Status    |
//! |------------------------------------------|-----------|
//! | PENDING, REQUEUED, CONFIGURING, unknown  | Queued    |
//! | RUNNING, COMPLETING                      | Running   |
//! | SUSPENDED, STOPPED                       | Stopped   |
//! | COMPLETED, FAILED, TIMEOUT, ...          | Finished  |

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use log::debug;

use super::backend::{BackendHandle, ClusterBackend, Invocation};
use crate::error::BackendError;
use crate::jobs::BackendStatus;

/// Backend talking to a Slurm scheduler through its command line tools.
#[derive(Debug)]
pub struct SlurmBackend {
    sacct: String,
    scancel: String,
    /// Standard error log of every submitted job
    jobs: HashMap<BackendHandle, PathBuf>,
}

impl Default for SlurmBackend {
    fn default() -> Self {
        Self {
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            jobs: HashMap::new(),
        }
    }
}

impl SlurmBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs used to query and cancel jobs.
    pub fn with_tools(mut self, sacct: impl Into<String>, scancel: impl Into<String>) -> Self {
        self.sacct = sacct.into();
        self.scancel = scancel.into();
        self
    }

    fn stderr_log(&self, handle: &BackendHandle) -> Result<&PathBuf, BackendError> {
        self.jobs
            .get(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.0.clone()))
    }
}

fn run_tool(program: &str, args: &[&str]) -> Result<Output, BackendError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| BackendError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(BackendError::Query {
            program: program.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Job id from `sbatch --parsable` output (`<id>` or `<id>;<cluster>`).
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(id.to_string())
    } else {
        None
    }
}

/// Exit code from sacct's `<code>:<signal>` field, with signals reported
/// the way shells do (128 + signal).
fn parse_exit_code(field: &str) -> Option<i32> {
    let (code, signal) = field.split_once(':')?;
    let code: i32 = code.trim().parse().ok()?;
    let signal: i32 = signal.trim().parse().ok()?;
    Some(if signal > 0 { 128 + signal } else { code })
}

/// Maps one `sacct -P -o State,ExitCode` line onto a backend status.
///
/// The job's standard error log is only consulted for terminal states.
/// Scheduler-side kills leave no marker in the log, so one is appended
/// for timeouts and memory kills.
pub fn parse_sacct_line(line: &str, stderr_log: impl FnOnce() -> String) -> BackendStatus {
    let mut fields = line.trim().split('|');
    // "CANCELLED by 1234" carries the cancelling uid
    let state = fields
        .next()
        .and_then(|s| s.split_whitespace().next())
        .unwrap_or("");
    let exit_code = fields.next().and_then(parse_exit_code);

    match state {
        "RUNNING" | "COMPLETING" => BackendStatus::Running,
        "SUSPENDED" | "STOPPED" => BackendStatus::Stopped,
        "COMPLETED" => BackendStatus::Finished {
            exit_code: exit_code.unwrap_or(0),
            stderr: stderr_log(),
        },
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "CANCELLED" | "NODE_FAIL" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" => {
            let mut stderr = stderr_log();
            match state {
                "TIMEOUT" => stderr.push_str("\nTIMEOUT: wall time limit reached\n"),
                "OUT_OF_MEMORY" => stderr.push_str("\nKilled: out of memory\n"),
                _ => {}
            }
            BackendStatus::Finished {
                exit_code: exit_code.filter(|c| *c != 0).unwrap_or(1),
                stderr,
            }
        }
        // Not yet accounted, pending or requeued
        _ => BackendStatus::Queued,
    }
}

impl ClusterBackend for SlurmBackend {
    fn submit(&mut self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        let program = invocation.program();
        if program.is_empty() {
            return Err(BackendError::Rejected {
                job: invocation.job_name.clone(),
                reason: "empty command".to_string(),
            });
        }

        // The scheduler does not create log directories
        for path in [&invocation.stdout, &invocation.stderr] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                    debug!("Created directory: {}", parent.display());
                }
            }
        }

        let output = Command::new(program)
            .args(invocation.args())
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| BackendError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(BackendError::Rejected {
                job: invocation.job_name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_job_id(&stdout).ok_or_else(|| BackendError::Rejected {
            job: invocation.job_name.clone(),
            reason: format!("no job id in '{}' output: {}", program, stdout.trim()),
        })?;

        debug!("Queued '{}' as Slurm job {}", invocation.job_name, id);
        let handle = BackendHandle(id);
        self.jobs.insert(handle.clone(), invocation.stderr.clone());
        Ok(handle)
    }

    fn poll(&mut self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let stderr_path = self.stderr_log(handle)?.clone();
        let output = run_tool(
            &self.sacct,
            &["-j", handle.0.as_str(), "-X", "-n", "-P", "-o", "State,ExitCode"],
        )?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
            // Freshly submitted jobs may not be in the accounting yet
            return Ok(BackendStatus::Queued);
        };
        Ok(parse_sacct_line(line, || {
            fs::read_to_string(&stderr_path).unwrap_or_default()
        }))
    }

    fn cancel(&mut self, handle: &BackendHandle) -> Result<(), BackendError> {
        self.stderr_log(handle)?;
        run_tool(&self.scancel, &[handle.0.as_str()])?;
        debug!("Requested cancellation of Slurm job {}", handle);
        Ok(())
    }
}
