//! Local Process Backend
//!
//! Runs invocations as child processes on this machine, with standard
//! output and error redirected to the job's log files. At most
//! `max_running` processes run at once; further submissions wait as
//! queued and are started by later polls.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use log::{debug, warn};

use super::backend::{BackendHandle, ClusterBackend, Invocation};
use crate::error::BackendError;
use crate::jobs::BackendStatus;

enum Slot {
    Queued(Invocation),
    Running { child: Child, stderr: PathBuf },
    Exited { exit_code: i32, stderr: String },
}

pub struct LocalBackend {
    max_running: usize,
    working_dir: Option<PathBuf>,
    slots: HashMap<BackendHandle, Slot>,
    queue: VecDeque<BackendHandle>,
    next_id: u64,
}

impl LocalBackend {
    pub fn new(max_running: usize) -> Self {
        Self {
            max_running: max_running.max(1),
            working_dir: None,
            slots: HashMap::new(),
            queue: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Directory child processes are started in.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn running(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Running { .. }))
            .count()
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child, BackendError> {
        let program = invocation.command.first().ok_or_else(|| BackendError::Rejected {
            job: invocation.job_name.clone(),
            reason: "empty command".to_string(),
        })?;

        for path in [&invocation.stdout, &invocation.stderr] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                    debug!("Created directory: {}", parent.display());
                }
            }
        }

        let mut cmd = Command::new(program);
        cmd.args(&invocation.command[1..])
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(File::create(&invocation.stdout)?)
            .stderr(File::create(&invocation.stderr)?);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| BackendError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!("Started '{}' (pid {})", invocation.job_name, child.id());
        Ok(child)
    }

    /// Starts queued invocations while there is capacity.
    fn start_queued(&mut self) {
        while self.running() < self.max_running {
            let Some(handle) = self.queue.pop_front() else {
                break;
            };
            let Some(Slot::Queued(invocation)) = self.slots.remove(&handle) else {
                continue;
            };
            let slot = match self.spawn(&invocation) {
                Ok(child) => Slot::Running {
                    child,
                    stderr: invocation.stderr.clone(),
                },
                Err(e) => {
                    warn!("Could not start '{}': {}", invocation.job_name, e);
                    Slot::Exited {
                        exit_code: 127,
                        stderr: format!("FAILED: {}", e),
                    }
                }
            };
            self.slots.insert(handle, slot);
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

/// Exit code, with signals reported the way shells do (128 + signal).
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl ClusterBackend for LocalBackend {
    fn submit(&mut self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        let handle = BackendHandle(format!("local-{}", self.next_id));
        self.next_id += 1;

        if self.running() < self.max_running && self.queue.is_empty() {
            let child = self.spawn(invocation)?;
            self.slots.insert(
                handle.clone(),
                Slot::Running {
                    child,
                    stderr: invocation.stderr.clone(),
                },
            );
        } else {
            debug!("Queued '{}'", invocation.job_name);
            self.slots
                .insert(handle.clone(), Slot::Queued(invocation.clone()));
            self.queue.push_back(handle.clone());
        }
        Ok(handle)
    }

    fn poll(&mut self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.0.clone()))?;

        let status = match slot {
            Slot::Queued(_) => BackendStatus::Queued,
            Slot::Exited { exit_code, stderr } => BackendStatus::Finished {
                exit_code: *exit_code,
                stderr: stderr.clone(),
            },
            Slot::Running { child, stderr } => match child.try_wait()? {
                None => BackendStatus::Running,
                Some(status) => {
                    let code = exit_code(status);
                    let diagnostic = fs::read_to_string(&*stderr).unwrap_or_default();
                    *slot = Slot::Exited {
                        exit_code: code,
                        stderr: diagnostic.clone(),
                    };
                    BackendStatus::Finished {
                        exit_code: code,
                        stderr: diagnostic,
                    }
                }
            },
        };

        // A finished process frees a slot for the queue
        if matches!(status, BackendStatus::Finished { .. }) {
            self.start_queued();
        }
        Ok(status)
    }

    fn cancel(&mut self, handle: &BackendHandle) -> Result<(), BackendError> {
        let slot = self
            .slots
            .get_mut(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.0.clone()))?;

        match slot {
            Slot::Queued(_) => {
                self.queue.retain(|h| h != handle);
                *slot = Slot::Exited {
                    exit_code: 143,
                    stderr: "Cancelled before start".to_string(),
                };
            }
            Slot::Running { child, .. } => {
                if let Err(e) = child.kill() {
                    warn!("Could not kill {}: {}", handle, e);
                }
            }
            Slot::Exited { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::execution::backend::Resources;

    fn invocation(dir: &std::path::Path, name: &str, script: &str) -> Invocation {
        Invocation {
            job_name: name.to_string(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            env: BTreeMap::from([("TMFLOW_ACCOUNT".to_string(), "alice".to_string())]),
            resources: Resources::default(),
            account: "alice".into(),
            stdout: dir.join("log").join(format!("{}.out", name)),
            stderr: dir.join("log").join(format!("{}.err", name)),
        }
    }

    fn wait(backend: &mut LocalBackend, handle: &BackendHandle) -> BackendStatus {
        for _ in 0..500 {
            let status = backend.poll(handle).unwrap();
            if matches!(status, BackendStatus::Finished { .. }) {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("job did not finish");
    }

    #[test]
    fn test_successful_process_writes_logs() {
        let temp_dir = tempdir().unwrap();
        let mut backend = LocalBackend::new(2);
        let inv = invocation(temp_dir.path(), "ok", "echo \"hello $TMFLOW_ACCOUNT\"");

        let handle = backend.submit(&inv).unwrap();
        let status = wait(&mut backend, &handle);

        assert_eq!(status, BackendStatus::Finished { exit_code: 0, stderr: String::new() });
        let stdout = fs::read_to_string(&inv.stdout).unwrap();
        assert_eq!(stdout.trim(), "hello alice");
    }

    #[test]
    fn test_failed_process_reports_stderr() {
        let temp_dir = tempdir().unwrap();
        let mut backend = LocalBackend::new(2);
        let inv = invocation(temp_dir.path(), "bad", "echo TIMEOUT >&2; exit 3");

        let handle = backend.submit(&inv).unwrap();
        match wait(&mut backend, &handle) {
            BackendStatus::Finished { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr.trim(), "TIMEOUT");
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_excess_submissions_are_queued() {
        let temp_dir = tempdir().unwrap();
        let mut backend = LocalBackend::new(1);
        let first = backend
            .submit(&invocation(temp_dir.path(), "first", "sleep 0.2"))
            .unwrap();
        let second = backend
            .submit(&invocation(temp_dir.path(), "second", "true"))
            .unwrap();

        assert_eq!(backend.poll(&second).unwrap(), BackendStatus::Queued);
        wait(&mut backend, &first);
        assert_ne!(backend.poll(&second).unwrap(), BackendStatus::Queued);
        wait(&mut backend, &second);
    }

    #[test]
    fn test_cancel_running_process() {
        let temp_dir = tempdir().unwrap();
        let mut backend = LocalBackend::new(1);
        let handle = backend
            .submit(&invocation(temp_dir.path(), "long", "sleep 30"))
            .unwrap();

        backend.cancel(&handle).unwrap();
        match wait(&mut backend, &handle) {
            BackendStatus::Finished { exit_code, .. } => assert_ne!(exit_code, 0),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_cancel_queued_invocation() {
        let temp_dir = tempdir().unwrap();
        let mut backend = LocalBackend::new(1);
        let running = backend
            .submit(&invocation(temp_dir.path(), "running", "sleep 0.1"))
            .unwrap();
        let queued = backend
            .submit(&invocation(temp_dir.path(), "queued", "true"))
            .unwrap();

        backend.cancel(&queued).unwrap();
        assert!(matches!(
            backend.poll(&queued).unwrap(),
            BackendStatus::Finished { exit_code: 143, .. }
        ));
        wait(&mut backend, &running);
    }

    #[test]
    fn test_unknown_handle() {
        let mut backend = LocalBackend::default();
        assert!(backend.poll(&BackendHandle("nope".into())).is_err());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let temp_dir = tempdir().unwrap();
        let mut backend = LocalBackend::new(1);
        let mut inv = invocation(temp_dir.path(), "missing", "");
        inv.command = vec!["/nonexistent/tmflow-step".into()];

        assert!(matches!(backend.submit(&inv), Err(BackendError::Spawn { .. })));
    }
}
