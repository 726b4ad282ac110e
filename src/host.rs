// ============================================================================
// SECTION 7: HOST SIGNAL READER
// ============================================================================
// Everything that touches host processes goes through here:
// - time-bounded one-shot commands behind the HostExecutor trait
// - long-running follower subprocesses (tail -F, docker logs -f)
// - graceful-then-forceful termination that never blocks the caller
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use crate::error::{HostError, HostResult, ResourceError};

// ----------------------------------------------------------------------------
// 7.1 Command Specification
// ----------------------------------------------------------------------------

/// A host command with its time bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty())
    }
}

// ----------------------------------------------------------------------------
// 7.2 Host Executor
// ----------------------------------------------------------------------------

/// Runs one-shot host commands. A non-zero exit is an error.
#[async_trait]
pub trait HostExecutor: Send + Sync + Debug {
    async fn run(&self, spec: &CommandSpec) -> HostResult<CommandOutput>;
}

/// Executes commands on the local host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl HostExecutor for SystemExecutor {
    async fn run(&self, spec: &CommandSpec) -> HostResult<CommandOutput> {
        let child = spec.command().spawn().map_err(|e| HostError::Spawn {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| HostError::Timeout {
                program: spec.program.clone(),
                timeout_ms: spec.timeout.as_millis() as u64,
            })?
            .map_err(|e| HostError::Spawn {
                program: spec.program.clone(),
                message: e.to_string(),
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        };

        trace!(
            target: "hostd::host",
            command = %spec.display(),
            code = ?result.code,
            bytes = result.stdout.len(),
            "Command finished"
        );

        if output.status.success() {
            Ok(result)
        } else {
            Err(HostError::Failed {
                program: spec.program.clone(),
                code: result.code,
                stderr: result.stderr.trim().to_string(),
            })
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Follower Subprocesses
// ----------------------------------------------------------------------------

/// Signal handle for a spawned subprocess.
///
/// Cloned freely; whoever awaits the child marks it exited so a pending
/// SIGKILL is skipped.
#[derive(Clone)]
pub struct ManagedChild {
    program: String,
    pid: Option<i32>,
    exited: Arc<AtomicBool>,
}

impl ManagedChild {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, AtomicOrdering::Release);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(AtomicOrdering::Acquire)
    }

    /// Send SIGTERM now and SIGKILL after `grace` if the process is still
    /// around. Returns immediately.
    pub fn terminate(&self, grace: Duration) -> Result<(), ResourceError> {
        let Some(raw) = self.pid else {
            return Ok(());
        };
        if self.has_exited() {
            return Ok(());
        }

        let pid = Pid::from_raw(raw);
        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.mark_exited();
                return Ok(());
            }
            Err(e) => {
                return Err(ResourceError::Signal {
                    pid: raw,
                    message: e.to_string(),
                })
            }
        }

        let exited = self.exited.clone();
        let program = self.program.clone();
        let escalate = async move {
            tokio::time::sleep(grace).await;
            if !exited.load(AtomicOrdering::Acquire) {
                match signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) => debug!(target: "hostd::host", pid = raw, program = %program, "Escalated to SIGKILL"),
                    Err(Errno::ESRCH) => {}
                    Err(e) => warn!(target: "hostd::host", pid = raw, error = %e, "SIGKILL failed"),
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(escalate);
            }
            Err(_) => {
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
        }
        Ok(())
    }
}

impl Debug for ManagedChild {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChild")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// A spawned follower: the child (for its pipes and exit status) plus the
/// signal handle used by cleanup.
#[derive(Debug)]
pub struct Follower {
    pub child: Child,
    pub handle: ManagedChild,
}

/// Spawn a long-running subprocess with piped stdout/stderr. No timeout
/// applies; the caller owns its lifetime.
pub fn spawn_follower(spec: &CommandSpec) -> HostResult<Follower> {
    let child = spec.command().spawn().map_err(|e| HostError::Spawn {
        program: spec.program.clone(),
        message: e.to_string(),
    })?;

    let handle = ManagedChild {
        program: spec.program.clone(),
        pid: child.id().map(|id| id as i32),
        exited: Arc::new(AtomicBool::new(false)),
    };

    debug!(
        target: "hostd::host",
        command = %spec.display(),
        pid = ?handle.pid,
        "Follower spawned"
    );

    Ok(Follower { child, handle })
}

/// Local hostname, `"unknown"` when it cannot be determined.
pub fn hostname() -> String {
    sysinfo::System::host_name()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".into())
}

// ----------------------------------------------------------------------------
// 7.4 Scripted Executor (tests)
// ----------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new("docker", Duration::from_secs(5))
            .args(["events", "--since"])
            .arg("123");
        assert_eq!(spec.display(), "docker events --since 123");
    }

    #[tokio::test]
    async fn test_system_executor_success_and_failure() {
        let ok = SystemExecutor
            .run(&CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo hi"]))
            .await
            .unwrap();
        assert_eq!(ok.stdout.trim(), "hi");

        let err = SystemExecutor
            .run(&CommandSpec::new("sh", Duration::from_secs(5)).args(["-c", "echo no >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            HostError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "no");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_system_executor_timeout() {
        let err = SystemExecutor
            .run(&CommandSpec::new("sleep", Duration::from_millis(100)).arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_follower_terminate_escalates() {
        // Ignores SIGTERM, so only the SIGKILL can end it.
        let spec = CommandSpec::new("sh", Duration::ZERO).args(["-c", "trap '' TERM; sleep 30"]);
        let mut follower = spawn_follower(&spec).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        follower.handle.terminate(Duration::from_millis(200)).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), follower.child.wait())
            .await
            .expect("child should be killed")
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_terminate_after_exit_is_noop() {
        let handle = ManagedChild {
            program: "x".into(),
            pid: Some(i32::MAX),
            exited: Arc::new(AtomicBool::new(true)),
        };
        assert!(handle.terminate(Duration::ZERO).is_ok());
    }
}
