//! Lifecycle of the monitoring worker process.
//!
//! At most one worker is live. Replacing it is terminate-then-spawn, so
//! there is a short window with no worker running.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::WorkerError;

const EXIT_POLL: Duration = Duration::from_millis(25);

/// How to launch a worker. The bound address is appended as
/// `--address <addr>`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-run this executable's `monitor` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("monitor"))
    }

    fn spawn(&self, address: &str) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg("--address")
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
    }
}

pub struct WorkerHandle {
    child: Child,
    address: String,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the worker to shut down and wait up to `grace` for it to finish
    /// its own teardown before killing it.
    fn terminate(mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        request_shutdown(&mut self.child)?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(EXIT_POLL);
        }

        tracing::warn!(pid = self.pid(), "Worker did not exit in time, killing it");
        self.child.kill()?;
        self.child.wait()
    }
}

#[cfg(unix)]
fn request_shutdown(child: &mut Child) -> io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub address: String,
    pub pid: u32,
    pub alive: bool,
}

pub struct WorkerSupervisor {
    command: WorkerCommand,
    stop_grace: Duration,
    current: Option<WorkerHandle>,
}

impl WorkerSupervisor {
    pub fn new(command: WorkerCommand, stop_grace: Duration) -> Self {
        Self {
            command,
            stop_grace,
            current: None,
        }
    }

    /// Stop the current worker (if any) and start one bound to `address`.
    ///
    /// If the spawn fails the supervisor is left with no worker; the old
    /// one is not restarted.
    pub fn replace(&mut self, address: &str) -> Result<WorkerStatus, WorkerError> {
        self.stop()?;

        let child = self
            .command
            .spawn(address)
            .map_err(|source| WorkerError::Spawn {
                address: address.to_string(),
                source,
            })?;
        tracing::info!(pid = child.id(), %address, "Started monitoring worker");

        let mut handle = WorkerHandle {
            child,
            address: address.to_string(),
        };
        let status = WorkerStatus {
            address: handle.address.clone(),
            pid: handle.pid(),
            alive: handle.is_alive(),
        };
        self.current = Some(handle);
        Ok(status)
    }

    pub fn stop(&mut self) -> Result<(), WorkerError> {
        let Some(handle) = self.current.take() else {
            return Ok(());
        };

        let pid = handle.pid();
        let address = handle.address.clone();
        match handle.terminate(self.stop_grace) {
            Ok(status) => {
                tracing::info!(pid, %address, %status, "Monitoring worker stopped");
                Ok(())
            }
            Err(source) => Err(WorkerError::Terminate { pid, source }),
        }
    }

    /// Current worker, if one was started. A worker that has exited on its
    /// own is still reported, with `alive: false`.
    pub fn status(&mut self) -> Option<WorkerStatus> {
        let handle = self.current.as_mut()?;
        Some(WorkerStatus {
            address: handle.address.clone(),
            pid: handle.pid(),
            alive: handle.is_alive(),
        })
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Failed to stop monitoring worker");
        }
    }
}
