//! Running the external status command.
//! The trait lets shells and tests swap in their own process policy.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::PollError;

/// How often a running child is checked for exit.
const WAIT_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Trait for executing a command and capturing its output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, PollError>;
}

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    path: Option<String>,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `path` to the inherited `PATH` when spawning.
    pub fn with_path(path: Option<String>) -> Self {
        Self { path }
    }

    fn search_path(&self) -> Option<String> {
        let configured = self.path.as_ref()?;
        let new_path = match std::env::var("PATH") {
            Ok(inherited) if !inherited.is_empty() => format!("{configured}:{inherited}"),
            _ => configured.clone(),
        };
        Some(new_path)
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, PollError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(PollError::Execution {
                command: String::new(),
                reason: "empty command line".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        if let Some(new_path) = self.search_path() {
            debug!("Update PATH to: {new_path}");
            cmd.env("PATH", new_path);
        }

        debug!("Spawning command: {} {:?}", program, args);
        let mut child = cmd
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PollError::Execution {
                command: program.clone(),
                reason: e.to_string(),
            })?;

        let deadline = Instant::now() + timeout;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let exit_code = wait_until(&mut child, program, timeout, deadline)?;

        // A backgrounded grandchild may keep the pipes open after the child exits.
        let timed_out = || PollError::Timeout {
            command: program.clone(),
            timeout,
        };
        let stdout = collect_output(stdout, deadline).ok_or_else(timed_out)?;
        let stderr = collect_output(stderr, deadline).ok_or_else(timed_out)?;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Read a pipe to completion on its own thread so the child never blocks
/// on a full pipe buffer. The text arrives on the returned channel.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    let mut pipe = pipe?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut bytes) {
            warn!("Failed to read command output: {}", e);
        }
        let _ = tx.send(String::from_utf8_lossy(&bytes).into_owned());
    });
    Some(rx)
}

/// `None` when the pipe is still open at `deadline`.
fn collect_output(output: Option<Receiver<String>>, deadline: Instant) -> Option<String> {
    let Some(output) = output else {
        return Some(String::new());
    };
    match output.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(text) => Some(text),
        Err(RecvTimeoutError::Timeout) => {
            warn!("Command output still open at deadline, giving up on it");
            None
        }
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
    }
}

fn wait_until(
    child: &mut Child,
    program: &str,
    timeout: Duration,
    deadline: Instant,
) -> Result<i32, PollError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code().unwrap_or(-1)),
            Ok(None) if Instant::now() >= deadline => {
                warn!("Command {} timed out after {:?}, killing it", program, timeout);
                if let Err(e) = child.kill() {
                    warn!("Failed to kill {}: {}", program, e);
                }
                let _ = child.wait();
                return Err(PollError::Timeout {
                    command: program.to_string(),
                    timeout,
                });
            }
            Ok(None) => thread::sleep(WAIT_STEP),
            Err(e) => {
                return Err(PollError::Execution {
                    command: program.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}
