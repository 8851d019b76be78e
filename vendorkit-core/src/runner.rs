// External command execution (install/build/pack/explain)

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command not found: {program}")]
    NotFound { program: String },

    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} failed (exit code {}): {diagnostics}", .code.map_or("none".to_string(), |c| c.to_string()))]
    Failed {
        command: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("{command} timed out after {} seconds", .after.as_secs())]
    TimedOut { command: String, after: Duration },
}

/// How the child's stdout/stderr are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Stream straight to our terminal
    Inherit,
    /// Capture (and so suppress) the output
    Capture,
}

/// A single external command: program plus explicit argv, never a shell string
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub output: OutputMode,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new<P: AsRef<Path>>(program: &str, cwd: P) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            output: OutputMode::Capture,
            timeout: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
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

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Seam for running external commands
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let command_line = invocation.to_string();
        log::debug!("running `{}` in {}", command_line, invocation.cwd.display());

        let program = which::which(&invocation.program).map_err(|_| CommandError::NotFound {
            program: invocation.program.clone(),
        })?;

        let mut command = Command::new(program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null());

        match invocation.output {
            OutputMode::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Capture => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        // Drain pipes on their own threads so a chatty child never blocks on a full pipe
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        // Grandchildren can keep the pipes open after a kill, so the readers are
        // only joined once the child exited on its own
        let status = match wait_with_timeout(&mut child, invocation.timeout) {
            Ok(status) => status,
            Err(WaitError::TimedOut(after)) => {
                return Err(CommandError::TimedOut {
                    command: command_line,
                    after,
                });
            }
            Err(WaitError::Io(source)) => {
                return Err(CommandError::Spawn {
                    command: command_line,
                    source,
                });
            }
        };

        let output = CommandOutput {
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
        };

        if !status.success() {
            return Err(CommandError::Failed {
                command: command_line,
                code: status.code(),
                diagnostics: diagnostics_text(&output),
            });
        }

        Ok(output)
    }
}

enum WaitError {
    TimedOut(Duration),
    Io(std::io::Error),
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus, WaitError> {
    let Some(limit) = timeout else {
        return child.wait().map_err(WaitError::Io);
    };

    let start = Instant::now();
    loop {
        match child.try_wait().map_err(WaitError::Io)? {
            Some(status) => return Ok(status),
            None if start.elapsed() > limit => {
                child.kill().ok();
                child.wait().ok();
                return Err(WaitError::TimedOut(limit));
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Text worth showing when a command fails: stderr, or stdout if stderr is empty
fn diagnostics_text(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    output.stdout.trim().to_string()
}
