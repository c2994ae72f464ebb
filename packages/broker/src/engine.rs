//! Running engine executables as child processes.
//!
//! The engine is opaque: it receives a program, arguments, environment and
//! optional stdin, and hands back its exit code and captured output. A
//! non-zero exit is a normal result, only a failure to start the process
//! is an [`EngineError`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit code reported when an invocation is killed for running too long.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

pub type EngineFuture<'a> = Pin<Box<dyn Future<Output = Result<EngineOutput, EngineError>> + Send + 'a>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineInvocation {
    /// Program name, resolved against the engine's binary directory.
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    /// Run through `/bin/bash -c` with the joined command line.
    pub tty: bool,
}

impl EngineInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Something that can run an [`EngineInvocation`].
pub trait Engine: Send + Sync + 'static {
    fn run<'a>(&'a self, invocation: &'a EngineInvocation) -> EngineFuture<'a>;
}

/// Runs invocations as local processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessEngine {
    bin_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look programs up in `dir` instead of `PATH`.
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn resolve(&self, program: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        }
    }

    fn command(&self, invocation: &EngineInvocation) -> Command {
        let program = self.resolve(&invocation.program);
        let mut command = if invocation.tty {
            let mut line = shell_quote(&program.to_string_lossy());
            for arg in &invocation.args {
                line.push(' ');
                line.push_str(&shell_quote(arg));
            }
            let mut command = Command::new("/bin/bash");
            command.arg("-c").arg(line);
            command
        } else {
            let mut command = Command::new(program);
            command.args(&invocation.args);
            command
        };

        command
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn execute(&self, invocation: &EngineInvocation) -> Result<EngineOutput, EngineError> {
        let started = Instant::now();
        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.clone(), child.stdin.take()) {
            // Written concurrently with the output reads.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "Engine closed stdin early");
                }
            });
        }

        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!(program = %invocation.program, ?limit, "Engine timed out");
                    return Ok(EngineOutput {
                        exit_code: TIMEOUT_EXIT_CODE,
                        stdout: String::new(),
                        stderr: format!("timed out after {}s", limit.as_secs_f64()),
                        elapsed: started.elapsed(),
                    });
                }
            },
            None => wait.await,
        }
        .map_err(|source| EngineError::Wait {
            program: invocation.program.clone(),
            source,
        })?;

        Ok(EngineOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: started.elapsed(),
        })
    }
}

impl Engine for ProcessEngine {
    fn run<'a>(&'a self, invocation: &'a EngineInvocation) -> EngineFuture<'a> {
        Box::pin(self.execute(invocation))
    }
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}
