//! External command execution for CLI-driven backends (kubectl, job tools).
//!
//! Backends talk to their cluster through a [`CommandRunner`] so tests can
//! inject a recording fake instead of spawning real binaries.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::BoxFuture;

/// A command to run: program, argv, extra environment and optional stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build from an argv vector; `None` when it is empty.
    pub fn from_argv(mut argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            return None;
        }
        let program = argv.remove(0);
        Some(Self {
            program,
            args: argv,
            ..Self::default()
        })
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

    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend_from_slice(env);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Human-readable form for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs external commands to completion.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, std::io::Result<CommandOutput>>;
}

/// Runs commands as child processes. Children are killed if the future is
/// dropped, so an enclosing timeout never leaks a CLI process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, std::io::Result<CommandOutput>> {
        Box::pin(async move {
            debug!(command = %spec.display(), "running command");

            let mut child = Command::new(&spec.program)
                .args(&spec.args)
                .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(if spec.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            // Feed stdin while the output is drained, or both sides can block
            // on full pipes.
            let stdin = child.stdin.take();
            let input = spec.stdin.as_deref();
            let feed = async move {
                if let (Some(input), Some(mut stdin)) = (input, stdin) {
                    stdin.write_all(input.as_bytes()).await?;
                    // Dropped here: the child sees EOF.
                }
                Ok::<(), std::io::Error>(())
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output?;
            // A child may exit without reading all of its input.
            if let Err(e) = fed
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e);
            }
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Expand a whitespace-separated command template into an argv vector.
///
/// A token that is exactly `{args}` expands to `args`; other `{name}`
/// placeholders are substituted inside tokens.
pub fn expand_template(template: &str, vars: &[(&str, &str)], args: &[String]) -> Vec<String> {
    let mut argv = Vec::new();
    for token in template.split_whitespace() {
        if token == "{args}" {
            argv.extend(args.iter().cloned());
            continue;
        }
        let mut expanded = token.to_string();
        for (name, value) in vars {
            expanded = expanded.replace(&format!("{{{name}}}"), value);
        }
        argv.push(expanded);
    }
    argv
}
