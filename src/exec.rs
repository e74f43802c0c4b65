//! External command execution
//!
//! Every vendor adapter drives its CLI through a [`CommandRunner`]. The runner
//! captures combined stdout/stderr, enforces a per-invocation timeout, and kills
//! the child if the awaiting future is dropped, so a cancelled request never
//! leaves a vendor command running behind it.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{TundlerError, TundlerResult};

/// Environment variable naming a network namespace vendor commands run in
pub const NETNS_ENV: &str = "TUNDLER_NETNS";

/// Upper bound for a single vendor command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A single external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Skip network-namespace wrapping (CLIs that need host networking)
    pub host_network: bool,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            host_network: false,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn host_network(mut self) -> Self {
        self.host_network = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human readable command line, used in errors and logs
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Combined stdout and stderr, trimmed
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`TundlerError::CommandFailed`]
    pub fn into_result(self, invocation: &Invocation) -> TundlerResult<String> {
        if self.success() {
            Ok(self.output)
        } else {
            Err(TundlerError::CommandFailed {
                cmd: invocation.command_line(),
                code: self.code,
                output: self.output,
            })
        }
    }
}

/// Runs external programs on behalf of provider adapters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Only spawn failures and timeouts are errors; a
    /// non-zero exit is reported through [`CommandOutput::code`].
    async fn run(&self, invocation: &Invocation) -> TundlerResult<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    netns: Option<String>,
}

impl SystemRunner {
    pub fn new(netns: Option<String>) -> Self {
        Self {
            netns: netns.filter(|ns| !ns.is_empty()),
        }
    }

    /// Honour `TUNDLER_NETNS` when set
    pub fn from_env() -> Self {
        Self::new(std::env::var(NETNS_ENV).ok())
    }

    /// Program and arguments actually executed, after namespace wrapping
    fn resolve(&self, invocation: &Invocation) -> (String, Vec<String>) {
        match (&self.netns, invocation.host_network) {
            (Some(ns), false) => {
                let mut args = vec![
                    "netns".to_string(),
                    "exec".to_string(),
                    ns.clone(),
                    invocation.program.clone(),
                ];
                args.extend(invocation.args.iter().cloned());
                ("ip".to_string(), args)
            }
            _ => (invocation.program.clone(), invocation.args.clone()),
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> TundlerResult<CommandOutput> {
        let (program, args) = self.resolve(invocation);

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(invocation.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TundlerError::Timeout(format!(
                    "'{}' did not finish within {:?}",
                    invocation.command_line(),
                    invocation.timeout
                ))
            })??;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        debug!("[{}] {}", invocation.program, combined);
        if !output.status.success() {
            debug!("[{}] exited with {:?}", invocation.program, output.status.code());
        }

        Ok(CommandOutput {
            code: output.status.code(),
            output: combined,
        })
    }
}
