//! Remote command execution
//!
//! Runs commands on hypervisor nodes and guests over SSH. The argument
//! vector of a [`RemoteCommand`] travels NUL-separated on stdin so that no
//! argument is ever interpreted by a remote shell.


mod ssh;

pub use ssh::{SshConfig, SshRunner};

use async_trait::async_trait;
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};

/// How strictly to verify the remote host key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Use the known_hosts file as usual
    #[default]
    Strict,

    /// Accept any key and remember none; for freshly provisioned guests
    AcceptAny,
}

/// One command to run on a remote host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub host: String,
    pub host_keys: HostKeyPolicy,
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(host: impl Into<String>, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            host: host.into(),
            host_keys: HostKeyPolicy::Strict,
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn host_keys(mut self, policy: HostKeyPolicy) -> Self {
        self.host_keys = policy;
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Command line for logs and error messages
    pub fn display_command(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of an invocation
#[derive(Clone, Debug, Default)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl Output {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[cfg(test)]
impl Output {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            exit_code: Some(0),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }
}

/// Transport that runs an [`Invocation`]. Errors are local failures
/// (for example the ssh binary missing); a remote failure is an
/// [`Output`] with a nonzero exit code.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Output>;
}

/// Run an invocation and fail with [`Error::Execution`] on nonzero exit
pub async fn execute(runner: &dyn CommandRunner, invocation: &Invocation) -> Result<Vec<u8>> {
    debug!("[{}] {}", invocation.host, invocation.display_command());
    let output = runner.run(invocation).await?;

    if output.is_success() {
        Ok(output.stdout)
    } else {
        Err(Error::Execution {
            host: invocation.host.clone(),
            command: invocation.display_command(),
            code: output.exit_code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Argument vector executed on a host via `xargs -0 env`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommand {
    pub ip: String,
    pub args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(ip: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ip: ip.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn input_bytes(&self) -> Vec<u8> {
        self.args.join("\0").into_bytes()
    }

    pub fn invocation(&self) -> Invocation {
        Invocation::new(self.ip.as_str(), ["xargs", "-0", "env"]).stdin(self.input_bytes())
    }

    /// Run the command and return its stdout
    pub async fn execute(&self, runner: &dyn CommandRunner) -> Result<Vec<u8>> {
        debug!("[{}] {}", self.ip, self);
        execute(runner, &self.invocation()).await.map_err(|e| match e {
            Error::Execution {
                host, code, stderr, ..
            } => Error::Execution {
                host,
                command: self.to_string(),
                code,
                stderr,
            },
            other => other,
        })
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}
