//! OpenSSH transport
//!
//! Spawns the system `ssh` client for every invocation.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CommandRunner, HostKeyPolicy, Invocation, Output};

/// SSH client configuration
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// Remote user
    pub username: String,

    /// SSH port
    pub port: u16,

    /// Private key path
    pub private_key_path: Option<PathBuf>,

    /// TCP connect timeout; `None` leaves the ssh default
    pub connect_timeout_secs: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            port: 22,
            private_key_path: None,
            connect_timeout_secs: None,
        }
    }
}

impl SshConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, secs: Option<u64>) -> Self {
        self.connect_timeout_secs = secs;
        self
    }
}

/// [`CommandRunner`] backed by the `ssh` binary
pub struct SshRunner {
    config: SshConfig,
}

impl SshRunner {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Build SSH command arguments
    fn build_ssh_args(&self, invocation: &Invocation) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        if invocation.host_keys == HostKeyPolicy::AcceptAny {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }

        if let Some(secs) = self.config.connect_timeout_secs {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={secs}"));
        }

        args.push("-p".to_string());
        args.push(self.config.port.to_string());

        if let Some(ref key_path) = self.config.private_key_path {
            args.push("-i".to_string());
            args.push(key_path.to_string_lossy().to_string());
        }

        args.push(format!("{}@{}", self.config.username, invocation.host));
        args.push("--".to_string());
        args.extend(invocation.argv.iter().cloned());
        args
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Output> {
        let args = self.build_ssh_args(invocation);
        debug!("ssh {}", args.join(" "));

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while the output is drained, so neither pipe can fill up.
        let stdin = child.stdin.take();
        let input = invocation.stdin.clone();
        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                pipe.write_all(&bytes).await?;
                pipe.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if let Err(e) = fed {
            // The remote side may exit before reading everything; its exit
            // status is what matters.
            debug!("stdin to {} closed early: {}", invocation.host, e);
        }

        Ok(Output {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code(),
        })
    }
}
