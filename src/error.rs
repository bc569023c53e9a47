//! Error types
//!
//! Domain errors raised by the hypervisor client, the remote execution
//! channel and the provisioning pipeline.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by the Proxmox API layer
#[derive(Error, Debug)]
pub enum ApiError {
    /// The server answered with an error status. Proxmox uses this for
    /// missing resources as well as rejected operations.
    #[error("{method} {path} failed with status {status}: {message}")]
    Resource {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed response from {path}: {message}")]
    Malformed { path: String, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn malformed(path: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Provisioning errors
#[derive(Error, Debug)]
pub enum Error {
    /// A hypervisor task reached a terminal state other than OK.
    #[error("task {upid} on {node} failed: {exitstatus}")]
    TaskFailed {
        node: String,
        upid: String,
        exitstatus: String,
    },

    /// A remote command exited nonzero (or was killed).
    #[error("command `{command}` on {host} exited with {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Execution {
        host: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid value: {0}")]
    Value(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
