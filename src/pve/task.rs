//! Asynchronous hypervisor tasks
//!
//! Every long-running Proxmox operation returns a UPID; [`Task`] tracks it
//! until it reaches a terminal state.

use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

use super::{Method, Params};
use crate::context::Context;
use crate::error::{ApiError, Error, Result};

/// Lines requested per log page
const LOG_PAGE_SIZE: usize = 2000;

/// Handle to an operation running on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub node: String,
    pub upid: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    #[allow(dead_code)]
    n: u64,
    t: String,
}

impl Task {
    pub fn new(node: impl Into<String>, upid: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            upid: upid.into(),
        }
    }

    /// Build a task from the UPID returned by a mutating call
    pub(crate) fn from_response(node: &str, path: &str, data: serde_json::Value) -> Result<Self> {
        match data {
            serde_json::Value::String(upid) => Ok(Self::new(node, upid)),
            other => Err(ApiError::malformed(path, format!("expected UPID, got {other}")).into()),
        }
    }

    fn path(&self, suffix: &str) -> String {
        format!("/nodes/{}/tasks/{}/{}", self.node, self.upid, suffix)
    }

    async fn status(&self, ctx: &Context) -> Result<TaskStatus> {
        let path = self.path("status");
        let data = ctx.api.request(Method::Get, &path, &Params::new()).await?;
        serde_json::from_value(data).map_err(|e| ApiError::malformed(path, e.to_string()).into())
    }

    pub async fn is_running(&self, ctx: &Context) -> Result<bool> {
        Ok(self.status(ctx).await?.status == "running")
    }

    pub async fn is_ok(&self, ctx: &Context) -> Result<bool> {
        Ok(self.status(ctx).await?.exitstatus.as_deref() == Some("OK"))
    }

    /// Block until the task leaves the running state.
    ///
    /// Fails with [`Error::TaskFailed`] unless the exit status is `OK`.
    pub async fn wait(&self, ctx: &Context) -> Result<()> {
        debug!("Waiting for task {}", self);
        ctx.poller
            .wait_until(&format!("task {}", self.upid), move || async move {
                Ok::<_, Error>(!self.is_running(ctx).await?)
            })
            .await?;

        let status = self.status(ctx).await?;
        match status.exitstatus.as_deref() {
            Some("OK") => Ok(()),
            other => {
                let exitstatus = other.unwrap_or("unknown").to_string();
                warn!("Task {} failed: {}", self, exitstatus);
                Err(Error::TaskFailed {
                    node: self.node.clone(),
                    upid: self.upid.clone(),
                    exitstatus,
                })
            }
        }
    }

    /// Fetch the complete task log, page by page
    pub async fn fetch_log(&self, ctx: &Context) -> Result<String> {
        let path = self.path("log");
        let mut lines = Vec::new();
        let mut start = 0;

        loop {
            let params = Params::new().set("start", start).set("limit", LOG_PAGE_SIZE);
            let data = ctx.api.request(Method::Get, &path, &params).await?;
            let page: Vec<LogLine> = serde_json::from_value(data)
                .map_err(|e| ApiError::malformed(path.as_str(), e.to_string()))?;

            let len = page.len();
            lines.extend(page.into_iter().map(|l| l.t));
            if len < LOG_PAGE_SIZE {
                break;
            }
            start += LOG_PAGE_SIZE;
        }

        Ok(lines.join("\n"))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.upid, self.node)
    }
}
