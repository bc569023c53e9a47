//! Proxmox VE integration module
//!
//! Provides the REST client, typed resource handles (nodes, pools, VMs)
//! and asynchronous task tracking.


mod client;
mod resource;
mod task;

pub use client::{Credentials, ProxmoxClient};
pub use resource::{flag, parse_ipconfig, CloneOptions, ConfigDiff, Node, Pool, Vm, VmConfig};
pub use task::Task;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::error::ApiError;

/// HTTP method of an API call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Ordered request parameters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter
    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.push((key.into(), value.to_string()));
        self
    }

    /// Add a parameter when a value is present
    pub fn set_opt(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn as_pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

/// Narrow interface to the Proxmox REST API.
///
/// `path` is relative to `/api2/json`. Implementations return the `data`
/// member of the response envelope.
#[async_trait]
pub trait PveApi: Send + Sync {
    async fn request(&self, method: Method, path: &str, params: &Params) -> Result<Value, ApiError>;
}

/// Render a JSON config value the way the API expects it in a form field
pub fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
