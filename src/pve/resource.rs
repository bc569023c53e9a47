//! Cluster resource handles
//!
//! [`Node`], [`Pool`] and [`Vm`] are plain values naming something on the
//! cluster. They cache nothing: every query goes to the API.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use super::{param_value, Method, Params, Task};
use crate::context::Context;
use crate::error::{ApiError, Error, Result};

/// Live VM configuration as returned by the API
pub type VmConfig = Map<String, Value>;

/// Pool member type for QEMU guests
const QEMU_MEMBER: &str = "qemu";

/// Status the API uses for a VM whose configuration file is missing
const MISSING_STATUS: u16 = 500;

/// A hypervisor host
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
}

#[derive(Debug, Deserialize)]
struct ClusterStatusEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    ip: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// List every node of the cluster
    pub async fn list(ctx: &Context) -> Result<Vec<Node>> {
        let data = ctx.api.request(Method::Get, "/nodes", &Params::new()).await?;
        let entries: Vec<NodeEntry> = decode("/nodes", data)?;
        Ok(entries.into_iter().map(|e| Node::new(e.node)).collect())
    }

    /// Resolve the node's cluster address
    pub async fn ip(&self, ctx: &Context) -> Result<String> {
        let path = "/cluster/status";
        let data = ctx.api.request(Method::Get, path, &Params::new()).await?;
        let entries: Vec<ClusterStatusEntry> = decode(path, data)?;

        entries
            .into_iter()
            .find(|e| e.name == self.name)
            .and_then(|e| e.ip)
            .ok_or_else(|| Error::NotFound(format!("node {}", self.name)))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A named group of VMs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct PoolData {
    #[serde(default)]
    members: Vec<PoolMember>,
}

#[derive(Debug, Deserialize)]
struct PoolMember {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    node: String,
    #[serde(default)]
    vmid: Option<u32>,
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Snapshot of the QEMU guests in this pool; storage and other member
    /// kinds are skipped.
    pub async fn list(&self, ctx: &Context) -> Result<impl Iterator<Item = Vm>> {
        let path = format!("/pools/{}", self.name);
        let data = ctx.api.request(Method::Get, &path, &Params::new()).await?;
        let pool: PoolData = decode(&path, data)?;

        Ok(pool
            .members
            .into_iter()
            .filter(|m| m.kind == QEMU_MEMBER)
            .filter_map(|m| m.vmid.map(|vmid| Vm::new(m.node, vmid))))
    }
}

/// Optional parameters of a clone call
#[derive(Clone, Debug, Default)]
pub struct CloneOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pool: Option<String>,
    pub storage: Option<String>,
    pub full: bool,
}

impl CloneOptions {
    /// Full (not linked) clone
    pub fn full() -> Self {
        Self {
            full: true,
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    fn to_params(&self, newid: u32) -> Params {
        Params::new()
            .set("newid", newid)
            .set_opt("name", self.name.as_deref())
            .set_opt("description", self.description.as_deref())
            .set_opt("pool", self.pool.as_deref())
            .set_opt("storage", self.storage.as_deref())
            .set("full", u8::from(self.full))
    }
}

/// Keys to change in a VM configuration; everything else is left alone
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigDiff(BTreeMap<String, Value>);

impl ConfigDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Diff that clears the protection flag
    pub fn unprotect() -> Self {
        Self::new().set("protection", 0)
    }

    fn to_params(&self) -> Params {
        self.0
            .iter()
            .fold(Params::new(), |p, (k, v)| p.set(k.as_str(), param_value(v)))
    }
}

/// A QEMU guest on a node
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vm {
    pub node: String,
    pub vmid: u32,
}

#[derive(Debug, Deserialize)]
struct VmEntry {
    vmid: Value,
}

#[derive(Debug, Deserialize)]
struct VmStatus {
    status: String,
}

impl Vm {
    pub fn new(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: node.into(),
            vmid,
        }
    }

    fn path(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("/nodes/{}/qemu/{}", self.node, self.vmid)
        } else {
            format!("/nodes/{}/qemu/{}/{}", self.node, self.vmid, suffix)
        }
    }

    async fn call_task(&self, ctx: &Context, method: Method, suffix: &str, params: Params) -> Result<Task> {
        let path = self.path(suffix);
        let data = ctx.api.request(method, &path, &params).await?;
        let task = Task::from_response(&self.node, &path, data)?;
        debug!("{} {} -> {}", method, path, task.upid);
        Ok(task)
    }

    /// List every QEMU guest on every node
    pub async fn list(ctx: &Context) -> Result<Vec<Vm>> {
        let mut vms = Vec::new();
        for node in Node::list(ctx).await? {
            let path = format!("/nodes/{}/qemu", node.name);
            let data = ctx.api.request(Method::Get, &path, &Params::new()).await?;
            let entries: Vec<VmEntry> = decode(&path, data)?;
            for entry in entries {
                vms.push(Vm::new(node.name.clone(), parse_vmid(&path, &entry.vmid)?));
            }
        }
        Ok(vms)
    }

    /// Remove every unprotected VM on the cluster.
    ///
    /// With `skip_templates`, templates are kept as well. The removal tasks
    /// are returned unawaited.
    pub async fn remove_unprotected(ctx: &Context, skip_templates: bool) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for vm in Vm::list(ctx).await? {
            if vm.is_protected(ctx).await? {
                debug!("Keeping protected {}", vm);
                continue;
            }
            if skip_templates && vm.is_template(ctx).await? {
                debug!("Keeping template {}", vm);
                continue;
            }
            tasks.push(vm.remove(ctx).await?);
        }
        Ok(tasks)
    }

    /// Ask the cluster for an unused VM id.
    ///
    /// Two callers asking concurrently can be handed the same id.
    pub async fn next_id(ctx: &Context) -> Result<u32> {
        let path = "/cluster/nextid";
        let data = ctx.api.request(Method::Get, path, &Params::new()).await?;
        parse_vmid(path, &data)
    }

    pub async fn clone_to(&self, ctx: &Context, newid: u32, options: &CloneOptions) -> Result<Task> {
        info!("Cloning {} into {}", self, newid);
        self.call_task(ctx, Method::Post, "clone", options.to_params(newid)).await
    }

    pub async fn remove(&self, ctx: &Context) -> Result<Task> {
        info!("Removing {}", self);
        self.call_task(ctx, Method::Delete, "", Params::new()).await
    }

    pub async fn start(&self, ctx: &Context) -> Result<Task> {
        info!("Starting {}", self);
        self.call_task(ctx, Method::Post, "status/start", Params::new()).await
    }

    pub async fn stop(&self, ctx: &Context) -> Result<Task> {
        info!("Stopping {}", self);
        self.call_task(ctx, Method::Post, "status/stop", Params::new()).await
    }

    pub async fn migrate(&self, ctx: &Context, to: &Node) -> Result<Task> {
        info!("Migrating {} to {}", self, to);
        let params = Params::new().set("target", &to.name);
        self.call_task(ctx, Method::Post, "migrate", params).await
    }

    /// Grow (or set) a disk size. Synchronous.
    pub async fn resize(&self, ctx: &Context, disk: &str, size: &str) -> Result<()> {
        debug!("Resizing {} of {} by {}", disk, self, size);
        let params = Params::new().set("disk", disk).set("size", size);
        ctx.api.request(Method::Put, &self.path("resize"), &params).await?;
        Ok(())
    }

    /// Convert into a template.
    ///
    /// The API finishes the conversion in the background and offers no way
    /// to observe completion.
    pub async fn set_template(&self, ctx: &Context) -> Result<()> {
        info!("Converting {} into a template", self);
        ctx.api
            .request(Method::Post, &self.path("template"), &Params::new())
            .await?;
        Ok(())
    }

    pub async fn status(&self, ctx: &Context) -> Result<String> {
        let path = self.path("status/current");
        let data = ctx.api.request(Method::Get, &path, &Params::new()).await?;
        let status: VmStatus = decode(&path, data)?;
        Ok(status.status)
    }

    pub async fn is_running(&self, ctx: &Context) -> Result<bool> {
        Ok(self.status(ctx).await? == "running")
    }

    pub async fn is_stopped(&self, ctx: &Context) -> Result<bool> {
        Ok(self.status(ctx).await? == "stopped")
    }

    /// Whether the VM exists on its node.
    ///
    /// Proxmox answers 500 ("Configuration file ... does not exist") for an
    /// unknown VM; only that status means "absent". Permission errors,
    /// unreachable nodes (595) and every other failure propagate.
    pub async fn exists(&self, ctx: &Context) -> Result<bool> {
        match self.is_running(ctx).await {
            Ok(_) => Ok(true),
            Err(Error::Api(ApiError::Resource {
                status: MISSING_STATUS,
                message,
                ..
            })) => {
                debug!("{} treated as absent: {}", self, message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn config(&self, ctx: &Context) -> Result<VmConfig> {
        let path = self.path("config");
        let data = ctx.api.request(Method::Get, &path, &Params::new()).await?;
        decode(&path, data)
    }

    /// Apply a partial configuration change using the synchronous endpoint
    pub async fn update_config(&self, ctx: &Context, diff: &ConfigDiff) -> Result<()> {
        debug!("Updating config of {}: {:?}", self, diff);
        ctx.api
            .request(Method::Put, &self.path("config"), &diff.to_params())
            .await?;
        Ok(())
    }

    pub async fn is_protected(&self, ctx: &Context) -> Result<bool> {
        Ok(flag(&self.config(ctx).await?, "protection"))
    }

    pub async fn is_template(&self, ctx: &Context) -> Result<bool> {
        Ok(flag(&self.config(ctx).await?, "template"))
    }

    /// Address configured for the first cloud-init interface
    pub async fn ip(&self, ctx: &Context) -> Result<String> {
        let config = self.config(ctx).await?;
        let ipconfig = config
            .get("ipconfig0")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Value(format!("ipconfig0 is not set for {self}")))?;
        parse_ipconfig(ipconfig).map_err(|_| Error::Value(format!("IP address is not allocated for {self}")))
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm {} on {}", self.vmid, self.node)
    }
}

/// Read an integer flag such as `protection`, absent meaning 0
pub fn flag(config: &VmConfig, key: &str) -> bool {
    match config.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0) != 0,
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

/// Extract the address from an `ipconfig` value such as
/// `ip=192.168.189.149/24,gw=192.168.189.1`
pub fn parse_ipconfig(value: &str) -> Result<String> {
    value
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("ip="))
        .find_map(|cidr| {
            let (addr, prefix) = cidr.rsplit_once('/')?;
            let valid = !addr.is_empty()
                && !prefix.is_empty()
                && prefix.chars().all(|c| c.is_ascii_digit());
            valid.then(|| addr.to_string())
        })
        .ok_or_else(|| Error::Value(format!("no static address in `{value}`")))
}

fn parse_vmid(path: &str, value: &Value) -> Result<u32> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ApiError::malformed(path, format!("invalid vmid {value}")).into())
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| ApiError::malformed(path, e.to_string()).into())
}
