//! In-memory cluster for tests
//!
//! [`FakeCluster`] answers the handful of API endpoints the pipeline uses
//! and plays the remote shell of every node and guest. Task effects are
//! applied when the task is created; a task only "runs" for the configured
//! number of status polls.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::Context;
use crate::error::ApiError;
use crate::pve::{flag, parse_ipconfig, Method, Params, PveApi, Task, VmConfig};
use crate::remote::{CommandRunner, Invocation, Output};
use crate::utils::Poller;

const READY_OUTPUT: &str = "● cloud-final.service - Execute cloud user/final scripts\n   \
     Active: active (exited) since Mon 2019-06-03 10:00:00 UTC; 2s ago\n";
const BOOTING_OUTPUT: &str = "● cloud-final.service - Execute cloud user/final scripts\n   \
     Active: activating (start) since Mon 2019-06-03 10:00:00 UTC; 1s ago\n";

struct FakeVm {
    node: String,
    config: VmConfig,
    running: bool,
}

struct FakeTask {
    node: String,
    polls_left: u32,
    exitstatus: String,
    log: Vec<String>,
}

#[derive(Default)]
struct FakePool {
    vms: Vec<u32>,
    storage: Vec<String>,
}

#[derive(Default)]
struct State {
    nodes: Vec<(String, String)>,
    vms: BTreeMap<u32, FakeVm>,
    pools: BTreeMap<String, FakePool>,
    tasks: HashMap<String, FakeTask>,
    task_counter: u64,
    task_polls: u32,
    ready_after: u32,
    ready_checks: u32,
    failing_tasks: HashMap<String, VecDeque<String>>,
    broken: Vec<String>,
    refused: Vec<(String, u16, String)>,
    failing_script: Option<i32>,
    mutations: usize,
    log_requests: usize,
    migrations: usize,
    disk_growth: BTreeMap<u32, Vec<String>>,
    commands: BTreeMap<String, Vec<String>>,
    scripts: Vec<Vec<u8>>,
}

/// Builder for [`FakeCluster`]
#[derive(Default)]
pub struct FakeClusterBuilder {
    state: State,
}

impl FakeClusterBuilder {
    pub fn node(mut self, name: &str, ip: &str) -> Self {
        self.state.nodes.push((name.to_string(), ip.to_string()));
        self
    }

    pub fn vm(mut self, node: &str, vmid: u32, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.vms.insert(
            vmid,
            FakeVm {
                node: node.to_string(),
                config,
                running: false,
            },
        );
        self
    }

    pub fn running(mut self, vmid: u32) -> Self {
        if let Some(vm) = self.state.vms.get_mut(&vmid) {
            vm.running = true;
        }
        self
    }

    pub fn pool(mut self, name: &str) -> Self {
        self.state.pools.entry(name.to_string()).or_default();
        self
    }

    pub fn pool_member(mut self, pool: &str, vmid: u32) -> Self {
        self.state.pools.entry(pool.to_string()).or_default().vms.push(vmid);
        self
    }

    pub fn pool_storage(mut self, pool: &str, storage: &str) -> Self {
        self.state
            .pools
            .entry(pool.to_string())
            .or_default()
            .storage
            .push(storage.to_string());
        self
    }

    /// Number of status polls a task reports "running" for
    pub fn task_polls(mut self, polls: u32) -> Self {
        self.state.task_polls = polls;
        self
    }

    /// Number of readiness checks answered "still booting"
    pub fn ready_after(mut self, checks: u32) -> Self {
        self.state.ready_after = checks;
        self
    }

    pub fn build(self) -> FakeCluster {
        FakeCluster {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

/// Shared in-memory cluster
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn builder() -> FakeClusterBuilder {
        FakeClusterBuilder::default()
    }

    /// Context wired to this cluster, polling every millisecond
    pub fn context(&self) -> Context {
        Context::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Poller::new(Duration::from_millis(1)),
        )
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn spawn_task(&self, node: &str, exitstatus: &str, log: Vec<String>) -> Task {
        self.with(|s| {
            let upid = s.new_task(node, "test", 0, exitstatus.to_string());
            if let Some(task) = s.tasks.get_mut(&upid) {
                task.log = log;
            }
            Task::new(node, upid)
        })
    }

    /// Make the next task of `kind` (clone, stop, delete, ...) fail
    pub fn fail_next_task(&self, kind: &str, exitstatus: &str) {
        self.with(|s| {
            s.failing_tasks
                .entry(kind.to_string())
                .or_default()
                .push_back(exitstatus.to_string())
        });
    }

    /// Answer garbage for every request whose path contains `pattern`
    pub fn break_api(&self, pattern: &str) {
        self.with(|s| s.broken.push(pattern.to_string()));
    }

    /// Answer `status` for every request whose path contains `pattern`
    pub fn fail_api(&self, pattern: &str, status: u16, message: &str) {
        self.with(|s| {
            s.refused
                .push((pattern.to_string(), status, message.to_string()))
        });
    }

    /// Make the guest setup script exit with `code`
    pub fn fail_script(&self, code: i32) {
        self.with(|s| s.failing_script = Some(code));
    }

    pub fn has_vm(&self, vmid: u32) -> bool {
        self.with(|s| s.vms.contains_key(&vmid))
    }

    pub fn is_vm_running(&self, vmid: u32) -> bool {
        self.with(|s| s.vms.get(&vmid).is_some_and(|vm| vm.running))
    }

    pub fn node_of(&self, vmid: u32) -> String {
        self.with(|s| s.vms.get(&vmid).map(|vm| vm.node.clone()).unwrap_or_default())
    }

    /// Configuration of `vmid`; `Value::Null` when absent
    pub fn config_of(&self, vmid: u32) -> Value {
        self.with(|s| {
            s.vms
                .get(&vmid)
                .map(|vm| Value::Object(vm.config.clone()))
                .unwrap_or(Value::Null)
        })
    }

    pub fn pool_members(&self, pool: &str) -> Vec<u32> {
        self.with(|s| s.pools.get(pool).map(|p| p.vms.clone()).unwrap_or_default())
    }

    pub fn disk_growth(&self, vmid: u32) -> Vec<String> {
        self.with(|s| s.disk_growth.get(&vmid).cloned().unwrap_or_default())
    }

    /// Commands run on `host`, space-joined
    pub fn node_commands(&self, host: &str) -> Vec<String> {
        self.with(|s| s.commands.get(host).cloned().unwrap_or_default())
    }

    pub fn scripts_run(&self) -> Vec<Vec<u8>> {
        self.with(|s| s.scripts.clone())
    }

    /// Mutating API calls plus remote commands
    pub fn mutations(&self) -> usize {
        self.with(|s| s.mutations)
    }

    pub fn log_requests(&self) -> usize {
        self.with(|s| s.log_requests)
    }

    pub fn migrations(&self) -> usize {
        self.with(|s| s.migrations)
    }

    /// VMs currently flagged as templates
    pub fn templates(&self) -> usize {
        self.with(|s| {
            s.vms
                .values()
                .filter(|vm| flag(&vm.config, "template"))
                .count()
        })
    }
}

#[async_trait]
impl PveApi for FakeCluster {
    async fn request(&self, method: Method, path: &str, params: &Params) -> Result<Value, ApiError> {
        self.with(|s| s.request(method, path, params))
    }
}

#[async_trait]
impl CommandRunner for FakeCluster {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Output> {
        Ok(self.with(|s| s.run(invocation)))
    }
}

fn not_found(method: Method, path: &str, message: String) -> ApiError {
    ApiError::Resource {
        method: method.to_string(),
        path: path.to_string(),
        status: 500,
        message,
    }
}

impl State {
    fn new_task(&mut self, node: &str, kind: &str, vmid: u32, exitstatus: String) -> String {
        self.task_counter += 1;
        let upid = format!(
            "UPID:{}:{:08X}:{:08X}:5CF4D2E1:{}:{}:root@pam:",
            node, self.task_counter, self.task_counter * 7, kind, vmid
        );
        self.tasks.insert(
            upid.clone(),
            FakeTask {
                node: node.to_string(),
                polls_left: self.task_polls,
                exitstatus,
                log: vec![format!("starting {kind} of {vmid}"), "TASK OK".to_string()],
            },
        );
        upid
    }

    /// Start a task; `effect` runs only when the task is meant to succeed
    fn task(
        &mut self,
        node: &str,
        kind: &str,
        vmid: u32,
        effect: impl FnOnce(&mut State) -> Result<(), String>,
    ) -> Value {
        let injected = self.failing_tasks.get_mut(kind).and_then(VecDeque::pop_front);
        let exitstatus = match injected {
            Some(failure) => failure,
            None => match effect(self) {
                Ok(()) => "OK".to_string(),
                Err(failure) => failure,
            },
        };
        Value::String(self.new_task(node, kind, vmid, exitstatus))
    }

    fn request(&mut self, method: Method, path: &str, params: &Params) -> Result<Value, ApiError> {
        if self.broken.iter().any(|p| path.contains(p.as_str())) {
            return Err(ApiError::malformed(path, "unexpected end of input"));
        }
        let refused = self.refused.iter().find(|(p, _, _)| path.contains(p.as_str()));
        if let Some((_, status, message)) = refused {
            return Err(ApiError::Resource {
                method: method.to_string(),
                path: path.to_string(),
                status: *status,
                message: message.clone(),
            });
        }
        if method != Method::Get {
            self.mutations += 1;
        }

        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match (method, parts.as_slice()) {
            (Method::Get, ["nodes"]) => Ok(Value::Array(
                self.nodes
                    .iter()
                    .map(|(name, _)| json!({ "node": name, "status": "online" }))
                    .collect(),
            )),
            (Method::Get, ["cluster", "status"]) => {
                let mut entries = vec![json!({ "type": "cluster", "name": "fake", "quorate": 1 })];
                entries.extend(
                    self.nodes
                        .iter()
                        .map(|(name, ip)| json!({ "type": "node", "name": name, "ip": ip })),
                );
                Ok(Value::Array(entries))
            }
            (Method::Get, ["cluster", "nextid"]) => {
                let id = (100..).find(|id| !self.vms.contains_key(id)).unwrap_or(100);
                Ok(Value::String(id.to_string()))
            }
            (Method::Get, ["pools", pool]) => self.pool(pool, path),
            (Method::Get, ["nodes", node, "qemu"]) => Ok(Value::Array(
                self.vms
                    .iter()
                    .filter(|(_, vm)| vm.node == *node)
                    .map(|(id, vm)| json!({ "vmid": id, "status": status_of(vm) }))
                    .collect(),
            )),
            (_, ["nodes", node, "tasks", upid, action]) => self.task_request(method, path, node, upid, action, params),
            (_, ["nodes", node, "qemu", vmid, rest @ ..]) => {
                let vmid: u32 = vmid
                    .parse()
                    .map_err(|_| not_found(method, path, format!("invalid vmid {vmid}")))?;
                match self.vms.get(&vmid) {
                    Some(vm) if vm.node == *node => {}
                    _ => {
                        return Err(not_found(
                            method,
                            path,
                            format!("Configuration file 'nodes/{node}/qemu-server/{vmid}.conf' does not exist"),
                        ))
                    }
                }
                self.vm_request(method, path, node, vmid, &rest.join("/"), params)
            }
            _ => Err(ApiError::Resource {
                method: method.to_string(),
                path: path.to_string(),
                status: 501,
                message: format!("Method '{method} {path}' not implemented"),
            }),
        }
    }

    fn pool(&self, name: &str, path: &str) -> Result<Value, ApiError> {
        let pool = self
            .pools
            .get(name)
            .ok_or_else(|| not_found(Method::Get, path, format!("pool '{name}' does not exist")))?;

        let mut members: Vec<Value> = pool
            .vms
            .iter()
            .filter_map(|id| self.vms.get(id).map(|vm| (id, vm)))
            .map(|(id, vm)| {
                json!({
                    "id": format!("qemu/{id}"),
                    "type": "qemu",
                    "vmid": id,
                    "node": vm.node,
                    "status": status_of(vm),
                })
            })
            .collect();
        members.extend(pool.storage.iter().map(|storage| {
            json!({ "id": format!("storage/{storage}"), "type": "storage", "storage": storage })
        }));
        Ok(json!({ "members": members }))
    }

    fn task_request(
        &mut self,
        method: Method,
        path: &str,
        node: &str,
        upid: &str,
        action: &str,
        params: &Params,
    ) -> Result<Value, ApiError> {
        let task = self
            .tasks
            .get_mut(upid)
            .filter(|t| t.node == node)
            .ok_or_else(|| not_found(method, path, format!("no such task '{upid}'")))?;

        match (method, action) {
            (Method::Get, "status") => {
                if task.polls_left > 0 {
                    task.polls_left -= 1;
                    Ok(json!({ "status": "running", "upid": upid }))
                } else {
                    Ok(json!({ "status": "stopped", "exitstatus": task.exitstatus, "upid": upid }))
                }
            }
            (Method::Get, "log") => {
                let start: usize = params.get("start").and_then(|v| v.parse().ok()).unwrap_or(0);
                let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
                let page: Vec<Value> = task
                    .log
                    .iter()
                    .enumerate()
                    .skip(start)
                    .take(limit)
                    .map(|(i, line)| json!({ "n": i + 1, "t": line }))
                    .collect();
                self.log_requests += 1;
                Ok(Value::Array(page))
            }
            _ => Err(not_found(method, path, format!("unsupported task action {action}"))),
        }
    }

    fn vm_request(
        &mut self,
        method: Method,
        path: &str,
        node: &str,
        vmid: u32,
        action: &str,
        params: &Params,
    ) -> Result<Value, ApiError> {
        let vm = self
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| not_found(method, path, format!("VM {vmid} does not exist")))?;

        match (method, action) {
            (Method::Get, "status/current") => Ok(json!({ "vmid": vmid, "status": status_of(vm) })),
            (Method::Get, "config") => Ok(Value::Object(vm.config.clone())),
            (Method::Put, "config") => {
                for (key, value) in params.iter() {
                    vm.config.insert(key.to_string(), Value::String(value.to_string()));
                }
                Ok(Value::Null)
            }
            (Method::Put, "resize") => {
                let disk = params.get("disk").unwrap_or_default();
                let size = params.get("size").unwrap_or_default();
                self.disk_growth
                    .entry(vmid)
                    .or_default()
                    .push(format!("{disk} {size}"));
                Ok(Value::Null)
            }
            (Method::Post, "template") => {
                vm.config.insert("template".to_string(), json!(1));
                Ok(Value::Null)
            }
            (Method::Post, "status/start") => Ok(self.task(node, "qmstart", vmid, |s| {
                s.set_running(vmid, true);
                Ok(())
            })),
            (Method::Post, "status/stop") => Ok(self.task(node, "stop", vmid, |s| {
                s.set_running(vmid, false);
                Ok(())
            })),
            (Method::Delete, "") => Ok(self.task(node, "delete", vmid, |s| s.destroy(vmid))),
            (Method::Post, "migrate") => {
                let target = params.get("target").unwrap_or_default().to_string();
                if !self.nodes.iter().any(|(name, _)| *name == target) {
                    return Err(not_found(method, path, format!("no such node '{target}'")));
                }
                Ok(self.task(node, "qmigrate", vmid, |s| s.migrate(vmid, target)))
            }
            (Method::Post, "clone") => {
                let newid: u32 = params
                    .get("newid")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| not_found(method, path, "newid is required".to_string()))?;
                if self.vms.contains_key(&newid) {
                    return Err(not_found(method, path, format!("VM {newid} already exists")));
                }
                let params = params.clone();
                Ok(self.task(node, "clone", vmid, |s| {
                    s.clone_vm(vmid, newid, &params);
                    Ok(())
                }))
            }
            _ => Err(ApiError::Resource {
                method: method.to_string(),
                path: path.to_string(),
                status: 501,
                message: format!("Method '{method} {path}' not implemented"),
            }),
        }
    }

    fn set_running(&mut self, vmid: u32, running: bool) {
        if let Some(vm) = self.vms.get_mut(&vmid) {
            vm.running = running;
        }
    }

    fn destroy(&mut self, vmid: u32) -> Result<(), String> {
        let vm = self.vms.get(&vmid).ok_or_else(|| format!("VM {vmid} does not exist"))?;
        if flag(&vm.config, "protection") {
            return Err("can't remove VM - protection mode enabled".to_string());
        }
        if vm.running {
            return Err(format!("VM {vmid} is running - destroy failed"));
        }
        self.vms.remove(&vmid);
        for pool in self.pools.values_mut() {
            pool.vms.retain(|id| *id != vmid);
        }
        Ok(())
    }

    fn migrate(&mut self, vmid: u32, target: String) -> Result<(), String> {
        let vm = self.vms.get_mut(&vmid).ok_or_else(|| format!("VM {vmid} does not exist"))?;
        if vm.running {
            return Err("can't migrate running VM without --online".to_string());
        }
        if let Some(local) = vm
            .config
            .values()
            .filter_map(Value::as_str)
            .find(|v| v.contains("cloudinit"))
        {
            return Err(format!("can't migrate local disk '{local}'"));
        }
        vm.node = target;
        self.migrations += 1;
        Ok(())
    }

    fn clone_vm(&mut self, source: u32, newid: u32, params: &Params) {
        let Some(vm) = self.vms.get(&source) else {
            return;
        };
        let mut config = vm.config.clone();
        let node = vm.node.clone();

        config.remove("template");
        for key in ["name", "description"] {
            if let Some(value) = params.get(key) {
                config.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        if let Some(pool) = params.get("pool") {
            self.pools.entry(pool.to_string()).or_default().vms.push(newid);
        }
        self.vms.insert(
            newid,
            FakeVm {
                node,
                config,
                running: false,
            },
        );
    }

    fn run(&mut self, invocation: &Invocation) -> Output {
        self.mutations += 1;

        if invocation.argv == ["xargs", "-0", "env"] {
            let input = invocation.stdin.clone().unwrap_or_default();
            let args: Vec<String> = String::from_utf8_lossy(&input)
                .split('\0')
                .map(str::to_string)
                .collect();
            self.record(&invocation.host, args.join(" "));
            return self.node_command(&invocation.host, &args);
        }

        self.record(&invocation.host, invocation.display_command());
        self.guest_command(invocation)
    }

    fn record(&mut self, host: &str, command: String) {
        self.commands.entry(host.to_string()).or_default().push(command);
    }

    fn node_command(&mut self, host: &str, args: &[String]) -> Output {
        let Some(node) = self
            .nodes
            .iter()
            .find(|(_, ip)| ip == host)
            .map(|(name, _)| name.clone())
        else {
            return Output::failure(255, format!("ssh: connect to host {host} port 22: No route to host"));
        };

        match args.first().map(String::as_str) {
            Some("qm") if args.get(1).map(String::as_str) == Some("importdisk") => {
                let vmid: Option<u32> = args.get(2).and_then(|v| v.parse().ok());
                match vmid.and_then(|id| self.vms.get_mut(&id).map(|vm| (id, vm))) {
                    Some((id, vm)) if vm.node == node => {
                        let storage = args.get(4).cloned().unwrap_or_default();
                        vm.config.insert(
                            "unused0".to_string(),
                            Value::String(format!("{storage}:{id}/vm-{id}-disk-0.qcow2")),
                        );
                        Output::success(format!("Successfully imported disk as 'unused0:{storage}'\n"))
                    }
                    _ => Output::failure(
                        2,
                        format!(
                            "Configuration file 'nodes/{node}/qemu-server/{}.conf' does not exist",
                            args.get(2).map(String::as_str).unwrap_or("?")
                        ),
                    ),
                }
            }
            Some(_) => Output::success(""),
            None => Output::failure(123, "xargs: no command"),
        }
    }

    fn guest_command(&mut self, invocation: &Invocation) -> Output {
        let host = invocation.host.as_str();
        let guest = self
            .vms
            .iter()
            .find(|(_, vm)| {
                vm.running
                    && vm
                        .config
                        .get("ipconfig0")
                        .and_then(Value::as_str)
                        .and_then(|c| parse_ipconfig(c).ok())
                        .is_some_and(|ip| ip == host)
            })
            .map(|(id, _)| *id);
        let Some(vmid) = guest else {
            return Output::failure(255, format!("ssh: connect to host {host} port 22: Connection refused"));
        };

        match invocation.argv.first().map(String::as_str) {
            Some("systemctl") => {
                if self.ready_checks < self.ready_after {
                    self.ready_checks += 1;
                    Output::success(BOOTING_OUTPUT)
                } else {
                    Output::success(READY_OUTPUT)
                }
            }
            Some("bash") => {
                self.scripts.push(invocation.stdin.clone().unwrap_or_default());
                match self.failing_script {
                    Some(code) => Output::failure(code, "setup failed\n"),
                    None => Output::success(""),
                }
            }
            Some("poweroff") => {
                self.set_running(vmid, false);
                Output {
                    exit_code: None,
                    stderr: b"Connection to host closed by remote host.\n".to_vec(),
                    ..Default::default()
                }
            }
            _ => Output::failure(127, "command not found"),
        }
    }
}

fn status_of(vm: &FakeVm) -> &'static str {
    if vm.running {
        "running"
    } else {
        "stopped"
    }
}
