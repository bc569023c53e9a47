//! Configuration module
//!
//! Site settings for the template pipeline. Every value has a compiled-in
//! default, so the pipeline runs without any configuration file.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};
pub use file::{expand_path, find_config};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Proxmox API endpoint
    pub proxmox: ProxmoxConfig,

    /// SSH transport
    pub ssh: SshSettings,

    /// Polling schedule
    pub poll: PollConfig,

    /// Which VMs and pool the pipeline works on
    pub cluster: ClusterConfig,

    /// Cloud image locations
    pub image: ImageConfig,

    /// Primary storage backend
    pub storage: StorageConfig,

    /// Guest settings used while building the golden image
    pub guest: GuestConfig,
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = if file::is_yaml_file(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if file::is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Check values that would only fail deep inside the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.cluster.base_vmid == self.cluster.output_vmid {
            anyhow::bail!(
                "cluster.base_vmid and cluster.output_vmid must differ (both {})",
                self.cluster.base_vmid
            );
        }
        if self.guest.netmask > 32 {
            anyhow::bail!("guest.netmask must be at most 32, got {}", self.guest.netmask);
        }
        if self.guest.balloon_mb > self.guest.memory_mb {
            anyhow::bail!(
                "guest.balloon_mb ({}) exceeds guest.memory_mb ({})",
                self.guest.balloon_mb,
                self.guest.memory_mb
            );
        }
        if self.poll.interval_ms == 0 {
            anyhow::bail!("poll.interval_ms must be positive");
        }
        Ok(())
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(host) = &env.host {
            self.proxmox.host = host.clone();
        }
        if let Some(port) = env.port {
            self.proxmox.port = port;
        }
        if let Some(verify) = env.verify_tls {
            self.proxmox.verify_tls = verify;
        }
        if let Some(pool) = &env.pool {
            self.cluster.pool = pool.clone();
        }
    }
}

/// Proxmox API endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Host name or base URL of any cluster member
    pub host: String,

    pub port: u16,

    /// Verify the server certificate. The internal cluster uses a
    /// self-signed one, hence off by default.
    pub verify_tls: bool,

    /// Per-request HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: "elton-pve.internal.t-lab.cs.teu.ac.jp".to_string(),
            port: 8006,
            verify_tls: false,
            timeout_secs: 60,
        }
    }
}

/// SSH transport settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub username: String,
    pub port: u16,
    pub private_key_path: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            port: 22,
            private_key_path: None,
            connect_timeout_secs: None,
        }
    }
}

/// Polling schedule for task and guest waits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub jitter_ms: u64,
    /// Give up after this long; unset waits forever
    pub timeout_secs: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            jitter_ms: 0,
            timeout_secs: None,
        }
    }
}

/// VMs and pool handled by the pipeline
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub pool: String,
    /// Node holding the base VM and the golden image
    pub base_node: String,
    /// Base VM cloned into the golden image and into every node template
    pub base_vmid: u32,
    /// Id of the golden image
    pub output_vmid: u32,
    pub template_name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pool: "clustertest".to_string(),
            base_node: "elton-pve1".to_string(),
            base_vmid: 9000,
            output_vmid: 9100,
            template_name: "template-ubuntu-19.04-ltp".to_string(),
        }
    }
}

/// Cloud image locations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Base cloud image, downloaded fresh for every build
    pub url: String,
    /// Download location on the hypervisor node
    pub cache_path: String,
    /// Copy of the golden disk reachable from every node
    pub shared_path: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url: "https://cloud-images.ubuntu.com/disco/current/disco-server-cloudimg-amd64.img"
                .to_string(),
            cache_path: "/var/tmp/ubuntu-19.04.img".to_string(),
            shared_path: "/mnt/pve/nas/vm_image.qcow2".to_string(),
        }
    }
}

/// Primary storage backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage id
    pub name: String,
    /// Drive options appended to the disk spec
    pub options: String,
    /// Image format for imported disks
    pub format: String,
    /// Drive slot of the primary disk
    pub disk: String,
    /// Size increment applied after import
    pub grow_by: String,
    /// Where the storage is mounted on every node
    pub mount_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "ssd".to_string(),
            options: "discard=on,ssd=on,cache=unsafe".to_string(),
            format: "qcow2".to_string(),
            disk: "scsi0".to_string(),
            grow_by: "+20G".to_string(),
            mount_path: "/mnt/ssd".to_string(),
        }
    }
}

impl StorageConfig {
    /// File backing the primary disk of `vmid`
    pub fn disk_path(&self, vmid: u32) -> String {
        format!(
            "{}/images/{}/vm-{}-disk-0.{}",
            self.mount_path.trim_end_matches('/'),
            vmid,
            vmid,
            self.format
        )
    }
}

/// Guest settings for the build
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    pub address: String,
    pub netmask: u8,
    pub gateway: String,
    /// Memory ceiling in MiB
    pub memory_mb: u32,
    /// Balloon floor in MiB
    pub balloon_mb: u32,
    pub sockets: u32,
    pub vcpus: u32,
    /// Unit whose completion marks the end of first boot
    pub ready_service: String,
    /// Script streamed to `bash` in the guest
    pub setup_script: String,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            address: "192.168.189.149".to_string(),
            netmask: 24,
            gateway: "192.168.189.1".to_string(),
            memory_mb: 8192,
            balloon_mb: 4096,
            sockets: 1,
            vcpus: 8,
            ready_service: "cloud-final".to_string(),
            setup_script: "eltonfs/clustertest/node-setup.sh".to_string(),
        }
    }
}
