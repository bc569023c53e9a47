//! Golden template builder
//!
//! Clones the base VM, attaches a freshly downloaded cloud image, boots it
//! with a fixed setup address, runs the setup script in the guest and
//! powers it off again.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{import_disk, primary_disk};
use crate::config::{AppConfig, GuestConfig, ImageConfig, StorageConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pve::{CloneOptions, ConfigDiff, Node, Pool, Vm};
use crate::remote::{self, HostKeyPolicy, Invocation, RemoteCommand};

/// What `systemctl status` prints once a oneshot unit has finished
const READY_MARKER: &[u8] = b"Active: active (exited) since";

/// Builds the single golden VM that the distributor copies
pub struct TemplateBuilder {
    ctx: Context,
    pool: Pool,
    base: Vm,
    output: Vm,
    template_name: String,
    script: PathBuf,
    storage: StorageConfig,
    image: ImageConfig,
    guest: GuestConfig,
}

impl TemplateBuilder {
    pub fn new(
        ctx: Context,
        pool: Pool,
        base: Vm,
        output: Vm,
        template_name: impl Into<String>,
        script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            pool,
            base,
            output,
            template_name: template_name.into(),
            script: script.into(),
            storage: StorageConfig::default(),
            image: ImageConfig::default(),
            guest: GuestConfig::default(),
        }
    }

    pub fn from_config(ctx: Context, config: &AppConfig) -> Self {
        let cluster = &config.cluster;
        Self::new(
            ctx,
            Pool::new(&cluster.pool),
            Vm::new(&cluster.base_node, cluster.base_vmid),
            Vm::new(&cluster.base_node, cluster.output_vmid),
            &cluster.template_name,
            &config.guest.setup_script,
        )
        .storage(config.storage.clone())
        .image(config.image.clone())
        .guest(config.guest.clone())
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn image(mut self, image: ImageConfig) -> Self {
        self.image = image;
        self
    }

    pub fn guest(mut self, guest: GuestConfig) -> Self {
        self.guest = guest;
        self
    }

    pub fn output(&self) -> &Vm {
        &self.output
    }

    /// Delete the output VM if it exists
    pub async fn remove(&self) -> Result<()> {
        let ctx = &self.ctx;
        let vm = &self.output;

        if !vm.exists(ctx).await? {
            info!("{} does not exist, nothing to remove", vm);
            return Ok(());
        }

        if !vm.is_stopped(ctx).await? {
            vm.stop(ctx).await?.wait(ctx).await?;
        }
        vm.update_config(ctx, &ConfigDiff::unprotect()).await?;
        vm.remove(ctx).await?.wait(ctx).await?;
        info!("Removed {}", vm);
        Ok(())
    }

    /// Build the golden VM. Any failed step aborts; run [`remove`] before
    /// trying again.
    ///
    /// [`remove`]: TemplateBuilder::remove
    pub async fn build(&self) -> Result<()> {
        let ctx = &self.ctx;
        let vm = &self.output;
        let script = read_script(&self.script).await?;
        info!("Building {} from {}", vm, self.base);

        let options = CloneOptions::full()
            .name(&self.template_name)
            .pool(&self.pool.name);
        self.base.clone_to(ctx, vm.vmid, &options).await?.wait(ctx).await?;
        // Clones inherit the protection flag of their source.
        vm.update_config(ctx, &ConfigDiff::unprotect()).await?;

        self.attach_fresh_disk().await?;
        vm.update_config(ctx, &self.setup_overrides()).await?;

        vm.start(ctx).await?.wait(ctx).await?;

        let ip = vm.ip(ctx).await?;
        let ip = ip.as_str();
        info!("Waiting for {} to finish first boot", ip);
        ctx.poller
            .wait_until(&format!("{} to become ready", ip), move || self.is_ready(ip))
            .await?;

        self.run_script(ip, script).await?;
        self.power_off(ip).await?;

        ctx.poller
            .wait_until(&format!("{} to power off", vm), move || async move {
                Ok::<_, Error>(!vm.is_running(ctx).await?)
            })
            .await?;

        info!("Built {}", vm);
        Ok(())
    }

    /// Replace the VM disk with a freshly downloaded image
    async fn attach_fresh_disk(&self) -> Result<()> {
        let ctx = &self.ctx;
        let vm = &self.output;
        let ip = Node::new(&vm.node).ip(ctx).await?;
        let cache = self.image.cache_path.as_str();

        info!("Downloading {} on {}", self.image.url, vm.node);
        RemoteCommand::new(&ip, ["rm", "-f", cache])
            .execute(ctx.shell.as_ref())
            .await?;
        RemoteCommand::new(&ip, ["wget", self.image.url.as_str(), "-O", cache])
            .execute(ctx.shell.as_ref())
            .await?;

        import_disk(&ip, vm.vmid, cache, &self.storage)
            .execute(ctx.shell.as_ref())
            .await?;
        vm.update_config(
            ctx,
            &ConfigDiff::new().set(&self.storage.disk, primary_disk(&self.storage, vm.vmid)),
        )
        .await?;
        vm.resize(ctx, &self.storage.disk, &self.storage.grow_by).await
    }

    fn setup_overrides(&self) -> ConfigDiff {
        let guest = &self.guest;
        ConfigDiff::new()
            .set(
                "ipconfig0",
                format!("gw={},ip={}/{}", guest.gateway, guest.address, guest.netmask),
            )
            .set("agent", "enabled=0")
            .set("memory", guest.memory_mb)
            .set("balloon", guest.balloon_mb)
            .set("sockets", guest.sockets)
            .set("cores", guest.vcpus)
            .set("vcpus", guest.vcpus)
    }

    fn guest_command(&self, ip: &str, argv: &[&str]) -> Invocation {
        Invocation::new(ip, argv.iter().copied()).host_keys(HostKeyPolicy::AcceptAny)
    }

    /// Query the readiness unit. A failing ssh (guest still booting, sshd
    /// not up yet) only means "not ready".
    async fn is_ready(&self, ip: &str) -> Result<bool> {
        let invocation = self.guest_command(ip, &["systemctl", "status", self.guest.ready_service.as_str()]);
        match remote::execute(self.ctx.shell.as_ref(), &invocation).await {
            Ok(stdout) => Ok(contains(&stdout, READY_MARKER)),
            Err(Error::Execution { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run_script(&self, ip: &str, script: Vec<u8>) -> Result<()> {
        info!("Running {} on {}", self.script.display(), ip);
        let invocation = self.guest_command(ip, &["bash"]).stdin(script);
        remote::execute(self.ctx.shell.as_ref(), &invocation).await?;
        Ok(())
    }

    /// Ask the guest to shut down. The connection usually drops before ssh
    /// sees an exit status, so a remote failure is only logged; the caller
    /// confirms the shutdown through the hypervisor.
    async fn power_off(&self, ip: &str) -> Result<()> {
        let invocation = self.guest_command(ip, &["poweroff"]);
        match remote::execute(self.ctx.shell.as_ref(), &invocation).await {
            Ok(_) => Ok(()),
            Err(e @ Error::Execution { .. }) => {
                warn!("Ignoring error from poweroff: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn read_script(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
