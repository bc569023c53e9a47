//! Per-node template distribution
//!
//! Copies the golden disk to shared storage and produces one template per
//! cluster node. VMs created here are recognised later only through their
//! [`OwnershipTag`].

use serde_json::Value;
use tracing::{info, warn};

use super::{cloudinit_drive, import_disk, primary_disk, OwnershipTag};
use crate::config::{AppConfig, ImageConfig, StorageConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pve::{CloneOptions, ConfigDiff, Node, Pool, Task, Vm};
use crate::remote::RemoteCommand;

/// Drive holding the cloud-init seed
const CLOUDINIT_SLOT: &str = "ide0";

/// Fans a built template out to every node
pub struct TemplateDistributor {
    ctx: Context,
    pool: Pool,
    /// VM the per-node clones are made from
    template: Vm,
    /// VM whose disk image is copied into every clone
    disk_image: Vm,
    storage: StorageConfig,
    image: ImageConfig,
}

impl TemplateDistributor {
    pub fn new(ctx: Context, pool: Pool, template: Vm, disk_image: Vm) -> Self {
        Self {
            ctx,
            pool,
            template,
            disk_image,
            storage: StorageConfig::default(),
            image: ImageConfig::default(),
        }
    }

    pub fn from_config(ctx: Context, config: &AppConfig) -> Self {
        let cluster = &config.cluster;
        Self::new(
            ctx,
            Pool::new(&cluster.pool),
            Vm::new(&cluster.base_node, cluster.base_vmid),
            Vm::new(&cluster.base_node, cluster.output_vmid),
        )
        .storage(config.storage.clone())
        .image(config.image.clone())
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn image(mut self, image: ImageConfig) -> Self {
        self.image = image;
        self
    }

    pub fn tag(&self) -> OwnershipTag {
        OwnershipTag::new(self.template.vmid, self.disk_image.vmid)
    }

    /// VMs in the pool carrying this distributor's tag
    pub async fn owned(&self) -> Result<Vec<Vm>> {
        let ctx = &self.ctx;
        let tag = self.tag();
        let mut owned = Vec::new();

        for vm in self.pool.list(ctx).await? {
            let config = vm.config(ctx).await?;
            if tag.is_marked(description(&config)) {
                owned.push(vm);
            }
        }
        Ok(owned)
    }

    /// Remove every VM this distributor produced.
    ///
    /// Running VMs are stopped on one pass and removed on a later one.
    /// Failed tasks are ignored; the affected VMs are simply seen again on
    /// the next pass. Loops until no tagged VM is left.
    pub async fn remove_all(&self) -> Result<()> {
        let ctx = &self.ctx;
        let mut pass = 0;

        loop {
            pass += 1;
            let owned = self.owned().await?;
            if owned.is_empty() {
                info!("No VMs tagged {} left in pool {}", self.tag(), self.pool.name);
                return Ok(());
            }
            info!("Pass {}: {} tagged VM(s) to clean up", pass, owned.len());

            let mut tasks: Vec<Task> = Vec::with_capacity(owned.len());
            for vm in &owned {
                if vm.is_stopped(ctx).await? {
                    vm.update_config(ctx, &ConfigDiff::unprotect()).await?;
                    tasks.push(vm.remove(ctx).await?);
                } else {
                    tasks.push(vm.stop(ctx).await?);
                }
            }

            for task in &tasks {
                match task.wait(ctx).await {
                    Ok(()) => {}
                    Err(Error::TaskFailed { exitstatus, .. }) => {
                        warn!("Task {} failed ({}), will retry", task, exitstatus);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Produce one template per node from the built image.
    ///
    /// Returns the new templates. The final conversion runs in the
    /// background on the cluster, so give it a moment before cloning them.
    pub async fn distribute(&self) -> Result<Vec<Vm>> {
        let ctx = &self.ctx;
        let source = self.disk_image.config(ctx).await?;
        let name = source
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Value(format!("{} has no name", self.disk_image)))?
            .to_string();
        let new_description = self.tag().append_to(description(&source));

        self.publish_disk().await?;

        let mut produced = Vec::new();
        for node in Node::list(ctx).await? {
            let vm = self.provision_on(&node, &name, &new_description).await?;
            produced.push(vm);
        }

        for vm in &produced {
            vm.set_template(ctx).await?;
        }

        info!(
            "Distributed {} template(s); conversion finishes asynchronously",
            produced.len()
        );
        Ok(produced)
    }

    /// Copy the built disk to the shared location, replacing older copies
    async fn publish_disk(&self) -> Result<()> {
        let ctx = &self.ctx;
        let ip = Node::new(&self.disk_image.node).ip(ctx).await?;
        let shared = self.image.shared_path.as_str();
        let disk = self.storage.disk_path(self.disk_image.vmid);

        info!("Copying {} to {}", disk, shared);
        RemoteCommand::new(&ip, ["rm", "-f", shared])
            .execute(ctx.shell.as_ref())
            .await?;
        RemoteCommand::new(&ip, ["cp", disk.as_str(), shared])
            .execute(ctx.shell.as_ref())
            .await?;
        Ok(())
    }

    async fn provision_on(&self, node: &Node, name: &str, description: &str) -> Result<Vm> {
        let ctx = &self.ctx;
        let vmid = Vm::next_id(ctx).await?;
        let target = Vm::new(&node.name, vmid);
        let cloned = Vm::new(&self.template.node, vmid);

        let options = CloneOptions::full()
            .name(format!("{}-{}", name, node.name))
            .description(description)
            .pool(&self.pool.name)
            .storage(&self.storage.name);
        self.template.clone_to(ctx, vmid, &options).await?.wait(ctx).await?;

        // A cloud-init drive on node-local storage makes migration fail.
        cloned
            .update_config(ctx, &ConfigDiff::new().set(CLOUDINIT_SLOT, "none"))
            .await?;
        if target.node != cloned.node {
            cloned.migrate(ctx, node).await?.wait(ctx).await?;
        }

        let ip = node.ip(ctx).await?;
        import_disk(&ip, vmid, &self.image.shared_path, &self.storage)
            .execute(ctx.shell.as_ref())
            .await?;
        target
            .update_config(
                ctx,
                &ConfigDiff::new()
                    .set(&self.storage.disk, primary_disk(&self.storage, vmid))
                    .set(CLOUDINIT_SLOT, cloudinit_drive(&self.storage))
                    .set("protection", 0),
            )
            .await?;

        info!("Prepared {}", target);
        Ok(target)
    }
}

fn description(config: &crate::pve::VmConfig) -> &str {
    config
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
}
