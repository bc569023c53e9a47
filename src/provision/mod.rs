//! Template provisioning
//!
//! Builds the golden template VM and fans it out to every cluster node.

mod builder;
mod distributor;
mod ownership;

pub use builder::TemplateBuilder;
pub use distributor::TemplateDistributor;
pub use ownership::OwnershipTag;

use crate::config::StorageConfig;
use crate::remote::RemoteCommand;

/// Volume id of the first disk imported into `vmid`, with drive options
fn primary_disk(storage: &StorageConfig, vmid: u32) -> String {
    let mut spec = format!(
        "{}:{}/vm-{}-disk-0.{}",
        storage.name, vmid, vmid, storage.format
    );
    if !storage.options.is_empty() {
        spec.push(',');
        spec.push_str(&storage.options);
    }
    spec
}

/// `qm importdisk` run on the node that owns `vmid`
fn import_disk(node_ip: &str, vmid: u32, image: &str, storage: &StorageConfig) -> RemoteCommand {
    RemoteCommand::new(
        node_ip,
        [
            "qm".to_string(),
            "importdisk".to_string(),
            vmid.to_string(),
            image.to_string(),
            storage.name.clone(),
            "--format".to_string(),
            storage.format.clone(),
        ],
    )
}

/// Cloud-init drive allocated on the primary storage
fn cloudinit_drive(storage: &StorageConfig) -> String {
    format!("{}:cloudinit", storage.name)
}
