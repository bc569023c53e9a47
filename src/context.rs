//! Shared handles for talking to the cluster

use std::sync::Arc;

use crate::pve::PveApi;
use crate::remote::CommandRunner;
use crate::utils::Poller;

/// Everything a resource handle or orchestrator needs to reach the cluster.
///
/// Built once at startup and passed to every component.
#[derive(Clone)]
pub struct Context {
    pub api: Arc<dyn PveApi>,
    pub shell: Arc<dyn CommandRunner>,
    pub poller: Poller,
}

impl Context {
    pub fn new(api: Arc<dyn PveApi>, shell: Arc<dyn CommandRunner>, poller: Poller) -> Self {
        Self { api, shell, poller }
    }
}
