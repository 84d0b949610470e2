use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use virt::connect::Connect;

use crate::error::{AgentError, Result};
use crate::satelit::SatelitClient;
use crate::scheduler::Scheduler;

/// Long-lived libvirt connection. Calls block on the libvirt client
/// library, so they run on the blocking pool via [`Hypervisor::with`].
pub struct Hypervisor {
    conn: Connect,
}

// virConnect is reference counted and internally locked; the libvirt API
// is documented safe to call from any thread.
unsafe impl Send for Hypervisor {}
unsafe impl Sync for Hypervisor {}

impl Hypervisor {
    pub fn connect(uri: &str) -> anyhow::Result<Arc<Self>> {
        let conn =
            Connect::open(Some(uri)).with_context(|| format!("failed to connect to {uri}"))?;
        let version = conn
            .get_lib_version()
            .context("failed to get libvirt version")?;
        info!("connected to libvirtd version {version}");
        Ok(Arc::new(Hypervisor { conn }))
    }

    /// Run a blocking libvirt operation off the async runtime.
    pub async fn with<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Connect) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let hv = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&hv.conn))
            .await
            .map_err(|e| AgentError::Internal(anyhow::anyhow!("hypervisor task failed: {e}")))?
    }
}

/// Shared state handed to the RPC handlers. Everything except the
/// scheduler is a handle to an external system of record; the agent keeps
/// no index of domains, links or chains and re-queries on every
/// operation.
pub struct Agent {
    pub hypervisor: Arc<Hypervisor>,
    pub satelit: Arc<SatelitClient>,
    pub scheduler: Scheduler,
    pub netlink: rtnetlink::Handle,
}

impl Agent {
    pub fn new(
        hypervisor: Arc<Hypervisor>,
        satelit: Arc<SatelitClient>,
        scheduler: Scheduler,
        netlink: rtnetlink::Handle,
    ) -> Arc<Self> {
        Arc::new(Agent {
            hypervisor,
            satelit,
            scheduler,
            netlink,
        })
    }
}
