use anyhow::Context;
use tracing::info;

use crate::agent::Agent;
use crate::secgroup;
use crate::topology::NumaNode;
use crate::vlan::vlan_name;

impl Agent {
    /// Make the host match the control plane's desired bridge set, install
    /// the default packet-filter hierarchy, rebuild scheduler accounting
    /// from defined domains, and register this agent. Runs to completion
    /// before any server accepts traffic.
    pub async fn setup(
        &self,
        hostname: &str,
        endpoint: &str,
        iqn: &str,
        nodes: &[NumaNode],
    ) -> anyhow::Result<()> {
        let bridges = self
            .satelit
            .list_bridge()
            .await
            .context("failed to list bridges")?;

        for bridge in &bridges {
            self.add_bridge(&bridge.name, &bridge.metadata_cidr, bridge.internal_only)
                .await
                .with_context(|| format!("failed to add bridge {}", bridge.name))?;
            if bridge.internal_only {
                continue;
            }
            self.add_vlan_interface(&bridge.parent_interface, bridge.vlan_id)
                .await
                .with_context(|| {
                    format!(
                        "failed to add vlan {}",
                        vlan_name(&bridge.parent_interface, bridge.vlan_id)
                    )
                })?;
            self.add_interface_to_bridge(
                &bridge.name,
                &vlan_name(&bridge.parent_interface, bridge.vlan_id),
            )
            .await
            .with_context(|| format!("failed to enslave vlan to {}", bridge.name))?;
        }
        info!("reconciled {} bridges", bridges.len());

        tokio::task::spawn_blocking(secgroup::setup_default_security_group)
            .await
            .context("filter setup task failed")?
            .context("failed to set up default security group")?;

        let reserved = self
            .reserved_core_pairs()
            .await
            .context("failed to read core pairs of defined domains")?;
        if !reserved.is_empty() {
            info!("reserving {} core pairs held by defined domains", reserved.len());
            self.scheduler.reserve(&reserved);
        }

        self.satelit
            .register_teleskop_agent(hostname, endpoint, iqn, nodes)
            .await
            .context("failed to register agent")?;

        Ok(())
    }
}
