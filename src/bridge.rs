use std::net::IpAddr;

use askama::Template;
use futures_util::TryStreamExt;
use ipnetwork::Ipv4Network;
use tracing::{info, warn};
use virt::network::Network;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::templates::NetworkTemplate;

fn is_already_exists(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -libc::EEXIST)
}

impl Agent {
    /// Index of a kernel link, or `NotFound`.
    pub(crate) async fn link_index(&self, name: &str) -> Result<u32> {
        let link = self
            .netlink
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|e| AgentError::not_found(format!("failed to find link {name}: {e}")))?
            .ok_or_else(|| AgentError::not_found(format!("failed to find link {name}")))?;
        Ok(link.header.index)
    }

    /// Define and start the libvirt network backing a bridge, then wire up
    /// the `{name}-dhcp ↔ dhcp-{name}` veth pair that carries DHCP and
    /// metadata traffic for non-internal bridges.
    ///
    /// Idempotent: every sub-step checks for existing state, so a retry
    /// after a partial failure finishes the remaining steps.
    pub async fn add_bridge(
        &self,
        name: &str,
        metadata_cidr: &str,
        internal_only: bool,
    ) -> Result<()> {
        let xml = NetworkTemplate { name }
            .render()
            .map_err(|e| AgentError::Internal(anyhow::Error::new(e)))?;

        let network_name = name.to_string();
        self.hypervisor
            .with(move |conn| {
                if Network::lookup_by_name(conn, &network_name).is_ok() {
                    return Ok(());
                }
                let network = Network::define_xml(conn, &xml).map_err(|e| {
                    AgentError::invalid_argument(format!("failed to define network: {e}"))
                })?;
                network.create().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to start network: {e}"))
                })?;
                info!("started network {network_name}");
                Ok(())
            })
            .await?;

        if internal_only {
            return Ok(());
        }
        self.ensure_dhcp_veth(name, metadata_cidr).await
    }

    async fn ensure_dhcp_veth(&self, name: &str, metadata_cidr: &str) -> Result<()> {
        let cidr: Ipv4Network = metadata_cidr
            .parse()
            .map_err(|e| AgentError::invalid_argument(format!("bad metadata cidr: {e}")))?;

        let bridge_end = format!("{name}-dhcp");
        let agent_end = format!("dhcp-{name}");

        if self.link_index(&agent_end).await.is_err() {
            self.netlink
                .link()
                .add()
                .veth(agent_end.clone(), bridge_end.clone())
                .execute()
                .await
                .map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to create veth pair: {e}"))
                })?;
        }

        let bridge_index = self.link_index(name).await?;
        let bridge_end_index = self.link_index(&bridge_end).await?;
        let agent_end_index = self.link_index(&agent_end).await?;

        self.netlink
            .link()
            .set(bridge_end_index)
            .master(bridge_index)
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!("failed to enslave {bridge_end}: {e}"))
            })?;

        match self
            .netlink
            .address()
            .add(agent_end_index, IpAddr::V4(cidr.ip()), cidr.prefix())
            .execute()
            .await
        {
            Ok(()) => {}
            Err(e) if is_already_exists(&e) => {}
            Err(e) => {
                return Err(AgentError::Internal(anyhow::anyhow!(
                    "failed to address {agent_end}: {e}"
                )))
            }
        }

        for index in [bridge_end_index, agent_end_index] {
            self.netlink
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to bring veth up: {e}"))
                })?;
        }

        Ok(())
    }

    /// Stop and undefine the network, then tear down the veth pair.
    /// A missing network succeeds silently; veth teardown is best-effort.
    pub async fn delete_bridge(&self, name: &str) -> Result<()> {
        let network_name = name.to_string();
        self.hypervisor
            .with(move |conn| {
                let network = match Network::lookup_by_name(conn, &network_name) {
                    Ok(network) => network,
                    Err(_) => return Ok(()),
                };
                if let Err(e) = network.destroy() {
                    // already stopped; undefine still applies
                    warn!("failed to stop network {network_name}: {e}");
                }
                network.undefine().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to undefine network: {e}"))
                })?;
                info!("removed network {network_name}");
                Ok(())
            })
            .await?;

        let bridge_end = format!("{name}-dhcp");
        let agent_end = format!("dhcp-{name}");
        let (Ok(bridge_end_index), Ok(agent_end_index)) = (
            self.link_index(&bridge_end).await,
            self.link_index(&agent_end).await,
        ) else {
            return Ok(());
        };

        for index in [bridge_end_index, agent_end_index] {
            if let Err(e) = self.netlink.link().set(index).down().execute().await {
                warn!("failed to bring veth end down: {e}");
            }
        }

        self.flush_ipv4_addresses(agent_end_index).await;

        if let Err(e) = self
            .netlink
            .link()
            .set(bridge_end_index)
            .nomaster()
            .execute()
            .await
        {
            warn!("failed to detach {bridge_end} from {name}: {e}");
        }

        // deleting one end removes the pair
        self.netlink
            .link()
            .del(bridge_end_index)
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!("failed to delete veth pair: {e}"))
            })?;

        Ok(())
    }

    async fn flush_ipv4_addresses(&self, index: u32) {
        let mut addresses = self
            .netlink
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        loop {
            match addresses.try_next().await {
                Ok(Some(message)) => {
                    if message.header.family != netlink_packet_route::AddressFamily::Inet {
                        continue;
                    }
                    if let Err(e) = self.netlink.address().del(message).execute().await {
                        warn!("failed to delete address from link {index}: {e}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to list addresses on link {index}: {e}");
                    break;
                }
            }
        }
    }

    /// Enslave a link to a bridge. Re-enslaving to the same bridge is a
    /// kernel no-op.
    pub async fn add_interface_to_bridge(&self, bridge: &str, interface: &str) -> Result<()> {
        let bridge_index = self.link_index(bridge).await?;
        let interface_index = self.link_index(interface).await?;
        self.netlink
            .link()
            .set(interface_index)
            .master(bridge_index)
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!(
                    "failed to add {interface} to {bridge}: {e}"
                ))
            })
    }

    pub async fn delete_interface_from_bridge(&self, interface: &str) -> Result<()> {
        let interface_index = self.link_index(interface).await?;
        self.netlink
            .link()
            .set(interface_index)
            .nomaster()
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!(
                    "failed to remove {interface} from its bridge: {e}"
                ))
            })
    }
}
