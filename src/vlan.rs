use crate::agent::Agent;
use crate::error::{AgentError, Result};

/// Kernel name of an 802.1Q sub-interface.
pub fn vlan_name(parent: &str, vlan_id: u16) -> String {
    format!("{parent}.{vlan_id}")
}

impl Agent {
    /// Create `{parent}.{vlan_id}` and bring it up. The sub-interface's
    /// lifetime follows the bridge that enslaves it.
    pub async fn add_vlan_interface(&self, parent: &str, vlan_id: u16) -> Result<()> {
        let parent_index = self.link_index(parent).await?;
        let name = vlan_name(parent, vlan_id);

        match self
            .netlink
            .link()
            .add()
            .vlan(name.clone(), parent_index, vlan_id)
            .execute()
            .await
        {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {}
            Err(e) => {
                return Err(AgentError::Internal(anyhow::anyhow!(
                    "failed to create vlan interface {name}: {e}"
                )))
            }
        }

        let index = self.link_index(&name).await?;
        self.netlink
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!("failed to set up vlan interface: {e}"))
            })
    }

    pub async fn delete_vlan_interface(&self, parent: &str, vlan_id: u16) -> Result<()> {
        let name = vlan_name(parent, vlan_id);
        let index = self.link_index(&name).await?;

        self.netlink
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!("failed to set down vlan interface: {e}"))
            })?;
        self.netlink
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| {
                AgentError::Internal(anyhow::anyhow!("failed to delete vlan interface: {e}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_names_follow_the_parent() {
        assert_eq!(vlan_name("bond0", 1000), "bond0.1000");
        assert_eq!(vlan_name("eth1", 2), "eth1.2");
    }
}
