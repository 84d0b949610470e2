use askama::Template;
use mac_address::MacAddress;
use tracing::{info, warn};
use uuid::Uuid;
use virt::domain::Domain;
use virt::sys;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::rpc::wire::{IoTune, VirtualMachineState};
use crate::templates::{DiskAttachTemplate, DiskDetachTemplate, DomainTemplate, InterfaceTemplate};
use crate::topology::CorePair;

/// Target device the boot volume is attached under.
const BOOT_TARGET_DEVICE: &str = "vda";

/// Parse a domain UUID in either wire form (32 hex digits) or the dashed
/// canonical form.
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| AgentError::invalid_argument(format!("failed to parse uuid {value:?}: {e}")))
}

/// Wire form: lowercase hex, no dashes.
pub fn render_uuid(uuid: &Uuid) -> String {
    uuid.as_simple().to_string()
}

fn render_template<T: Template>(template: &T) -> Result<String> {
    template
        .render()
        .map_err(|e| AgentError::Internal(anyhow::Error::new(e)))
}

fn lookup_domain(conn: &virt::connect::Connect, uuid: &Uuid) -> Result<Domain> {
    Domain::lookup_by_uuid_string(conn, &render_uuid(uuid))
        .map_err(|e| AgentError::not_found(format!("failed to lookup domain: {e}")))
}

fn domain_state(domain: &Domain) -> Result<u32> {
    let (state, _reason) = domain
        .get_state()
        .map_err(|e| AgentError::Internal(anyhow::anyhow!("failed to get domain state: {e}")))?;
    Ok(state)
}

/// Device-modify flags by current state: live domains get CONFIG|LIVE,
/// cleanly shut-off domains CONFIG only, everything else CONFIG|FORCE.
fn modify_flags(state: u32) -> u32 {
    if state == sys::VIR_DOMAIN_RUNNING {
        sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG | sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE
    } else if state == sys::VIR_DOMAIN_SHUTOFF {
        sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG
    } else {
        sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG | sys::VIR_DOMAIN_DEVICE_MODIFY_FORCE
    }
}

/// Recover scheduler grants from a domain definition.
pub fn parse_vcpu_pins(xml: &str) -> Vec<CorePair> {
    let Ok(doc) = roxmltree::Document::parse(xml) else {
        return Vec::new();
    };
    doc.descendants()
        .filter(|node| node.has_tag_name("vcpupin"))
        .filter_map(|node| parse_cpuset(node.attribute("cpuset")?))
        .collect()
}

fn parse_cpuset(cpuset: &str) -> Option<CorePair> {
    let mut cores = cpuset.split(',');
    let physical: u32 = cores.next()?.trim().parse().ok()?;
    let logical: u32 = match cores.next() {
        Some(core) => core.trim().parse().ok()?,
        None => physical,
    };
    Some(CorePair {
        physical_core: physical,
        logical_core: logical,
    })
}

impl Agent {
    /// Define a new domain (not started). Pops one core pair per vCPU for
    /// pinning; a failed define returns the pairs. A non-empty
    /// `boot_device` is attached as the boot volume right away.
    pub async fn add_virtual_machine(
        &self,
        name: &str,
        vcpus: u32,
        memory_kib: u64,
        boot_device: &str,
        iotune: Option<IoTune>,
    ) -> Result<(String, String)> {
        let pins = self
            .scheduler
            .pop_core_pairs(vcpus as usize)
            .map_err(|e| AgentError::Internal(anyhow::anyhow!(e)))?;

        let xml = match render_template(&DomainTemplate {
            name,
            vcpus,
            memory_kib,
            pins: &pins,
        }) {
            Ok(xml) => xml,
            Err(e) => {
                let _ = self.scheduler.push_core_pairs(&pins);
                return Err(e);
            }
        };

        let defined = self
            .hypervisor
            .with(move |conn| {
                let domain = Domain::define_xml(conn, &xml).map_err(|e| {
                    AgentError::invalid_argument(format!("failed to define domain: {e}"))
                })?;
                let uuid = domain.get_uuid_string().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to get domain uuid: {e}"))
                })?;
                let name = domain.get_name().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to get domain name: {e}"))
                })?;
                Ok((uuid, name))
            })
            .await;

        let (uuid, name) = match defined {
            Ok(defined) => defined,
            Err(e) => {
                let _ = self.scheduler.push_core_pairs(&pins);
                return Err(e);
            }
        };
        let uuid = render_uuid(&parse_uuid(&uuid)?);
        info!("defined domain {name} ({uuid})");

        if !boot_device.is_empty() {
            self.attach_block_device(&uuid, boot_device, BOOT_TARGET_DEVICE, iotune)
                .await?;
        }

        Ok((uuid, name))
    }

    pub async fn start_virtual_machine(&self, uuid: &str) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        self.hypervisor
            .with(move |conn| {
                let domain = lookup_domain(conn, &uuid)?;
                domain.create().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to start domain: {e}"))
                })?;
                Ok(())
            })
            .await?;
        info!("started domain {}", render_uuid(&uuid));
        Ok(())
    }

    pub async fn stop_virtual_machine(&self, uuid: &str) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        self.hypervisor
            .with(move |conn| {
                let domain = lookup_domain(conn, &uuid)?;
                domain.destroy().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to stop domain: {e}"))
                })?;
                Ok(())
            })
            .await?;
        info!("stopped domain {}", render_uuid(&uuid));
        Ok(())
    }

    /// Undefine the domain and hand its pinned core pairs back to the
    /// scheduler.
    pub async fn delete_virtual_machine(&self, uuid: &str) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        let pins = self
            .hypervisor
            .with(move |conn| {
                let domain = lookup_domain(conn, &uuid)?;
                let xml = domain.get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE).map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to read domain xml: {e}"))
                })?;
                let pins = parse_vcpu_pins(&xml);
                domain.undefine().map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to undefine domain: {e}"))
                })?;
                Ok(pins)
            })
            .await?;

        if let Err(e) = self.scheduler.push_core_pairs(&pins) {
            // topology changed under us; nothing sane to return the pairs to
            warn!("failed to return core pairs: {e}");
        }
        info!("deleted domain {}", render_uuid(&uuid));
        Ok(())
    }

    pub async fn attach_block_device(
        &self,
        uuid: &str,
        source_device: &str,
        target_device: &str,
        iotune: Option<IoTune>,
    ) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        let xml = render_template(&DiskAttachTemplate {
            source_device,
            target_device,
            iotune,
        })?;
        self.modify_device(uuid, xml, DeviceOp::Attach).await?;
        info!("attached {source_device} to {}", render_uuid(&uuid));
        Ok(())
    }

    pub async fn detach_block_device(
        &self,
        uuid: &str,
        source_device: &str,
        target_device: &str,
    ) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        let xml = render_template(&DiskDetachTemplate {
            source_device,
            target_device,
        })?;
        self.modify_device(uuid, xml, DeviceOp::Detach).await?;
        info!("detached {source_device} from {}", render_uuid(&uuid));
        Ok(())
    }

    pub async fn attach_interface(
        &self,
        uuid: &str,
        bridge: &str,
        tap_name: &str,
        mac_address: &str,
        inbound_average: u64,
        outbound_average: u64,
    ) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        let xml = self.interface_xml(bridge, tap_name, mac_address, inbound_average, outbound_average)?;
        self.modify_device(uuid, xml, DeviceOp::Attach).await?;
        info!("attached {tap_name} to {}", render_uuid(&uuid));
        Ok(())
    }

    pub async fn detach_interface(
        &self,
        uuid: &str,
        bridge: &str,
        tap_name: &str,
        mac_address: &str,
        inbound_average: u64,
        outbound_average: u64,
    ) -> Result<()> {
        let uuid = parse_uuid(uuid)?;
        let xml = self.interface_xml(bridge, tap_name, mac_address, inbound_average, outbound_average)?;
        self.modify_device(uuid, xml, DeviceOp::Detach).await?;
        info!("detached {tap_name} from {}", render_uuid(&uuid));
        Ok(())
    }

    fn interface_xml(
        &self,
        bridge: &str,
        tap_name: &str,
        mac_address: &str,
        inbound_average: u64,
        outbound_average: u64,
    ) -> Result<String> {
        let mac: MacAddress = mac_address.parse().map_err(|e| {
            AgentError::invalid_argument(format!("failed to parse mac address: {e}"))
        })?;
        render_template(&InterfaceTemplate {
            bridge,
            tap_name,
            mac_address: &mac.to_string(),
            inbound_average,
            outbound_average,
        })
    }

    async fn modify_device(&self, uuid: Uuid, xml: String, op: DeviceOp) -> Result<()> {
        self.hypervisor
            .with(move |conn| {
                let domain = lookup_domain(conn, &uuid)?;
                let flags = modify_flags(domain_state(&domain)?);
                let result = match op {
                    DeviceOp::Attach => domain.attach_device_flags(&xml, flags),
                    DeviceOp::Detach => domain.detach_device_flags(&xml, flags),
                };
                result.map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to {op:?} device: {e}"))
                })?;
                Ok(())
            })
            .await
    }

    pub async fn get_virtual_machine_state(&self, uuid: &str) -> Result<u32> {
        let uuid = parse_uuid(uuid)?;
        self.hypervisor
            .with(move |conn| {
                let domain = lookup_domain(conn, &uuid)?;
                domain_state(&domain)
            })
            .await
    }

    pub async fn list_virtual_machine_state(&self) -> Result<Vec<VirtualMachineState>> {
        self.hypervisor
            .with(|conn| {
                let domains = conn.list_all_domains(0).map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to list domains: {e}"))
                })?;
                let mut states = Vec::with_capacity(domains.len());
                for domain in &domains {
                    let uuid = domain.get_uuid_string().map_err(|e| {
                        AgentError::Internal(anyhow::anyhow!("failed to get domain uuid: {e}"))
                    })?;
                    let name = domain.get_name().map_err(|e| {
                        AgentError::Internal(anyhow::anyhow!("failed to get domain name: {e}"))
                    })?;
                    states.push(VirtualMachineState {
                        uuid: render_uuid(&parse_uuid(&uuid)?),
                        name,
                        state: domain_state(domain)?,
                    });
                }
                Ok(states)
            })
            .await
    }

    /// Core pairs already granted to defined domains, read back from
    /// their vcpupin entries. Used once at bootstrap to rebuild the
    /// scheduler's accounting.
    pub async fn reserved_core_pairs(&self) -> Result<Vec<CorePair>> {
        self.hypervisor
            .with(|conn| {
                let domains = conn.list_all_domains(0).map_err(|e| {
                    AgentError::Internal(anyhow::anyhow!("failed to list domains: {e}"))
                })?;
                let mut pairs = Vec::new();
                for domain in &domains {
                    let xml = domain.get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE).map_err(|e| {
                        AgentError::Internal(anyhow::anyhow!("failed to read domain xml: {e}"))
                    })?;
                    pairs.extend(parse_vcpu_pins(&xml));
                }
                Ok(pairs)
            })
            .await
    }
}

#[derive(Debug, Clone, Copy)]
enum DeviceOp {
    Attach,
    Detach,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashed_and_undashed_uuids_parse_to_the_same_value() {
        let undashed = parse_uuid("0123456789abcdef0123456789abcdef").unwrap();
        let dashed = parse_uuid("01234567-89ab-cdef-0123-456789abcdef").unwrap();
        assert_eq!(undashed, dashed);
        assert_eq!(undashed.as_bytes(), dashed.as_bytes());
    }

    #[test]
    fn uuids_render_undashed_lowercase() {
        let uuid = parse_uuid("01234567-89AB-CDEF-0123-456789ABCDEF").unwrap();
        assert_eq!(render_uuid(&uuid), "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn uuid_round_trip() {
        let uuid = Uuid::from_bytes([
            0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
            0xaa, 0xbb,
        ]);
        assert_eq!(parse_uuid(&render_uuid(&uuid)).unwrap(), uuid);
    }

    #[test]
    fn malformed_uuids_are_invalid_argument() {
        assert!(matches!(
            parse_uuid("not-a-uuid"),
            Err(AgentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn vcpu_pins_round_trip_through_domain_xml() {
        let xml = r#"
<domain type='kvm'>
  <name>vm001</name>
  <cputune>
    <vcpupin vcpu='0' cpuset='2,10'/>
    <vcpupin vcpu='1' cpuset='3,11'/>
    <vcpupin vcpu='2' cpuset='7'/>
  </cputune>
</domain>
"#;
        let pins = parse_vcpu_pins(xml);
        assert_eq!(pins.len(), 3);
        assert_eq!(pins[0].physical_core, 2);
        assert_eq!(pins[0].logical_core, 10);
        assert_eq!(pins[2].physical_core, 7);
        assert_eq!(pins[2].logical_core, 7);
    }

    #[test]
    fn pins_are_absent_from_unpinned_domains() {
        assert!(parse_vcpu_pins("<domain><name>x</name></domain>").is_empty());
        assert!(parse_vcpu_pins("not xml at all").is_empty());
    }

    #[test]
    fn modify_flags_follow_domain_state() {
        assert_eq!(
            modify_flags(sys::VIR_DOMAIN_RUNNING),
            sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG | sys::VIR_DOMAIN_DEVICE_MODIFY_LIVE
        );
        assert_eq!(
            modify_flags(sys::VIR_DOMAIN_SHUTOFF),
            sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG
        );
        assert_eq!(
            modify_flags(sys::VIR_DOMAIN_PAUSED),
            sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG | sys::VIR_DOMAIN_DEVICE_MODIFY_FORCE
        );
    }
}
