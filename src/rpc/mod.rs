use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mac_address::MacAddress;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::{blockdev, secgroup};

use wire::{Call, Reply, RequestEnvelope, ResponseEnvelope, Status};

pub mod wire;

/// Accept loop for the agent surface. Each connection gets its own task;
/// each request within a connection is served concurrently, so callers
/// that need ordering must serialize their own dependent calls.
pub async fn serve(agent: Arc<Agent>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_connection(agent.clone(), stream, peer));
    }
}

async fn handle_connection(agent: Arc<Agent>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let envelope: RequestEnvelope = match wire::read_frame(&mut reader).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(e) => {
                warn!("rpc connection from {peer} failed: {e:#}");
                break;
            }
        };

        let agent = agent.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let response = process(&agent, envelope).await;
            let mut writer = writer.lock().await;
            if let Err(e) = wire::write_frame(&mut *writer, &response).await {
                warn!("failed to respond to {peer}: {e:#}");
            }
        });
    }
}

async fn process(agent: &Agent, envelope: RequestEnvelope) -> ResponseEnvelope {
    let method = envelope.call.name();

    let handler = dispatch(agent, envelope.call);
    let result = match envelope.deadline_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), handler).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::internal("deadline exceeded")),
        },
        None => handler.await,
    };

    match &result {
        Ok(_) => debug!("{method} ok"),
        Err(e) => warn!("{method} failed: {e}"),
    }

    ResponseEnvelope {
        id: envelope.id,
        result: result.map_err(|e| Status {
            code: e.code(),
            message: e.to_string(),
        }),
    }
}

fn parse_ipv4(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|e| AgentError::invalid_argument(format!("failed to parse ip address: {e}")))
}

fn parse_mac(value: &str) -> Result<MacAddress> {
    value
        .parse()
        .map_err(|e| AgentError::invalid_argument(format!("failed to parse mac address: {e}")))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AgentError::Internal(anyhow::anyhow!("filter task failed: {e}")))?
}

async fn dispatch(agent: &Agent, call: Call) -> Result<Reply> {
    match call {
        Call::AddVirtualMachine {
            name,
            vcpus,
            memory_kib,
            boot_device,
            iotune,
        } => {
            let (uuid, name) = agent
                .add_virtual_machine(&name, vcpus, memory_kib, &boot_device, iotune)
                .await?;
            Ok(Reply::VirtualMachine { uuid, name })
        }
        Call::StartVirtualMachine { uuid } => {
            agent.start_virtual_machine(&uuid).await?;
            Ok(Reply::Empty)
        }
        Call::StopVirtualMachine { uuid } => {
            agent.stop_virtual_machine(&uuid).await?;
            Ok(Reply::Empty)
        }
        Call::DeleteVirtualMachine { uuid } => {
            agent.delete_virtual_machine(&uuid).await?;
            Ok(Reply::Empty)
        }
        Call::AttachBlockDevice {
            uuid,
            source_device,
            target_device,
            iotune,
        } => {
            agent
                .attach_block_device(&uuid, &source_device, &target_device, iotune)
                .await?;
            Ok(Reply::Empty)
        }
        Call::DetachBlockDevice {
            uuid,
            source_device,
            target_device,
        } => {
            agent
                .detach_block_device(&uuid, &source_device, &target_device)
                .await?;
            Ok(Reply::Empty)
        }
        Call::AttachInterface {
            uuid,
            bridge,
            tap_name,
            mac_address,
            inbound_average,
            outbound_average,
        } => {
            agent
                .attach_interface(
                    &uuid,
                    &bridge,
                    &tap_name,
                    &mac_address,
                    inbound_average,
                    outbound_average,
                )
                .await?;
            Ok(Reply::Empty)
        }
        Call::DetachInterface {
            uuid,
            bridge,
            tap_name,
            mac_address,
            inbound_average,
            outbound_average,
        } => {
            agent
                .detach_interface(
                    &uuid,
                    &bridge,
                    &tap_name,
                    &mac_address,
                    inbound_average,
                    outbound_average,
                )
                .await?;
            Ok(Reply::Empty)
        }
        Call::GetVirtualMachineState { uuid } => {
            let state = agent.get_virtual_machine_state(&uuid).await?;
            Ok(Reply::VirtualMachineState { state })
        }
        Call::ListVirtualMachineState => {
            let states = agent.list_virtual_machine_state().await?;
            Ok(Reply::VirtualMachineStates(states))
        }
        Call::AddBridge {
            name,
            metadata_cidr,
            internal_only,
        } => {
            agent
                .add_bridge(&name, &metadata_cidr, internal_only)
                .await?;
            Ok(Reply::Empty)
        }
        Call::DeleteBridge { name } => {
            agent.delete_bridge(&name).await?;
            Ok(Reply::Empty)
        }
        Call::AddVlanInterface {
            parent_interface,
            vlan_id,
        } => {
            agent.add_vlan_interface(&parent_interface, vlan_id).await?;
            Ok(Reply::Empty)
        }
        Call::DeleteVlanInterface {
            parent_interface,
            vlan_id,
        } => {
            agent
                .delete_vlan_interface(&parent_interface, vlan_id)
                .await?;
            Ok(Reply::Empty)
        }
        Call::AddInterfaceToBridge { bridge, interface } => {
            agent.add_interface_to_bridge(&bridge, &interface).await?;
            Ok(Reply::Empty)
        }
        Call::DeleteInterfaceFromBridge {
            bridge: _,
            interface,
        } => {
            agent.delete_interface_from_bridge(&interface).await?;
            Ok(Reply::Empty)
        }
        Call::ConnectBlockDevice {
            portal_addresses,
            host_lun_id,
        } => {
            let device_name = blockdev::connect_volume(&portal_addresses, host_lun_id).await?;
            Ok(Reply::BlockDevice { device_name })
        }
        Call::DisconnectBlockDevice {
            portal_addresses,
            host_lun_id,
        } => {
            blockdev::disconnect_volume(&portal_addresses, host_lun_id).await?;
            Ok(Reply::Empty)
        }
        Call::SetupDefaultSecurityGroup => {
            run_blocking(secgroup::setup_default_security_group).await?;
            Ok(Reply::Empty)
        }
        Call::AddSecurityGroup {
            interface,
            ip_address,
            mac_address,
        } => {
            let ip = parse_ipv4(&ip_address)?;
            let mac = parse_mac(&mac_address)?;
            run_blocking(move || secgroup::add_security_group(&interface, ip, mac)).await?;
            Ok(Reply::Empty)
        }
        Call::GetIscsiQualifiedName => Ok(Reply::Iqn {
            iqn: blockdev::initiator_iqn().await?,
        }),
    }
}
