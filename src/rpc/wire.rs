use anyhow::{bail, Context};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; nothing the agent exchanges comes close.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Per-disk I/O limits. A zero field means "no limit" and is never
/// rendered into domain XML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoTune {
    pub read_bytes_sec: u64,
    pub write_bytes_sec: u64,
    pub read_iops_sec: u64,
    pub write_iops_sec: u64,
}

impl IoTune {
    pub fn any_positive(&self) -> bool {
        self.read_bytes_sec > 0
            || self.write_bytes_sec > 0
            || self.read_iops_sec > 0
            || self.write_iops_sec > 0
    }
}

/// One request frame. `deadline_ms` bounds the whole call; sub-steps
/// started before expiry are not rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub deadline_ms: Option<u64>,
    pub call: Call,
}

/// The agent's closed operation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    AddVirtualMachine {
        name: String,
        vcpus: u32,
        memory_kib: u64,
        boot_device: String,
        iotune: Option<IoTune>,
    },
    StartVirtualMachine {
        uuid: String,
    },
    StopVirtualMachine {
        uuid: String,
    },
    DeleteVirtualMachine {
        uuid: String,
    },
    AttachBlockDevice {
        uuid: String,
        source_device: String,
        target_device: String,
        iotune: Option<IoTune>,
    },
    DetachBlockDevice {
        uuid: String,
        source_device: String,
        target_device: String,
    },
    AttachInterface {
        uuid: String,
        bridge: String,
        tap_name: String,
        mac_address: String,
        inbound_average: u64,
        outbound_average: u64,
    },
    DetachInterface {
        uuid: String,
        bridge: String,
        tap_name: String,
        mac_address: String,
        inbound_average: u64,
        outbound_average: u64,
    },
    GetVirtualMachineState {
        uuid: String,
    },
    ListVirtualMachineState,
    AddBridge {
        name: String,
        metadata_cidr: String,
        internal_only: bool,
    },
    DeleteBridge {
        name: String,
    },
    AddVlanInterface {
        parent_interface: String,
        vlan_id: u16,
    },
    DeleteVlanInterface {
        parent_interface: String,
        vlan_id: u16,
    },
    AddInterfaceToBridge {
        bridge: String,
        interface: String,
    },
    DeleteInterfaceFromBridge {
        bridge: String,
        interface: String,
    },
    ConnectBlockDevice {
        portal_addresses: Vec<String>,
        host_lun_id: u32,
    },
    DisconnectBlockDevice {
        portal_addresses: Vec<String>,
        host_lun_id: u32,
    },
    SetupDefaultSecurityGroup,
    AddSecurityGroup {
        interface: String,
        ip_address: String,
        mac_address: String,
    },
    GetIscsiQualifiedName,
}

impl Call {
    /// Method name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Call::AddVirtualMachine { .. } => "AddVirtualMachine",
            Call::StartVirtualMachine { .. } => "StartVirtualMachine",
            Call::StopVirtualMachine { .. } => "StopVirtualMachine",
            Call::DeleteVirtualMachine { .. } => "DeleteVirtualMachine",
            Call::AttachBlockDevice { .. } => "AttachBlockDevice",
            Call::DetachBlockDevice { .. } => "DetachBlockDevice",
            Call::AttachInterface { .. } => "AttachInterface",
            Call::DetachInterface { .. } => "DetachInterface",
            Call::GetVirtualMachineState { .. } => "GetVirtualMachineState",
            Call::ListVirtualMachineState => "ListVirtualMachineState",
            Call::AddBridge { .. } => "AddBridge",
            Call::DeleteBridge { .. } => "DeleteBridge",
            Call::AddVlanInterface { .. } => "AddVLANInterface",
            Call::DeleteVlanInterface { .. } => "DeleteVLANInterface",
            Call::AddInterfaceToBridge { .. } => "AddInterfaceToBridge",
            Call::DeleteInterfaceFromBridge { .. } => "DeleteInterfaceFromBridge",
            Call::ConnectBlockDevice { .. } => "ConnectBlockDevice",
            Call::DisconnectBlockDevice { .. } => "DisconnectBlockDevice",
            Call::SetupDefaultSecurityGroup => "SetupDefaultSecurityGroup",
            Call::AddSecurityGroup { .. } => "AddSecurityGroup",
            Call::GetIscsiQualifiedName => "GetISCSIQualifiedName",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub result: Result<Reply, Status>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Empty,
    VirtualMachine {
        uuid: String,
        name: String,
    },
    VirtualMachineState {
        state: u32,
    },
    VirtualMachineStates(Vec<VirtualMachineState>),
    BlockDevice {
        device_name: String,
    },
    Iqn {
        iqn: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachineState {
    pub uuid: String,
    pub name: String,
    pub state: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Write one length-prefixed bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .context("failed to encode frame")?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("frame too large: {} bytes", payload.len());
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the connection
/// cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("frame too large: {} bytes", len);
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;
    let (message, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .context("failed to decode frame")?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn envelope_round_trips_through_the_codec() {
        let request = RequestEnvelope {
            id: 7,
            deadline_ms: Some(30_000),
            call: Call::AddSecurityGroup {
                interface: "tap001".to_string(),
                ip_address: "10.0.0.1".to_string(),
                mac_address: "52:54:00:00:00:01".to_string(),
            },
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: RequestEnvelope = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.deadline_ms, Some(30_000));
        assert_eq!(decoded.call.name(), "AddSecurityGroup");

        // nothing further on the stream
        let next: Option<RequestEnvelope> = read_frame(&mut cursor).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        tokio::io::AsyncWriteExt::write_u32(&mut buf, MAX_FRAME_LEN + 1)
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let res: anyhow::Result<Option<RequestEnvelope>> = read_frame(&mut cursor).await;
        assert!(res.is_err());
    }
}
