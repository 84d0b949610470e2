use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::rpc::wire::{read_frame, write_frame};
use crate::topology::NumaNode;

/// Desired bridge state owned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub name: String,
    pub metadata_cidr: String,
    pub internal_only: bool,
    pub vlan_id: u16,
    pub parent_interface: String,
}

/// Lease registry entry for one guest MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpLease {
    pub ip: String,
    pub network_cidr: String,
    pub gateway: Option<String>,
    pub dns_server: Option<String>,
    pub metadata_server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum DatastoreRequest {
    ListBridge,
    RegisterTeleskopAgent {
        hostname: String,
        endpoint: String,
        iqn: String,
        nodes: Vec<NumaNode>,
    },
    GetDhcpLease {
        mac_address: String,
    },
    GetHostnameByAddress {
        address: String,
    },
    GetAuthorizedKeysByAddress {
        address: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum DatastoreResponse {
    Bridges(Vec<BridgeConfig>),
    Registered,
    DhcpLease(DhcpLease),
    Hostname(String),
    AuthorizedKeys(Vec<String>),
    Error(String),
}

/// Client for the satelit datastore. One connection, one in-flight
/// request at a time; a failed exchange drops the connection and the next
/// call redials.
pub struct SatelitClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

async fn exchange(
    stream: &mut TcpStream,
    request: &DatastoreRequest,
) -> anyhow::Result<DatastoreResponse> {
    write_frame(stream, request).await?;
    read_frame(stream)
        .await?
        .context("datastore closed the connection")
}

impl SatelitClient {
    /// Dial the datastore. Startup fails if the first dial does.
    pub async fn connect(addr: &str) -> anyhow::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to dial datastore at {addr}"))?;
        Ok(Arc::new(SatelitClient {
            addr: addr.to_string(),
            conn: Mutex::new(Some(stream)),
        }))
    }

    async fn call(&self, request: &DatastoreRequest) -> anyhow::Result<DatastoreResponse> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    warn!("failed to redial datastore at {}: {e}", self.addr);
                    return Err(e).context("failed to redial datastore");
                }
            }
        }
        let result = exchange(guard.as_mut().unwrap(), request).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                // stale stream; the next call redials
                *guard = None;
                return Err(e);
            }
        };

        match response {
            DatastoreResponse::Error(message) => bail!("datastore error: {message}"),
            other => Ok(other),
        }
    }

    pub async fn list_bridge(&self) -> anyhow::Result<Vec<BridgeConfig>> {
        match self.call(&DatastoreRequest::ListBridge).await? {
            DatastoreResponse::Bridges(bridges) => Ok(bridges),
            other => bail!("unexpected ListBridge response: {other:?}"),
        }
    }

    pub async fn register_teleskop_agent(
        &self,
        hostname: &str,
        endpoint: &str,
        iqn: &str,
        nodes: &[NumaNode],
    ) -> anyhow::Result<()> {
        let request = DatastoreRequest::RegisterTeleskopAgent {
            hostname: hostname.to_string(),
            endpoint: endpoint.to_string(),
            iqn: iqn.to_string(),
            nodes: nodes.to_vec(),
        };
        match self.call(&request).await? {
            DatastoreResponse::Registered => Ok(()),
            other => bail!("unexpected RegisterTeleskopAgent response: {other:?}"),
        }
    }

    pub async fn get_dhcp_lease(&self, mac_address: &str) -> anyhow::Result<DhcpLease> {
        let request = DatastoreRequest::GetDhcpLease {
            mac_address: mac_address.to_string(),
        };
        match self.call(&request).await? {
            DatastoreResponse::DhcpLease(lease) => Ok(lease),
            other => bail!("unexpected GetDHCPLease response: {other:?}"),
        }
    }

    pub async fn get_hostname_by_address(&self, address: &str) -> anyhow::Result<String> {
        let request = DatastoreRequest::GetHostnameByAddress {
            address: address.to_string(),
        };
        match self.call(&request).await? {
            DatastoreResponse::Hostname(hostname) => Ok(hostname),
            other => bail!("unexpected GetHostnameByAddress response: {other:?}"),
        }
    }

    pub async fn get_authorized_keys_by_address(
        &self,
        address: &str,
    ) -> anyhow::Result<Vec<String>> {
        let request = DatastoreRequest::GetAuthorizedKeysByAddress {
            address: address.to_string(),
        };
        match self.call(&request).await? {
            DatastoreResponse::AuthorizedKeys(keys) => Ok(keys),
            other => bail!("unexpected GetAuthorizedKeysByAddress response: {other:?}"),
        }
    }
}
