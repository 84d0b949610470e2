use std::net::SocketAddr;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use agent::{Agent, Hypervisor};
use dhcp::DhcpServer;
use satelit::SatelitClient;
use scheduler::Scheduler;

mod agent;
mod blockdev;
mod bridge;
mod dhcp;
mod domain;
mod error;
mod helpers;
mod metadata;
mod rpc;
mod satelit;
mod scheduler;
mod secgroup;
mod setup;
mod templates;
mod topology;
mod vlan;

const RPC_PORT: u16 = 5000;
const METADATA_PORT: u16 = 80;
const HYPERVISOR_URI: &str = "qemu+tcp://127.0.0.1:16509/system";

#[derive(Parser, Debug)]
#[command(name = "teleskop", about = "compute-node agent")]
struct Config {
    /// satelit datastore endpoint
    #[arg(long, default_value = "127.0.0.1:9263", env = "TELESKOP_SATELIT")]
    satelit: String,

    /// listen interface whose IPv4 address becomes the advertised endpoint
    #[arg(long, default_value = "bond0.1000", env = "TELESKOP_INTF")]
    intf: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let config = Config::parse();

    if let Err(e) = run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let hypervisor = Hypervisor::connect(HYPERVISOR_URI)?;
    let satelit = SatelitClient::connect(&config.satelit).await?;

    nix::net::if_::if_nametoindex(config.intf.as_str())
        .with_context(|| format!("listen interface {} does not exist", config.intf))?;
    let agent_ip = helpers::interface_ipv4(&config.intf)
        .with_context(|| format!("listen interface {} has no ipv4 address", config.intf))?;
    let endpoint = format!("{agent_ip}:{RPC_PORT}");
    let hostname = nix::unistd::gethostname()
        .context("failed to read hostname")?
        .to_string_lossy()
        .into_owned();

    let nodes = topology::local_numa_nodes().context("failed to read NUMA topology")?;
    let scheduler = Scheduler::new(&nodes);

    let (conn, netlink, _) = rtnetlink::new_connection().context("failed to open rtnetlink")?;
    tokio::spawn(conn);

    let agent = Agent::new(hypervisor, satelit.clone(), scheduler, netlink);

    agent
        .setup(&hostname, &endpoint, &blockdev::initiator_iqn().await?, &nodes)
        .await
        .context("bootstrap failed")?;
    info!("registered agent {hostname} at {endpoint}");

    // bootstrap is done; only now do the servers accept traffic
    let rpc_listener = TcpListener::bind(("0.0.0.0", RPC_PORT))
        .await
        .with_context(|| format!("failed to listen on :{RPC_PORT}"))?;
    info!("agent rpc listening on :{RPC_PORT}");
    let dhcp_server = DhcpServer::new(satelit.clone())?;
    let metadata_addr = SocketAddr::from(([0, 0, 0, 0], METADATA_PORT));

    let rpc_task = tokio::spawn(rpc::serve(agent, rpc_listener));
    let dhcp_task = tokio::spawn(dhcp_server.run());
    let metadata_task = tokio::spawn(metadata::serve(satelit, metadata_addr, shutdown_signal()));

    tokio::select! {
        result = rpc_task => server_exited("rpc", result),
        result = dhcp_task => server_exited("dhcp", result),
        result = metadata_task => match result {
            // graceful shutdown drained the metadata server
            Ok(Ok(())) => {
                info!("shutting down");
                Ok(())
            }
            other => server_exited("metadata", other),
        },
    }
}

fn server_exited(
    name: &str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => bail!("{name} server exited unexpectedly"),
        Ok(Err(e)) => Err(e.context(format!("{name} server failed"))),
        Err(e) => bail!("{name} server panicked: {e}"),
    }
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
