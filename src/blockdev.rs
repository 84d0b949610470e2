use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::Result;

const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
const DEFAULT_ISCSI_PORT: u16 = 3260;
const DEVICE_WAIT_ATTEMPTS: u32 = 20;
const DEVICE_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// The host initiator IQN, registered with the control plane so it can
/// export LUNs to this host.
pub async fn initiator_iqn() -> Result<String> {
    let content = fs::read_to_string(INITIATOR_NAME_FILE)
        .await
        .with_context(|| format!("failed to read {INITIATOR_NAME_FILE}"))?;
    parse_initiator_name(&content).map_err(Into::into)
}

fn parse_initiator_name(content: &str) -> anyhow::Result<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|iqn| iqn.trim().to_string())
        .ok_or_else(|| anyhow!("no InitiatorName in {INITIATOR_NAME_FILE}"))
}

/// Log in to the LUN and return the host block-device path. One portal
/// means a plain session; two or more mean a session per portal merged by
/// the multipath driver. No agent-side bookkeeping: the returned path is
/// the key the caller hands back on disconnect.
pub async fn connect_volume(portals: &[String], host_lun_id: u32) -> Result<String> {
    match portals {
        [] => Err(crate::error::AgentError::invalid_argument(
            "no portal addresses",
        )),
        [portal] => Ok(connect_single_path(portal, host_lun_id).await?),
        portals => Ok(connect_multipath(portals, host_lun_id).await?),
    }
}

pub async fn disconnect_volume(portals: &[String], host_lun_id: u32) -> Result<()> {
    match portals {
        [] => Err(crate::error::AgentError::invalid_argument(
            "no portal addresses",
        )),
        [portal] => Ok(disconnect_single_path(portal, host_lun_id).await?),
        portals => Ok(disconnect_multipath(portals, host_lun_id).await?),
    }
}

async fn connect_single_path(portal: &str, host_lun_id: u32) -> anyhow::Result<String> {
    let portal = normalize_portal(portal);
    let target = discover_target(&portal).await?;
    login(&portal, &target).await?;
    let device = wait_for_device(&lun_path(&portal, &target, host_lun_id)).await?;
    info!("connected {target} lun {host_lun_id} as {}", device.display());
    Ok(device.display().to_string())
}

async fn connect_multipath(portals: &[String], host_lun_id: u32) -> anyhow::Result<String> {
    let mut first_leg = None;
    for portal in portals {
        let portal = normalize_portal(portal);
        let target = discover_target(&portal).await?;
        login(&portal, &target).await?;
        let device = wait_for_device(&lun_path(&portal, &target, host_lun_id)).await?;
        first_leg.get_or_insert(device);
    }

    let leg = first_leg.expect("at least two portals");
    let wwid = scsi_id(&leg).await?;
    let device = wait_for_device(Path::new(&format!("/dev/disk/by-id/dm-uuid-mpath-{wwid}")))
        .await
        .context("multipath device did not appear")?;
    info!(
        "connected multipath lun {host_lun_id} ({wwid}) as {}",
        device.display()
    );
    Ok(device.display().to_string())
}

async fn disconnect_single_path(portal: &str, host_lun_id: u32) -> anyhow::Result<()> {
    let portal = normalize_portal(portal);
    let target = discover_target(&portal).await?;
    logout(&portal, &target).await?;
    info!("disconnected {target} lun {host_lun_id}");
    Ok(())
}

async fn disconnect_multipath(portals: &[String], host_lun_id: u32) -> anyhow::Result<()> {
    // flush the multipath map before tearing down its legs
    let first = normalize_portal(&portals[0]);
    let target = discover_target(&first).await?;
    match fs::canonicalize(lun_path(&first, &target, host_lun_id)).await {
        Ok(leg) => {
            let wwid = scsi_id(&leg).await?;
            if let Err(e) = run("multipath", &["-f", &wwid]).await {
                warn!("failed to flush multipath map {wwid}: {e}");
            }
        }
        Err(e) => warn!("multipath leg already gone: {e}"),
    }

    for portal in portals {
        let portal = normalize_portal(portal);
        let target = discover_target(&portal).await?;
        logout(&portal, &target).await?;
    }
    info!("disconnected multipath lun {host_lun_id}");
    Ok(())
}

async fn discover_target(portal: &str) -> anyhow::Result<String> {
    let output = run(
        "iscsiadm",
        &["-m", "discovery", "-t", "sendtargets", "-p", portal],
    )
    .await?;
    parse_sendtargets(&output, portal)
}

async fn login(portal: &str, target: &str) -> anyhow::Result<()> {
    run(
        "iscsiadm",
        &["-m", "node", "-T", target, "-p", portal, "--login"],
    )
    .await
    .map(|_| ())
    .or_else(|e| {
        // session may already be up from an earlier attempt
        if e.to_string().contains("already present") {
            Ok(())
        } else {
            Err(e)
        }
    })
}

async fn logout(portal: &str, target: &str) -> anyhow::Result<()> {
    run(
        "iscsiadm",
        &["-m", "node", "-T", target, "-p", portal, "--logout"],
    )
    .await?;
    run(
        "iscsiadm",
        &["-m", "node", "-o", "delete", "-T", target, "-p", portal],
    )
    .await?;
    Ok(())
}

async fn scsi_id(device: &Path) -> anyhow::Result<String> {
    let path = device.display().to_string();
    let output = run("/lib/udev/scsi_id", &["-g", "-u", &path]).await?;
    let wwid = output.trim();
    if wwid.is_empty() {
        bail!("no wwid for {path}");
    }
    Ok(wwid.to_string())
}

fn normalize_portal(portal: &str) -> String {
    if portal.contains(':') {
        portal.to_string()
    } else {
        format!("{portal}:{DEFAULT_ISCSI_PORT}")
    }
}

fn lun_path(portal: &str, target: &str, host_lun_id: u32) -> PathBuf {
    PathBuf::from(format!(
        "/dev/disk/by-path/ip-{portal}-iscsi-{target}-lun-{host_lun_id}"
    ))
}

/// First target advertised for the given portal.
fn parse_sendtargets(output: &str, portal: &str) -> anyhow::Result<String> {
    let host = portal.split(':').next().unwrap_or(portal);
    output
        .lines()
        .filter_map(|line| {
            let (address, target) = line.trim().split_once(' ')?;
            address
                .starts_with(host)
                .then(|| target.trim().to_string())
        })
        .next()
        .ok_or_else(|| anyhow!("no target advertised by {portal}"))
}

async fn wait_for_device(path: &Path) -> anyhow::Result<PathBuf> {
    for _ in 0..DEVICE_WAIT_ATTEMPTS {
        if let Ok(resolved) = fs::canonicalize(path).await {
            return Ok(resolved);
        }
        tokio::time::sleep(DEVICE_WAIT_INTERVAL).await;
    }
    bail!("device {} did not appear", path.display())
}

async fn run(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_name_is_extracted() {
        let content = "## DO NOT EDIT OR REMOVE THIS FILE!\nInitiatorName=iqn.1993-08.org.debian:01:abcdef012345\n";
        assert_eq!(
            parse_initiator_name(content).unwrap(),
            "iqn.1993-08.org.debian:01:abcdef012345"
        );
    }

    #[test]
    fn missing_initiator_name_is_an_error() {
        assert!(parse_initiator_name("# nothing here\n").is_err());
    }

    #[test]
    fn sendtargets_output_is_matched_by_portal() {
        let output = "\
10.0.1.5:3260,1 iqn.2020-04.cloud.example:storage01
10.0.2.5:3260,1 iqn.2020-04.cloud.example:storage02
";
        assert_eq!(
            parse_sendtargets(output, "10.0.2.5:3260").unwrap(),
            "iqn.2020-04.cloud.example:storage02"
        );
        assert!(parse_sendtargets(output, "10.9.9.9:3260").is_err());
    }

    #[test]
    fn portals_default_to_the_iscsi_port() {
        assert_eq!(normalize_portal("10.0.1.5"), "10.0.1.5:3260");
        assert_eq!(normalize_portal("10.0.1.5:3261"), "10.0.1.5:3261");
    }

    #[test]
    fn lun_paths_follow_the_udev_layout() {
        assert_eq!(
            lun_path("10.0.1.5:3260", "iqn.2020-04.cloud.example:storage01", 3),
            PathBuf::from(
                "/dev/disk/by-path/ip-10.0.1.5:3260-iscsi-iqn.2020-04.cloud.example:storage01-lun-3"
            )
        );
    }
}
