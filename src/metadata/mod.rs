use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{ConnectInfo, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tracing::info;

use crate::satelit::SatelitClient;

use error::{AppResult, HttpError};

mod error;

/// Default guest account rendered into user-data; images are Ubuntu
/// based, keys come from the control plane.
const DEFAULT_USER: &str = "ubuntu";
const DEFAULT_SUDO: &str = "ALL=(ALL) NOPASSWD:ALL";
const DEFAULT_GROUPS: &str = "users, admin";

#[derive(Debug, Serialize)]
struct CloudConfig {
    manage_etc_hosts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fqdn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    users: Vec<CloudUser>,
}

#[derive(Debug, Serialize)]
struct CloudUser {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    passwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chpasswd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_passwd: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sudo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
}

/// Serve the instance metadata endpoints until `shutdown` resolves, then
/// drain in-flight responses.
pub async fn serve(
    satelit: Arc<SatelitClient>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/meta-data", get(meta_data))
        .route("/user-data", get(user_data))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(satelit))
                .layer(middleware::from_fn(log_requests)),
        );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metadata service on {addr}"))?;
    info!("metadata service listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("metadata service failed")
}

async fn log_requests(request: Request, next: Next) -> Response {
    let url = request.uri().to_string();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_default();

    let response = next.run(request).await;
    info!(
        "http request: url={url}, remote={remote}, code={}",
        response.status().as_u16()
    );
    response
}

/// Callers are identified by their TCP source address; guests always talk
/// IPv4 over the bridge veth.
fn caller_ip(remote: SocketAddr) -> AppResult<Ipv4Addr> {
    match remote.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(HttpError::BadRequest.into()),
    }
}

async fn meta_data(
    Extension(satelit): Extension<Arc<SatelitClient>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> AppResult<impl IntoResponse> {
    let ip = caller_ip(remote)?;
    let hostname = satelit.get_hostname_by_address(&ip.to_string()).await?;
    Ok(format!("hostname: {hostname}\n"))
}

async fn user_data(
    Extension(satelit): Extension<Arc<SatelitClient>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> AppResult<impl IntoResponse> {
    let ip = caller_ip(remote)?;
    let address = ip.to_string();

    let hostname = satelit.get_hostname_by_address(&address).await?;
    let keys = satelit.get_authorized_keys_by_address(&address).await?;

    Ok(render_user_data(&cloud_config(hostname, keys))?)
}

fn cloud_config(hostname: String, ssh_authorized_keys: Vec<String>) -> CloudConfig {
    CloudConfig {
        manage_etc_hosts: true,
        fqdn: Some(hostname.clone()),
        hostname: Some(hostname),
        users: vec![CloudUser {
            name: DEFAULT_USER.to_string(),
            passwd: None,
            chpasswd: None,
            lock_passwd: Some(false),
            sudo: Some(DEFAULT_SUDO.to_string()),
            groups: Some(DEFAULT_GROUPS.to_string()),
            ssh_authorized_keys,
        }],
    }
}

fn render_user_data(config: &CloudConfig) -> anyhow::Result<String> {
    let yaml = serde_yaml::to_string(config).context("failed to render user-data")?;
    Ok(format!("#cloud-config\n{yaml}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_is_a_cloud_config_document() {
        let config = cloud_config(
            "guest-0001".to_string(),
            vec!["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 ops".to_string()],
        );
        let doc = render_user_data(&config).unwrap();

        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("manage_etc_hosts: true"));
        assert!(doc.contains("fqdn: guest-0001"));
        assert!(doc.contains("hostname: guest-0001"));
        assert!(doc.contains("name: ubuntu"));
        assert!(doc.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
        assert!(doc.contains("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 ops"));
        // unset fields stay out of the document; lock_passwd is set
        assert!(doc.contains("lock_passwd: false"));
        assert!(!doc.contains(" passwd:"));
        assert!(!doc.contains("chpasswd"));
    }

    #[test]
    fn empty_key_lists_are_omitted() {
        let doc = render_user_data(&cloud_config("guest-0002".to_string(), vec![])).unwrap();
        assert!(!doc.contains("ssh_authorized_keys"));
    }

    #[test]
    fn ipv6_callers_are_rejected() {
        assert!(caller_ip("[::1]:9".parse().unwrap()).is_err());
        assert_eq!(
            caller_ip("10.0.0.5:51000".parse().unwrap()).unwrap(),
            "10.0.0.5".parse::<Ipv4Addr>().unwrap()
        );
    }
}
