use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::{bail, Context};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode, UnknownOption};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use ipnetwork::Ipv4Network;
use mac_address::MacAddress;
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrIn,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::helpers::{interface_ipv4, interface_name};
use crate::satelit::{DhcpLease, SatelitClient};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const OPT_CLASSLESS_STATIC_ROUTE: u8 = 121;
/// Leases never expire; the registry is authoritative.
const INFINITE_LEASE_SECS: u32 = u32::MAX;

/// Interfaces the responder answers on. The agent side of every bridge
/// veth pair is named `dhcp-{bridge}`; anything else is not ours.
const SERVED_INTERFACE_PREFIX: &str = "dhcp";

/// DHCP responder bound to the control-plane lease registry. Stateless:
/// every request is resolved by client MAC against the datastore and
/// answered at most once.
pub struct DhcpServer {
    satelit: Arc<SatelitClient>,
    fd: AsyncFd<UdpSocket>,
}

impl DhcpServer {
    pub fn new(satelit: Arc<SatelitClient>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", DHCP_SERVER_PORT))
            .context("failed to bind 0.0.0.0:67")?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        // the receiving interface decides whether we answer
        setsockopt(&socket, sockopt::Ipv4PacketInfo, &true)?;

        Ok(DhcpServer {
            satelit,
            fd: AsyncFd::new(socket).context("failed to register dhcp socket")?,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("dhcp responder listening on 0.0.0.0:{DHCP_SERVER_PORT}");
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, ifindex) = self.recv(&mut buf).await?;
            let Some(ifindex) = ifindex else {
                continue;
            };
            // one bad packet never takes the responder down
            if let Err(e) = self.handle_packet(&buf[..len], ifindex).await {
                warn!("dhcp request failed: {e:#}");
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Option<u32>)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                recv_with_pktinfo(inner.get_ref().as_raw_fd(), buf).map_err(std::io::Error::from)
            }) {
                Ok(result) => return result.context("failed to receive dhcp packet"),
                Err(_would_block) => continue,
            }
        }
    }

    async fn handle_packet(&self, packet: &[u8], ifindex: u32) -> anyhow::Result<()> {
        let interface = interface_name(ifindex)?;
        if !interface.starts_with(SERVED_INTERFACE_PREFIX) {
            return Ok(());
        }

        let request = Message::decode(&mut Decoder::new(packet))
            .context("failed to decode dhcp packet")?;
        let message_type = request.opts().msg_type();
        if !matches!(
            message_type,
            Some(MessageType::Discover) | Some(MessageType::Request)
        ) {
            return Ok(());
        }

        let mac = client_mac(&request)?;
        let server_ip = interface_ipv4(&interface)
            .with_context(|| format!("no ipv4 address on {interface}"))?;

        let lease = self
            .satelit
            .get_dhcp_lease(&mac.to_string())
            .await
            .with_context(|| format!("no lease for {mac}"))?;

        let response = build_response(&request, &lease, server_ip)?;
        debug!(
            "dhcp {message_type:?} from {mac} on {interface}: offering {}",
            lease.ip
        );

        let mut out = Vec::new();
        response
            .encode(&mut Encoder::new(&mut out))
            .context("failed to encode dhcp response")?;
        self.send(&out, ifindex, request.giaddr())?;
        Ok(())
    }

    fn send(&self, payload: &[u8], ifindex: u32, giaddr: Ipv4Addr) -> anyhow::Result<()> {
        // answer a relay directly, otherwise broadcast on the receiving
        // interface (the client has no address yet)
        let dest = if giaddr.is_unspecified() {
            SockaddrIn::new(255, 255, 255, 255, DHCP_CLIENT_PORT)
        } else {
            let [a, b, c, d] = giaddr.octets();
            SockaddrIn::new(a, b, c, d, DHCP_SERVER_PORT)
        };

        let pktinfo = libc::in_pktinfo {
            ipi_ifindex: ifindex as libc::c_int,
            ipi_spec_dst: libc::in_addr { s_addr: 0 },
            ipi_addr: libc::in_addr { s_addr: 0 },
        };
        let iov = [IoSlice::new(payload)];
        let cmsgs = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
        sendmsg(
            self.fd.get_ref().as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            Some(&dest),
        )
        .context("failed to send dhcp response")?;
        Ok(())
    }
}

fn recv_with_pktinfo(fd: i32, buf: &mut [u8]) -> nix::Result<(usize, Option<u32>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!(libc::in_pktinfo);
    let msg = recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;
    let mut ifindex = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
            ifindex = Some(info.ipi_ifindex as u32);
        }
    }
    Ok((msg.bytes, ifindex))
}

fn client_mac(request: &Message) -> anyhow::Result<MacAddress> {
    let chaddr = request.chaddr();
    if chaddr.len() < 6 {
        bail!("short hardware address");
    }
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&chaddr[..6]);
    Ok(MacAddress::new(bytes))
}

fn build_response(
    request: &Message,
    lease: &DhcpLease,
    server_ip: Ipv4Addr,
) -> anyhow::Result<Message> {
    let reply_type = match request.opts().msg_type() {
        Some(MessageType::Discover) => MessageType::Offer,
        Some(MessageType::Request) => MessageType::Ack,
        other => bail!("unsupported dhcp message type {other:?}"),
    };

    let yiaddr: Ipv4Addr = lease
        .ip
        .parse()
        .with_context(|| format!("bad lease ip {:?}", lease.ip))?;
    let network: Ipv4Network = lease
        .network_cidr
        .parse()
        .with_context(|| format!("bad lease network {:?}", lease.network_cidr))?;

    let mut response = Message::default();
    response
        .set_opcode(Opcode::BootReply)
        .set_xid(request.xid())
        .set_flags(request.flags())
        .set_yiaddr(yiaddr)
        .set_siaddr(server_ip)
        .set_giaddr(request.giaddr())
        .set_chaddr(request.chaddr());

    let opts = response.opts_mut();
    opts.insert(DhcpOption::MessageType(reply_type));
    opts.insert(DhcpOption::SubnetMask(network.mask()));
    opts.insert(DhcpOption::ServerIdentifier(server_ip));
    opts.insert(DhcpOption::AddressLeaseTime(INFINITE_LEASE_SECS));
    if let Some(dns) = &lease.dns_server {
        let dns: Ipv4Addr = dns
            .parse()
            .with_context(|| format!("bad dns server {dns:?}"))?;
        opts.insert(DhcpOption::DomainNameServer(vec![dns]));
    }
    if let Some(gateway) = &lease.gateway {
        let gateway: Ipv4Addr = gateway
            .parse()
            .with_context(|| format!("bad gateway {gateway:?}"))?;
        opts.insert(DhcpOption::Router(vec![gateway]));
    }

    let routes = classless_static_routes(lease)?;
    if !routes.is_empty() {
        opts.insert(DhcpOption::Unknown(UnknownOption::new(
            OptionCode::from(OPT_CLASSLESS_STATIC_ROUTE),
            routes,
        )));
    }

    Ok(response)
}

/// RFC 3442 route list: a host route steering 169.254.169.254 to the
/// metadata server, then the default route. Each entry is the prefix
/// length, the significant octets of the destination, and the next hop.
fn classless_static_routes(lease: &DhcpLease) -> anyhow::Result<Vec<u8>> {
    let mut encoded = Vec::new();
    if let Some(metadata_server) = &lease.metadata_server {
        let next_hop: Ipv4Addr = metadata_server
            .parse()
            .with_context(|| format!("bad metadata server {metadata_server:?}"))?;
        encoded.extend([32, 169, 254, 169, 254]);
        encoded.extend(next_hop.octets());
    }
    if let Some(gateway) = &lease.gateway {
        let next_hop: Ipv4Addr = gateway
            .parse()
            .with_context(|| format!("bad gateway {gateway:?}"))?;
        encoded.push(0);
        encoded.extend(next_hop.octets());
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> DhcpLease {
        DhcpLease {
            ip: "10.0.0.5".to_string(),
            network_cidr: "10.0.0.0/24".to_string(),
            gateway: Some("10.0.0.1".to_string()),
            dns_server: Some("8.8.8.8".to_string()),
            metadata_server: Some("10.0.0.1".to_string()),
        }
    }

    fn discover() -> Message {
        let mut request = Message::default();
        request.set_chaddr(&[0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]).set_xid(0x1234);
        request
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        request
    }

    #[test]
    fn metadata_route_precedes_the_default_route() {
        let encoded = classless_static_routes(&lease()).unwrap();
        assert_eq!(
            encoded,
            vec![32, 169, 254, 169, 254, 10, 0, 0, 1, 0, 10, 0, 0, 1]
        );
    }

    #[test]
    fn route_halves_are_independent() {
        let mut no_gateway = lease();
        no_gateway.gateway = None;
        assert_eq!(
            classless_static_routes(&no_gateway).unwrap(),
            vec![32, 169, 254, 169, 254, 10, 0, 0, 1]
        );

        let mut no_metadata = lease();
        no_metadata.metadata_server = None;
        assert_eq!(
            classless_static_routes(&no_metadata).unwrap(),
            vec![0, 10, 0, 0, 1]
        );

        let mut bare = lease();
        bare.gateway = None;
        bare.metadata_server = None;
        assert!(classless_static_routes(&bare).unwrap().is_empty());
    }

    #[test]
    fn discover_gets_an_offer() {
        let server_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let response = build_response(&discover(), &lease(), server_ip).unwrap();

        assert_eq!(response.opts().msg_type(), Some(MessageType::Offer));
        assert_eq!(response.yiaddr(), "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(response.siaddr(), server_ip);
        assert_eq!(response.xid(), 0x1234);

        match response.opts().get(OptionCode::SubnetMask) {
            Some(DhcpOption::SubnetMask(mask)) => {
                assert_eq!(*mask, "255.255.255.0".parse::<Ipv4Addr>().unwrap())
            }
            other => panic!("unexpected subnet mask option: {other:?}"),
        }
        match response.opts().get(OptionCode::AddressLeaseTime) {
            Some(DhcpOption::AddressLeaseTime(secs)) => assert_eq!(*secs, u32::MAX),
            other => panic!("unexpected lease time option: {other:?}"),
        }
        match response.opts().get(OptionCode::Router) {
            Some(DhcpOption::Router(routers)) => {
                assert_eq!(routers, &vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()])
            }
            other => panic!("unexpected router option: {other:?}"),
        }
        match response.opts().get(OptionCode::DomainNameServer) {
            Some(DhcpOption::DomainNameServer(servers)) => {
                assert_eq!(servers, &vec!["8.8.8.8".parse::<Ipv4Addr>().unwrap()])
            }
            other => panic!("unexpected dns option: {other:?}"),
        }
    }

    #[test]
    fn request_gets_an_ack() {
        let mut request = discover();
        request
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Request));
        let response =
            build_response(&request, &lease(), "10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(response.opts().msg_type(), Some(MessageType::Ack));
    }

    #[test]
    fn other_message_types_are_rejected() {
        let mut request = discover();
        request
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Release));
        assert!(build_response(&request, &lease(), "10.0.0.1".parse().unwrap()).is_err());
    }

    #[test]
    fn optional_lease_fields_are_omitted() {
        let mut sparse = lease();
        sparse.gateway = None;
        sparse.dns_server = None;
        sparse.metadata_server = None;
        let response = build_response(&discover(), &sparse, "10.0.0.1".parse().unwrap()).unwrap();
        assert!(response.opts().get(OptionCode::Router).is_none());
        assert!(response.opts().get(OptionCode::DomainNameServer).is_none());
        assert!(response
            .opts()
            .get(OptionCode::from(OPT_CLASSLESS_STATIC_ROUTE))
            .is_none());
    }
}
