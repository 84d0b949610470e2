use std::net::Ipv4Addr;

use anyhow::bail;

/// First IPv4 address on a named interface.
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(ip) = ifaddr
            .address
            .as_ref()
            .and_then(|addr| addr.as_sockaddr_in())
            .map(|sin| sin.ip())
        {
            return Some(ip);
        }
    }
    None
}

/// Kernel name for an interface index.
pub fn interface_name(index: u32) -> anyhow::Result<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr().cast()) };
    if name.is_null() {
        bail!("unknown interface index {index}");
    }
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr().cast()) };
    Ok(name.to_string_lossy().into_owned())
}
