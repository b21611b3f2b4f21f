//! Network access policy and local address resolution
//!
//! The allow-list is the access-control input for the SSH server: a set of
//! CIDR ranges, defaulting to the overlay's reserved block `100.64.0.0/10`.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use ipnet::IpNet;

use crate::error::ConfigError;

/// CIDR block reserved for the mesh overlay
pub const MESH_CIDR: &str = "100.64.0.0/10";

/// An ordered set of CIDR ranges permitted to reach a service
#[derive(Debug, Clone)]
pub struct AllowList {
    networks: Vec<IpNet>,
}

impl AllowList {
    /// Build an allow-list from CIDR strings.
    ///
    /// An unparseable range is a configuration error, not a silently
    /// skipped entry.
    pub fn new(cidrs: &[String]) -> Result<Self, ConfigError> {
        let mut networks = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let net: IpNet = cidr
                .parse()
                .map_err(|_| ConfigError::InvalidCidr(cidr.clone()))?;
            networks.push(net);
        }
        Ok(Self { networks })
    }

    /// Whether an already-parsed address falls inside at least one range
    pub fn permits(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    /// Whether an address string is permitted.
    ///
    /// Anything that does not parse as an IP address is denied.
    pub fn is_allowed(&self, addr: &str) -> bool {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.permits(ip),
            Err(_) => false,
        }
    }

    /// Number of configured ranges
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// Whether no ranges are configured
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(&[MESH_CIDR.to_string()]).expect("mesh CIDR constant must parse")
    }
}

/// Whether an IPv4 address is in a private range (10/8, 172.16/12, 192.168/16)
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// Probe targets for local address resolution. Connecting a UDP socket
/// sends no traffic; it only asks the kernel which source address routes
/// toward the target.
const PROBE_TARGETS: &[&str] = &[
    "8.8.8.8:80",
    "10.255.255.255:80",
    "172.31.255.255:80",
    "192.168.255.255:80",
];

fn probe_local_addr(target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Resolve a usable local network address.
///
/// Prefers addresses in private ranges over any other non-loopback
/// address, and falls back to loopback only if nothing else is routable.
pub fn preferred_local_addr() -> IpAddr {
    let mut fallback: Option<IpAddr> = None;

    for target in PROBE_TARGETS {
        let Some(ip) = probe_local_addr(target) else {
            continue;
        };
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        match ip {
            IpAddr::V4(v4) if is_private_ipv4(v4) => return ip,
            _ => {
                fallback.get_or_insert(ip);
            }
        }
    }

    fallback.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(cidrs: &[&str]) -> AllowList {
        let cidrs: Vec<String> = cidrs.iter().map(|s| s.to_string()).collect();
        AllowList::new(&cidrs).unwrap()
    }

    #[test]
    fn test_mesh_cidr_bounds() {
        let list = AllowList::default();
        assert!(list.is_allowed("100.64.0.0"));
        assert!(list.is_allowed("100.64.0.1"));
        assert!(list.is_allowed("100.127.255.255"));
        assert!(!list.is_allowed("100.63.255.255"));
        assert!(!list.is_allowed("100.128.0.0"));
    }

    #[test]
    fn test_outside_addresses_denied() {
        let list = AllowList::default();
        assert!(!list.is_allowed("8.8.8.8"));
        assert!(!list.is_allowed("10.0.0.1"));
        assert!(!list.is_allowed("127.0.0.1"));
    }

    #[test]
    fn test_multiple_ranges() {
        let list = allow(&["100.64.0.0/10", "192.168.1.0/24"]);
        assert!(list.is_allowed("100.64.1.100"));
        assert!(list.is_allowed("192.168.1.50"));
        assert!(!list.is_allowed("10.0.0.1"));
        assert!(!list.is_allowed("192.168.2.50"));
        assert!(!list.is_allowed("invalid"));
    }

    #[test]
    fn test_invalid_cidr_is_config_error() {
        let err = AllowList::new(&["not-a-cidr".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCidr(_)));
    }

    #[test]
    fn test_is_private_ipv4() {
        assert!(is_private_ipv4(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(is_private_ipv4(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(172, 31, 255, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(192, 168, 0, 1)));
        assert!(!is_private_ipv4(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(!is_private_ipv4(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_private_ipv4(Ipv4Addr::new(100, 64, 0, 1)));
    }

    #[test]
    fn test_preferred_local_addr_parses() {
        // Environment-dependent, but the contract is that we always get
        // back a usable address, loopback at worst.
        let addr = preferred_local_addr();
        assert!(addr.to_string().parse::<IpAddr>().is_ok());
    }
}
