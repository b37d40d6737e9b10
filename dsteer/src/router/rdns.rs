// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Private-address bookkeeping for reverse lookups: the private-subnets set
//! and the parsing of `in-addr.arpa`/`ip6.arpa` names back into addresses.

use cidr_utils::cidr::IpCidr;
use once_cell::sync::Lazy;
use std::net::{IpAddr, Ipv6Addr};

// The locally-served zones of RFC 6303 plus the shared CGN range.
static LOCALLY_SERVED: Lazy<Vec<IpCidr>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|s| IpCidr::from_str(s).unwrap())
    .collect()
});

pub(crate) fn cidr_contains(cidr: &IpCidr, addr: IpAddr) -> bool {
    match (cidr, addr) {
        (IpCidr::V4(c), IpAddr::V4(a)) => c.contains(a),
        (IpCidr::V6(c), IpAddr::V6(a)) => c.contains(a),
        _ => false,
    }
}

pub(crate) fn cidr_bits(cidr: &IpCidr) -> u8 {
    match cidr {
        IpCidr::V4(c) => c.get_bits(),
        IpCidr::V6(c) => c.get_bits(),
    }
}

/// The set of IP networks considered private. Clients inside it may resolve
/// reverse names of other private addresses; clients outside it may not.
#[derive(Clone)]
pub struct PrivateSubnets {
    cidrs: Vec<IpCidr>,
}

impl Default for PrivateSubnets {
    fn default() -> Self {
        Self {
            cidrs: LOCALLY_SERVED.clone(),
        }
    }
}

impl PrivateSubnets {
    /// Use an explicit set of networks instead of the locally-served ranges.
    pub fn new(cidrs: Vec<IpCidr>) -> Self {
        Self { cidrs }
    }

    /// Whether the address falls into any of the private networks.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.cidrs.iter().any(|c| cidr_contains(c, addr))
    }
}

// Decode the address embedded in a reverse-lookup name. The name is
// expected lower-cased; a trailing dot is accepted.
pub(crate) fn reverse_addr(qname: &str) -> Option<IpAddr> {
    let name = qname.strip_suffix('.').unwrap_or(qname);

    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        let mut count = 0;
        for (i, label) in rest.split('.').enumerate() {
            if i >= 4 {
                return None;
            }
            // Reverse names store the least significant octet first.
            octets[3 - i] = label.parse().ok()?;
            count = i + 1;
        }
        (count == 4).then(|| IpAddr::V4(octets.into()))
    } else if let Some(rest) = name.strip_suffix(".ip6.arpa") {
        let labels: Vec<&str> = rest.split('.').collect();
        if labels.len() != 32 {
            return None;
        }
        let mut addr = 0u128;
        for label in labels.iter().rev() {
            if label.len() != 1 {
                return None;
            }
            addr = (addr << 4) | u128::from_str_radix(label, 16).ok()?;
        }
        Some(IpAddr::V6(Ipv6Addr::from(addr)))
    } else {
        None
    }
}
