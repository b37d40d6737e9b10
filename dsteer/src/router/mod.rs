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

//! The router picks the upstream transports for a request from the routing
//! table: longest client prefix first, then longest question-domain suffix
//! within the per-client configuration, with the private-RDNS gate applied
//! before anything else.

pub mod group;
pub(crate) mod rdns;
pub(crate) mod table;

pub use rdns::PrivateSubnets;

use self::table::{ClientConfig, RoutingTable};
use crate::{cache::ResponseCache, upstream::Upstream};
use cidr_utils::cidr::IpCidr;
use domain::base::Rtype;
use log::debug;
use std::{net::IpAddr, sync::Arc};

/// The routing decision for one request.
pub(crate) enum Decision<'a> {
    /// Forward to these transports, filling these caches on success.
    Forward {
        /// Candidate transports, load-balanced at exchange time.
        upstreams: &'a [Arc<Upstream>],
        /// The matched per-client cache, if any.
        client_cache: Option<&'a ResponseCache>,
        /// The matched client network, used to scope coalescing.
        network: Option<&'a IpCidr>,
    },
    /// Reverse lookup of a private address from a public client: answer
    /// NXDOMAIN locally, never go upstream.
    RefusePrivateRdns,
}

/// The deterministic per-request upstream selector.
pub struct Router {
    table: RoutingTable,
    private_subnets: PrivateSubnets,
}

impl Router {
    pub(crate) fn new(table: RoutingTable, private_subnets: PrivateSubnets) -> Self {
        Self {
            table,
            private_subnets,
        }
    }

    /// Decide where a request goes. `qname` must be lower-cased and
    /// dot-terminated.
    pub(crate) fn decide(&self, client: IpAddr, qname: &str, qtype: Rtype) -> Decision<'_> {
        if qtype == Rtype::Ptr {
            if let Some(addr) = rdns::reverse_addr(qname) {
                if self.private_subnets.contains(addr) {
                    if !self.private_subnets.contains(client) {
                        debug!(
                            "refusing private reverse lookup of {} from public client {}",
                            addr, client
                        );
                        return Decision::RefusePrivateRdns;
                    }
                    if let Some(private) = &self.table.private {
                        return Decision::Forward {
                            upstreams: private,
                            client_cache: None,
                            network: None,
                        };
                    }
                    // Without a private group the request is routed normally.
                }
            }
        }

        let (network, conf) = match self.table.find(client) {
            Some((cidr, conf)) => (Some(cidr), conf),
            None => (None, &self.table.wide),
        };

        let upstreams = match domain_pick(conf, qname) {
            Some(list) => list,
            None if conf.generic.is_empty() => &self.table.wide.generic,
            None => &conf.generic,
        };

        Decision::Forward {
            upstreams,
            client_cache: conf.cache.as_ref(),
            network,
        }
    }
}

// The longest-suffix walk over the two domain maps. The deepest suffix in
// either map wins; at equal depth the specified entry is preferred. An empty
// reserved entry is a block marker: the query falls out to the generic list.
fn domain_pick<'a>(conf: &'a ClientConfig, qname: &str) -> Option<&'a [Arc<Upstream>]> {
    let specified = conf.specified.longest_match(qname);
    let reserved = conf.reserved.longest_match(qname);

    match (specified, reserved) {
        (Some((sd, _)), Some((rd, list))) if rd > sd => {
            if list.is_empty() {
                None
            } else {
                Some(list)
            }
        }
        (Some((_, list)), _) => Some(list),
        (None, Some((_, list))) => {
            if list.is_empty() {
                None
            } else {
                Some(list)
            }
        }
        (None, None) => None,
    }
}
