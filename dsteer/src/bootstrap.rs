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

//! Bootstrap resolution for the hostnames embedded in encrypted upstream
//! URLs. A fixed, ordered list of plain resolvers is consulted; the first
//! one that answers (even with an empty set) wins, and every resolved host
//! is memoized for the lifetime of the process.

use crate::{
    upstream::qhandle::{
        udp::{Udp, UdpUpgrade},
        tcp::Tcp,
        ConnPool, QHandle, QHandleError,
    },
    MAX_LEN,
};
use bytes::{Bytes, BytesMut};
use domain::{
    base::{Dname, Message, MessageBuilder, Rtype},
    rdata::{Aaaa, A},
};
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Mutex,
    time::Duration,
};
use thiserror::Error;

// Bootstrap traffic is light; a few connections suffice.
const BOOTSTRAP_POOL_SIZE: usize = 4;

/// Result alias for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Error related to bootstrap resolution
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No endpoint could be constructed at all.
    #[error("no usable bootstrap endpoint could be constructed")]
    NoEndpoints,

    /// The hostname is not a well-formed domain name.
    #[error("'{0}' is not a valid host name")]
    InvalidName(String),

    /// Every configured endpoint failed to answer for the host.
    #[error("all bootstrap endpoints failed to resolve '{0}'")]
    AllEndpointsFailed(String),

    /// The host resolved successfully but to an empty address set.
    #[error("bootstrap resolved '{0}' to no addresses")]
    NoAddresses(String),

    /// Message buffer too short
    #[error(transparent)]
    ShortBuf(#[from] domain::base::ShortBuf),
}

struct Endpoint {
    addr: SocketAddr,
    handle: UdpUpgrade,
}

/// The bootstrap resolver: an ordered consult over plain resolvers with a
/// process-lifetime memoization of every resolved host.
pub struct Bootstrap {
    endpoints: Vec<Endpoint>,
    cache: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl Bootstrap {
    /// Create a bootstrap resolver from an ordered list of plain resolver
    /// endpoints. Endpoints failing to construct are reported and skipped;
    /// construction only fails when endpoints were configured but none is
    /// usable. An empty list is allowed and yields a resolver that only
    /// handles IP literals.
    pub fn new(addrs: &[SocketAddr], timeout: Duration) -> Result<Self> {
        let mut endpoints = Vec::with_capacity(addrs.len());
        let mut failed = 0;
        for addr in addrs {
            match Self::endpoint(*addr, timeout) {
                Ok(e) => endpoints.push(e),
                Err(e) => {
                    warn!("skipping bootstrap endpoint {}: {}", addr, e);
                    failed += 1;
                }
            }
        }

        if failed > 0 && endpoints.is_empty() {
            return Err(BootstrapError::NoEndpoints);
        }

        Ok(Self {
            endpoints,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(addr: SocketAddr, timeout: Duration) -> std::result::Result<Endpoint, QHandleError> {
        Ok(Endpoint {
            addr,
            handle: UdpUpgrade::new(
                ConnPool::new(Udp::new(addr), BOOTSTRAP_POOL_SIZE, timeout)?,
                ConnPool::new(Tcp::new(addr), BOOTSTRAP_POOL_SIZE, timeout)?,
            ),
        })
    }

    /// Resolve a host to its first usable address. Errors if the host
    /// resolves to an empty set.
    pub async fn lookup(&self, host: &str) -> Result<IpAddr> {
        self.resolve(host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BootstrapError::NoAddresses(host.to_string()))
    }

    /// Resolve a host to all its addresses. IP literals short-circuit, the
    /// memo is consulted next, and only then are the endpoints queried in
    /// their declared order. An answered response with no usable records
    /// still wins the consult and is memoized as an empty set.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(cached) = self.cache.lock().unwrap().get(host) {
            debug!("bootstrap cache hit for {}", host);
            return Ok(cached.clone());
        }

        let name = Dname::<Bytes>::from_str(host)
            .map_err(|_| BootstrapError::InvalidName(host.to_string()))?;

        let queries = (
            build_query(&name, Rtype::A)?,
            build_query(&name, Rtype::Aaaa)?,
        );

        for endpoint in &self.endpoints {
            let mut addrs = Vec::new();
            let mut answered = false;

            let results = futures::join!(
                endpoint.handle.query(&queries.0),
                endpoint.handle.query(&queries.1)
            );
            for result in [results.0, results.1] {
                match result {
                    Ok(answer) => {
                        answered = true;
                        collect_addrs(&answer, &mut addrs);
                    }
                    Err(e) => {
                        debug!(
                            "bootstrap endpoint {} failed to resolve {}: {}",
                            endpoint.addr, host, e
                        );
                    }
                }
            }

            // The first endpoint that returns any answer wins, even an
            // empty one.
            if answered {
                info!("bootstrap resolved {} to {:?}", host, addrs);
                self.cache
                    .lock()
                    .unwrap()
                    .insert(host.to_string(), addrs.clone());
                return Ok(addrs);
            }
        }

        Err(BootstrapError::AllEndpointsFailed(host.to_string()))
    }

    /// Close all endpoints. Hosts already memoized keep resolving.
    pub fn shutdown(&self) {
        for endpoint in &self.endpoints {
            endpoint.handle.shutdown();
        }
    }
}

fn build_query(name: &Dname<Bytes>, rtype: Rtype) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?;
    builder.header_mut().set_random_id();
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder.push((name, rtype))?;
    Ok(builder.into_message())
}

fn collect_addrs(answer: &Message<Bytes>, addrs: &mut Vec<IpAddr>) {
    if let Ok(section) = answer.answer() {
        for record in section.limit_to::<A>().flatten() {
            addrs.push(IpAddr::V4(record.data().addr()));
        }
    }
    if let Ok(section) = answer.answer() {
        for record in section.limit_to::<Aaaa>().flatten() {
            addrs.push(IpAddr::V6(record.data().addr()));
        }
    }
}
