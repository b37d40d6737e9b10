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

//! Construction of [`Upstream`] transports from their URLs. The scheme picks
//! the protocol: `udp://`, `tcp://`, `tls://`, `https://`, `quic://`; a bare
//! `host:port` means UDP.

use super::{
    qhandle::{
        https::Https,
        quic::Quic,
        tcp::Tcp,
        tls::Tls,
        udp::{Udp, UdpUpgrade},
        ConnPool, QHandleError, Result,
    },
    Upstream,
};
use crate::bootstrap::Bootstrap;
use reqwest::Url;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

// RATIONALE BEHIND THIS DEFAULT VALUE
// Actually, if the tolerance level is 2, then the expected number of queries needed to get a valid response is about E(n) = 1.34*n + 1.66
// That means we have to have on average 344.265 queries by a single sender in order to get one valid response given all the connections in pool are broken and the pool size is 256.
//
// Let's say if we have m senders concurrently sending requests on an all-broken connection pool. Let's say for each sender the expected time to get the valid response is about E(n)/m. Then for m = 5, at the worst case -- timeout for 5 seconds each request -- we would need E(n) seconds to recover the system.
//
// According to our benchmark and real world scenario, UDP connections' turnabout time is between 4 - 60ms. That means a single connection can support 16 to 250 queries per second.
// This means: for each 1.3 second we wait on recovery, we can get about 200 more qps. Quite a good deal!
//
// Let's say finally we are willing to wait 60 seconds on recovery. We could then take a pool size of 43, which corresponds to a recovery time of 59.6425
const MAX_UDP_POOL_SIZE: usize = 43;

// Stream transports reuse their connections; the same sizing applies.
const MAX_STREAM_POOL_SIZE: usize = 43;

// We don't cache HTTPS connections. That means we wouldn't need any recovery! Indeed, we store clients.
// On average, HTTPS query roundtrip time is 750ms. That means a bigger connection pool is almost always better.
const MAX_HTTPS_POOL_SIZE: usize = 1024;

// A QUIC connection carries one in-flight stream per checkout.
const MAX_QUIC_POOL_SIZE: usize = 16;

const PORT_DNS: u16 = 53;
const PORT_DOT: u16 = 853;
const PORT_DOQ: u16 = 853;

/// The options bundle shared by all transports of one section.
#[derive(Clone)]
pub struct UpstreamOptions {
    /// Cap on each whole exchange.
    pub timeout: Duration,
    /// Resolver for hostnames embedded in encrypted upstream URLs.
    pub bootstrap: Arc<Bootstrap>,
}

/// Create an [`Upstream`] from its URL. Identical URLs should share one
/// instance; callers are expected to deduplicate.
pub fn upstream_from_url(url: &str, opts: &UpstreamOptions) -> Result<Upstream> {
    let canonical = if url.contains("://") {
        url.to_string()
    } else {
        // A bare host:port speaks plain DNS.
        format!("udp://{}", url)
    };

    let parsed =
        Url::parse(&canonical).map_err(|_| QHandleError::InvalidUri(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| QHandleError::InvalidUri(url.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let handle: Arc<dyn super::qhandle::QHandle> = match parsed.scheme() {
        "udp" => {
            let addr = plain_addr(&host, parsed.port().unwrap_or(PORT_DNS), url)?;
            Arc::new(UdpUpgrade::new(
                ConnPool::new(Udp::new(addr), MAX_UDP_POOL_SIZE, opts.timeout)?,
                ConnPool::new(Tcp::new(addr), MAX_STREAM_POOL_SIZE, opts.timeout)?,
            ))
        }
        "tcp" => {
            let addr = plain_addr(&host, parsed.port().unwrap_or(PORT_DNS), url)?;
            Arc::new(ConnPool::new(
                Tcp::new(addr),
                MAX_STREAM_POOL_SIZE,
                opts.timeout,
            )?)
        }
        "tls" => Arc::new(ConnPool::new(
            Tls::new(
                host,
                parsed.port().unwrap_or(PORT_DOT),
                opts.bootstrap.clone(),
            ),
            MAX_STREAM_POOL_SIZE,
            opts.timeout,
        )?),
        "https" => Arc::new(ConnPool::new(
            Https::new(canonical.clone(), opts.bootstrap.clone())?,
            MAX_HTTPS_POOL_SIZE,
            opts.timeout,
        )?),
        "quic" => Arc::new(ConnPool::new(
            Quic::new(
                host,
                parsed.port().unwrap_or(PORT_DOQ),
                opts.bootstrap.clone(),
            ),
            MAX_QUIC_POOL_SIZE,
            opts.timeout,
        )?),
        _ => return Err(QHandleError::InvalidUri(url.to_string())),
    };

    Ok(Upstream::new(canonical, handle, opts.timeout))
}

// Plain DNS endpoints carry no hostname to bootstrap; the host must be an
// IP literal.
fn plain_addr(host: &str, port: u16, url: &str) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| QHandleError::InvalidUri(url.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}
