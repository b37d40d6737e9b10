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

//! Listener binding with retries, and the UDP payload-limit helpers.

use super::config::BindRetryConfig;
use crate::MAX_LEN;
use bytes::{Bytes, BytesMut};
use domain::base::{Message, MessageBuilder};
use log::{info, warn};
use std::{fmt, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::{
    net::{TcpListener, UdpSocket},
    time::sleep,
};

// Plain DNS over UDP caps replies at 512 bytes unless EDNS raises it.
const UDP_BASE_LIMIT: usize = 512;

/// Error related to binding the listeners
#[derive(Debug, Error)]
pub enum BindError {
    /// No listen address was configured.
    #[error("no listen addresses specified")]
    NoListenAddrs,

    /// Binding failed permanently for the listed endpoints.
    #[error("binding listeners failed: {0}")]
    Failed(FailedBinds),
}

/// The endpoints that could not be bound, with their last errors.
#[derive(Debug)]
pub struct FailedBinds(pub(crate) Vec<(SocketAddr, std::io::Error)>);

impl fmt::Display for FailedBinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (addr, err)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", addr, err)?;
        }
        Ok(())
    }
}

/// The bound sockets of one service: one UDP socket and one TCP listener
/// per configured endpoint.
pub(crate) struct ListenerSet {
    pub(crate) udp: Vec<Arc<UdpSocket>>,
    pub(crate) tcp: Vec<TcpListener>,
}

// Bind one endpoint, both sockets.
async fn bind_one(addr: SocketAddr) -> std::io::Result<(UdpSocket, TcpListener)> {
    let udp = UdpSocket::bind(addr).await?;
    let tcp = TcpListener::bind(addr).await?;
    Ok((udp, tcp))
}

/// Bind every configured endpoint, retrying failures per the bind-retry
/// settings. Any endpoint that stays unbindable aborts the whole startup
/// with an error naming each failed address.
pub(crate) async fn bind_all(
    addrs: &[SocketAddr],
    retry: &BindRetryConfig,
) -> Result<ListenerSet, BindError> {
    if addrs.is_empty() {
        return Err(BindError::NoListenAddrs);
    }

    let attempts = if retry.enabled { retry.count + 1 } else { 1 };
    let mut set = ListenerSet {
        udp: Vec::with_capacity(addrs.len()),
        tcp: Vec::with_capacity(addrs.len()),
    };
    let mut failed = Vec::new();

    for &addr in addrs {
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(retry.interval).await;
            }
            match bind_one(addr).await {
                Ok((udp, tcp)) => {
                    info!("listening on {}", addr);
                    set.udp.push(Arc::new(udp));
                    set.tcp.push(tcp);
                    last = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "binding {} failed (attempt {}/{}): {}",
                        addr,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last = Some(e);
                }
            }
        }
        if let Some(e) = last {
            failed.push((addr, e));
        }
    }

    if failed.is_empty() {
        Ok(set)
    } else {
        Err(BindError::Failed(FailedBinds(failed)))
    }
}

// The largest reply the client advertised it can take over UDP.
pub(crate) fn udp_payload_limit(req: &Message<Bytes>) -> usize {
    req.opt()
        .map(|opt| usize::from(opt.udp_payload_size()).max(UDP_BASE_LIMIT))
        .unwrap_or(UDP_BASE_LIMIT)
}

// Replace an overlong UDP reply with a truncated header-and-question
// response so the client retries over TCP.
pub(crate) fn truncate(req: &Message<Bytes>, reply: &Message<Bytes>) -> Option<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .ok()?
        .start_answer(req, reply.header().rcode())
        .ok()?;
    builder.header_mut().set_tc(true);
    builder.header_mut().set_ra(true);
    Some(builder.into_message())
}
