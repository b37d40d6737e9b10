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

//! DNS over QUIC: one bidirectional stream per query.

use super::{tls::create_client_config, ConnInitiator, QHandle, Result};
use crate::bootstrap::Bootstrap;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::Message;
use log::debug;
use quinn::{ClientConfig, Connection, Endpoint, NewConnection};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::sync::Mutex;

// ALPN token as registered for DNS over dedicated QUIC connections.
const ALPN_DOQ: &[u8] = b"doq";

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

/// Client instance for DNS over QUIC connections
#[derive(Clone)]
pub struct Quic {
    host: String,
    port: u16,
    bootstrap: Arc<Bootstrap>,
}

impl Quic {
    /// Create a new QUIC connection creator instance towards `host:port`. The
    /// host is resolved through the bootstrap at connection creation time.
    pub fn new(host: String, port: u16, bootstrap: Arc<Bootstrap>) -> Self {
        Self {
            host,
            port,
            bootstrap,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut crypto = create_client_config();
        crypto.alpn_protocols = vec![ALPN_DOQ.to_vec()];
        ClientConfig::new(Arc::new(crypto))
    }
}

fn broken(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[async_trait]
impl ConnInitiator for Quic {
    type Connection = QuicConn;

    async fn create(&self) -> std::io::Result<Self::Connection> {
        let ip = self
            .bootstrap
            .lookup(&self.host)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;

        let endpoint = Endpoint::client(bind_addr(matches!(ip, IpAddr::V4(_))))?;
        let NewConnection { connection, .. } = endpoint
            .connect_with(
                self.client_config(),
                SocketAddr::new(ip, self.port),
                &self.host,
            )
            .map_err(broken)?
            .await
            .map_err(broken)?;

        Ok(QuicConn {
            _endpoint: endpoint,
            conn: Mutex::new(connection),
        })
    }

    fn conn_type(&self) -> &'static str {
        "QUIC"
    }
}

/// One QUIC connection multiplexing each query onto its own stream.
pub struct QuicConn {
    // The endpoint must outlive its connections.
    _endpoint: Endpoint,
    conn: Mutex<Connection>,
}

#[async_trait]
impl QHandle for QuicConn {
    async fn query(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        // All DNS messages over DoQ use a message ID of 0 per RFC 9250.
        let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))?;
        msg.header_mut().set_id(0);
        let msg = msg.for_slice();

        // Prefix our payload with length per RFC.
        let mut payload = BytesMut::new();
        let len = u16::try_from(msg.as_slice().len())
            .expect("request too long")
            .to_be_bytes();
        payload.extend_from_slice(&len);
        payload.extend_from_slice(msg.as_slice());
        let payload = payload.freeze();

        let (mut send, mut recv) = {
            let conn = self.conn.lock().await;
            conn.open_bi().await?
        };

        send.write_all(&payload).await?;
        send.finish().await?;

        debug!("QuicConn wrote all of the prefixed query");

        // Get the length of the response
        let mut len = [0; 2];
        recv.read_exact(&mut len).await?;
        let len = u16::from_be_bytes(len);

        // Read the response
        let mut buf = BytesMut::with_capacity(len.into());
        buf.resize(len.into(), 0);
        recv.read_exact(&mut buf).await?;

        let answer = Message::from_octets(buf.freeze())?;
        Ok(answer)
    }
}
