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

//! DNS over HTTPS: wire-format POST requests over HTTP/2.

use super::{ConnInitiator, QHandle, QHandleError, Result};
use crate::bootstrap::Bootstrap;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::Message;
use reqwest::{Client, Url};
use std::{net::SocketAddr, sync::Arc, time::Duration};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Client instance for DNS over HTTPS connections
#[derive(Clone)]
pub struct Https {
    uri: Url,
    domain: String,
    bootstrap: Arc<Bootstrap>,
}

impl Https {
    /// Create a new HTTPS client creator instance with the given server URL.
    /// The URL's host is resolved through the bootstrap when a connection is
    /// created.
    // We *CANNOT* reuse the client *WITH* connection pool because if the network changes, *connection* inside client pool of each client remains the same, and cloning them inevitably leads to no reconnection but using stale connections.
    // However, we are able to disable the connection pool and use the client.
    pub fn new(uri: String, bootstrap: Arc<Bootstrap>) -> Result<Self> {
        let uri = Url::parse(&uri).map_err(|_| QHandleError::InvalidUri(uri))?;
        let domain = uri
            .domain()
            .ok_or_else(|| QHandleError::InvalidDomain(uri.clone()))?
            .to_string();

        Ok(Self {
            uri,
            domain,
            bootstrap,
        })
    }
}

#[async_trait]
impl ConnInitiator for Https {
    type Connection = PostClient;

    async fn create(&self) -> std::io::Result<Self::Connection> {
        let ip = self
            .bootstrap
            .lookup(&self.domain)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;

        let client = Client::builder()
            // The port in socket addr doesn't take effect here per documentation
            .resolve(&self.domain, SocketAddr::new(ip, 0))
            .https_only(true)
            .user_agent(APP_USER_AGENT)
            .connect_timeout(Duration::from_secs(3))
            // Disable the inner connection pool
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::Other, "TLS backend failed to initialize")
            })?;

        Ok(PostClient(client, self.uri.clone()))
    }

    fn conn_type(&self) -> &'static str {
        "HTTPS"
    }
}

/// A ready-to-use DoH client posting wire-format messages.
#[derive(Clone)]
pub struct PostClient(Client, Url);

#[async_trait]
impl QHandle for PostClient {
    async fn query(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        // Per RFC, the message ID should be set to 0 to better facilitate HTTPS caching.
        let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))?;
        msg.header_mut().set_id(0);

        let body: reqwest::Body = msg.into_octets().freeze().into();
        let res = self
            .0
            .post(self.1.clone())
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(body)
            .send()
            .await?;

        if res.status().is_success() {
            let res = res.bytes().await?;
            let answer = Message::from_octets(res)?;
            Ok(answer)
        } else {
            Err(QHandleError::FailedHttp(res.status()))
        }
    }
}
