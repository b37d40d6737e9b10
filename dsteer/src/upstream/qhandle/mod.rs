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

//! Per-protocol query handles and the connection pool shared by all of them.
//! Each transport implements [`ConnInitiator`] to create connections and
//! [`QHandle`] to exchange a single message over one connection; [`ConnPool`]
//! turns an initiator into a pooled, timeout-guarded [`QHandle`].

pub mod https;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod udp;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool::{
    managed::{self, BuildError, Manager, Pool, RecycleError},
    Runtime,
};
use domain::base::{Dname, Message, MessageBuilder, Rtype};
use once_cell::sync::Lazy;
use reqwest::{StatusCode, Url};
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tokio::time::{error::Elapsed, timeout};

const MAX_ERROR_TOLERANCE: u8 = 2;
const WAIT_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

static DUMMY_QUERY: Lazy<Message<Bytes>> = Lazy::new(|| {
    let name = Dname::<Bytes>::from_str("example.com").unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(1232)).unwrap();
    builder.header_mut().set_id(0);
    let mut builder = builder.question();
    builder.push((&name, Rtype::A)).unwrap();
    builder.into_message()
});

/// The connection initiator, like Udp, Https. It is similar to ManageConnection.
/// The primary reason for its existence is that we want to reduce the boilderplate on implementing ManageConnection
#[async_trait]
pub trait ConnInitiator: Send + Sync + 'static {
    /// The connection type being created.
    type Connection: QHandle;

    /// Create a fresh connection to the remote endpoint.
    async fn create(&self) -> std::io::Result<Self::Connection>;

    /// Human-readable protocol name used in logs.
    fn conn_type(&self) -> &'static str;
}

/// A local ConnInitiator wrapper implementing the deadpool manager.
pub struct ConnInitWrapper<T: ConnInitiator>(T);

#[async_trait]
impl<T: ConnInitiator> Manager for ConnInitWrapper<T> {
    type Type = (T::Connection, u8);

    type Error = std::io::Error;

    async fn create(&self) -> std::result::Result<Self::Type, Self::Error> {
        Ok((self.0.create().await?, 0))
    }

    async fn recycle(&self, obj: &mut Self::Type) -> managed::RecycleResult<Self::Error> {
        obj.0.reusable().await?;
        if obj.1 >= MAX_ERROR_TOLERANCE {
            log::warn!("the number of error(s) encountered exceeded the threshold");
            Err(RecycleError::StaticMessage(
                "the number of error(s) encountered exceeded the threshold",
            ))
        } else {
            Ok(())
        }
    }
}

/// A handle able to exchange one DNS message for its response.
#[async_trait]
pub trait QHandle: Send + Sync {
    /// Send the query and return the response.
    async fn query(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>>;

    /// Whether the underlying connection can be handed out again.
    async fn reusable(&self) -> managed::RecycleResult<std::io::Error> {
        Ok(())
    }

    /// Release the resources held. Further queries may fail.
    fn shutdown(&self) {}
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, QHandleError>;

/// Error related to query handles and client pools
#[derive(Debug, Error)]
pub enum QHandleError {
    /// Error forwarded from `tokio::time::error`. This indicates a timeout probably.
    #[error(transparent)]
    TimeError(#[from] Elapsed),

    /// IO Error
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Run error from deadpool
    #[error(transparent)]
    PoolRunError(#[from] managed::PoolError<std::io::Error>),

    /// Build error from deadpool
    #[error(transparent)]
    PoolBuildError(#[from] managed::BuildError<std::io::Error>),

    /// Error forwarded from reqwest
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// The URL is not a valid upstream address
    #[error("the URL '{0}' is invalid")]
    InvalidUri(String),

    /// The URL has no resolvable host part
    #[error("the URL '{0}' doesn't contain a valid domain")]
    InvalidDomain(Url),

    /// The HTTP exchange completed with a non-success status
    #[error("unsuccessful HTTP code: {0}")]
    FailedHttp(StatusCode),

    /// QUIC connection setup failed
    #[error(transparent)]
    QuicConnect(#[from] quinn::ConnectError),

    /// QUIC connection broke down
    #[error(transparent)]
    QuicConnection(#[from] quinn::ConnectionError),

    /// QUIC stream write failed
    #[error(transparent)]
    QuicWrite(#[from] quinn::WriteError),

    /// QUIC stream read failed
    #[error(transparent)]
    QuicRead(#[from] quinn::ReadExactError),

    /// Message buffer too short
    #[error(transparent)]
    ShortBuf(#[from] domain::base::ShortBuf),

    /// No upstream was available to try
    #[error("no upstream transport available for the query")]
    NoUpstreamAvailable,
}

/// A pooled, timeout-guarded query handle built from a [`ConnInitiator`].
pub struct ConnPool<T: ConnInitiator> {
    pool: Pool<ConnInitWrapper<T>>,
    timeout: Duration,
}

impl<T: ConnInitiator> ConnPool<T> {
    /// Create a new pool with at most `max_pool_size` live connections. The
    /// timeout covers the whole exchange including connection checkout.
    pub fn new(
        initiator: T,
        max_pool_size: usize,
        timeout: Duration,
    ) -> std::result::Result<Self, BuildError<<ConnInitWrapper<T> as Manager>::Error>> {
        Ok(Self {
            pool: Pool::builder(ConnInitWrapper(initiator))
                .max_size(max_pool_size)
                .wait_timeout(WAIT_TIMEOUT)
                .runtime(Runtime::Tokio1)
                .build()?,
            timeout,
        })
    }
}

#[async_trait]
impl<T: ConnInitiator> QHandle for ConnPool<T> {
    async fn query(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        timeout(self.timeout, async {
            let mut conn = self.pool.get().await?;

            match conn.0.query(msg).await {
                Ok(m) => {
                    conn.1 = 0;
                    Ok(m)
                }
                Err(e) => {
                    conn.1 += 1;
                    Err(e)
                }
            }
        })
        .await
        .map_err(QHandleError::TimeError)?
    }

    fn shutdown(&self) {
        self.pool.close()
    }
}
