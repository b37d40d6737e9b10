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

//! This module is NOT intended to be used by regular users. It is used for mocking purpose only.

use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Message, MessageBuilder, Record};
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
};

/// A mock upstream answering every query with a fixed A record, marking
/// which server handled it. Counts the exchanges it has served and can
/// delay each response to simulate a slow upstream.
#[derive(Clone)]
pub struct Server {
    answer: Ipv4Addr,
    delay: Option<Duration>,
    hits: Arc<AtomicUsize>,
}

impl Server {
    /// Create a mock server marking its answers with the given address.
    pub fn new(answer: Ipv4Addr) -> Self {
        Self {
            answer,
            delay: None,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delay every response by the given duration.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The exchange counter shared with the running server.
    pub fn hits(&self) -> Arc<AtomicUsize> {
        self.hits.clone()
    }

    async fn respond(&self, query: &[u8]) -> Option<Bytes> {
        let query = Message::from_octets(Bytes::copy_from_slice(query)).ok()?;
        let question = query.first_question()?;

        self.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512))
            .ok()?
            .start_answer(&query, Rcode::NoError)
            .ok()?;
        builder
            .push(Record::new(
                question.qname(),
                domain::base::iana::Class::In,
                300,
                domain::rdata::A::new(self.answer),
            ))
            .ok()?;
        Some(Bytes::copy_from_slice(builder.into_message().as_slice()))
    }

    /// Serve UDP queries forever.
    pub async fn run_udp(self, socket: UdpSocket) -> Result<(), std::io::Error> {
        let mut buf = vec![0; 4096];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            if let Some(response) = self.respond(&buf[..len]).await {
                socket.send_to(&response, &peer).await?;
            }
        }
    }

    /// Accept TCP connections forever, answering length-prefixed queries.
    pub async fn run_tcp(self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (mut stream, _) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                loop {
                    let mut len = [0; 2];
                    if stream.read_exact(&mut len).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len) as usize;
                    let mut buf = vec![0; len];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }

                    if let Some(response) = server.respond(&buf).await {
                        let mut reply = BytesMut::with_capacity(response.len() + 2);
                        reply.extend_from_slice(&(response.len() as u16).to_be_bytes());
                        reply.extend_from_slice(&response);
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    }
}
