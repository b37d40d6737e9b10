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

//! The fallback pool: upstreams consulted only after the primary path has
//! failed or timed out on every tried transport. Selection is round-robin
//! with a per-transport cooldown after a failure.

use crate::upstream::{
    qhandle::{QHandleError, Result},
    Upstream,
};
use bytes::Bytes;
use domain::base::Message;
use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

const COOLDOWN: Duration = Duration::from_secs(30);

/// A pool of last-resort upstream transports.
pub struct FallbackPool {
    upstreams: Vec<Arc<Upstream>>,
    down_until: Vec<Mutex<Option<Instant>>>,
    next: AtomicUsize,
}

impl FallbackPool {
    /// Create a pool over the given transports.
    pub fn new(upstreams: Vec<Arc<Upstream>>) -> Self {
        let down_until = upstreams.iter().map(|_| Mutex::new(None)).collect();
        Self {
            upstreams,
            down_until,
            next: AtomicUsize::new(0),
        }
    }

    fn cooling(&self, i: usize, now: Instant) -> bool {
        self.down_until[i]
            .lock()
            .unwrap()
            .map_or(false, |until| now < until)
    }

    /// Exchange through the pool: start at the round-robin cursor, prefer
    /// transports outside their cooldown, and fall back to cooling ones only
    /// when nothing else is left.
    pub async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let n = self.upstreams.len();
        if n == 0 {
            return Err(QHandleError::NoUpstreamAvailable);
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let now = Instant::now();
        let (warm, cooling): (Vec<usize>, Vec<usize>) = (0..n)
            .map(|off| (start + off) % n)
            .partition(|&i| !self.cooling(i, now));

        let mut last = None;
        for i in warm.into_iter().chain(cooling) {
            let upstream = &self.upstreams[i];
            info!("falling back to upstream: {}", upstream.url());
            match upstream.exchange(msg).await {
                Ok(answer) => {
                    *self.down_until[i].lock().unwrap() = None;
                    return Ok(answer);
                }
                Err(e) => {
                    warn!("fallback upstream {} failed: {}", upstream.url(), e);
                    *self.down_until[i].lock().unwrap() = Some(Instant::now() + COOLDOWN);
                    last = Some(e);
                }
            }
        }

        Err(last.unwrap_or(QHandleError::NoUpstreamAvailable))
    }

    /// Close every transport in the pool.
    pub fn shutdown(&self) {
        for upstream in &self.upstreams {
            upstream.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FallbackPool;
    use crate::{mock::Server, upstream::{upstream_from_url, UpstreamOptions}, bootstrap::Bootstrap};
    use bytes::{Bytes, BytesMut};
    use domain::base::{Dname, Message, MessageBuilder, Rtype};
    use std::{str::FromStr, sync::{atomic::Ordering, Arc}, time::Duration};
    use tokio::net::UdpSocket;

    fn query() -> Message<Bytes> {
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512)).unwrap();
        builder.header_mut().set_id(4);
        let mut builder = builder.question();
        builder.push((&name, Rtype::A)).unwrap();
        builder.into_message()
    }

    fn opts(timeout: Duration) -> UpstreamOptions {
        UpstreamOptions {
            timeout,
            bootstrap: Arc::new(Bootstrap::new(&[], timeout).unwrap()),
        }
    }

    #[tokio::test]
    async fn dead_transport_cools_down() {
        // A live mock server and a blackholed address.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let live_addr = socket.local_addr().unwrap();
        let server = Server::new("1.1.1.1".parse().unwrap());
        let hits = server.hits();
        tokio::spawn(server.run_udp(socket));

        let o = opts(Duration::from_millis(200));
        let dead = Arc::new(
            upstream_from_url("udp://127.0.0.1:1", &o).unwrap(),
        );
        let live = Arc::new(
            upstream_from_url(&format!("udp://{}", live_addr), &o).unwrap(),
        );

        let pool = FallbackPool::new(vec![dead, live]);

        // Both round-robin starts end at the live transport.
        for _ in 0..2 {
            pool.exchange(&query()).await.unwrap();
        }
        assert!(hits.load(Ordering::SeqCst) >= 2);

        // The dead transport is cooling now, so the next exchange goes
        // straight to the live one.
        pool.exchange(&query()).await.unwrap();
        assert!(pool.cooling(0, std::time::Instant::now()));
    }
}
