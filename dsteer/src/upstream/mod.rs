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

//! `Upstream` wraps a pooled [`QHandle`] into a single upstream transport
//! with live load statistics, and provides the ranked multi-candidate
//! exchange used by the router.

pub mod builder;
pub mod qhandle;

pub use builder::{upstream_from_url, UpstreamOptions};

use self::qhandle::{QHandle, QHandleError, Result};
use bytes::Bytes;
use domain::base::Message;
use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// A single upstream transport: one endpoint, one protocol, one pool.
pub struct Upstream {
    url: String,
    handle: Arc<dyn QHandle>,
    timeout: Duration,
    // Exponentially-weighted recent latency in microseconds; 0 = no sample.
    rtt: AtomicU64,
    outstanding: AtomicUsize,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream").field("url", &self.url).finish()
    }
}

impl Upstream {
    pub(crate) fn new(url: String, handle: Arc<dyn QHandle>, timeout: Duration) -> Self {
        Self {
            url,
            handle,
            timeout,
            rtt: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// The canonical URL this transport was built from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Exchange one query for its response, updating the load statistics. A
    /// timed-out exchange charges the full timeout as its latency sample.
    pub async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let res = self.handle.query(msg).await;
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        let sample = match &res {
            Err(QHandleError::TimeError(_)) => self.timeout,
            _ => start.elapsed(),
        };
        self.observe(sample);

        res
    }

    fn observe(&self, sample: Duration) {
        let sample = sample.as_micros() as u64;
        // A racing writer only loses one sample; precision is not needed here.
        let old = self.rtt.load(Ordering::Relaxed);
        let new = if old == 0 { sample } else { (old * 7 + sample) / 8 };
        self.rtt.store(new.max(1), Ordering::Relaxed);
    }

    // (recent latency, outstanding exchanges); unsampled transports rank first.
    pub(crate) fn rank(&self) -> (u64, usize) {
        (
            self.rtt.load(Ordering::Relaxed),
            self.outstanding.load(Ordering::Relaxed),
        )
    }

    /// Close the underlying connection pool.
    pub fn shutdown(&self) {
        self.handle.shutdown()
    }
}

/// Try the candidates in load-balance order until one succeeds: lowest
/// recent latency first, ties broken by fewest outstanding exchanges, then
/// by declaration order. The last error is returned when every candidate
/// fails.
pub async fn exchange_ranked(
    candidates: &[Arc<Upstream>],
    msg: &Message<Bytes>,
) -> Result<Message<Bytes>> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    // Stable sort keeps declaration order among full ties.
    order.sort_by_key(|&i| candidates[i].rank());

    let mut last = None;
    for i in order {
        let upstream = &candidates[i];
        info!("querying with upstream: {}", upstream.url());
        match upstream.exchange(msg).await {
            Ok(answer) => return Ok(answer),
            Err(e) => {
                warn!("upstream {} failed: {}", upstream.url(), e);
                last = Some(e);
            }
        }
    }

    Err(last.unwrap_or(QHandleError::NoUpstreamAvailable))
}

#[cfg(test)]
mod tests {
    use super::{exchange_ranked, qhandle, Upstream};
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use domain::base::{Dname, Message, MessageBuilder, Rtype};
    use std::{
        str::FromStr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    fn query() -> Message<Bytes> {
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512)).unwrap();
        builder.header_mut().set_id(7);
        let mut builder = builder.question();
        builder.push((&name, Rtype::A)).unwrap();
        builder.into_message()
    }

    struct Fixed {
        fail: bool,
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl qhandle::QHandle for Fixed {
        async fn query(&self, msg: &Message<Bytes>) -> qhandle::Result<Message<Bytes>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(qhandle::QHandleError::IoError(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "down",
                )))
            } else {
                Ok(msg.clone())
            }
        }
    }

    fn upstream(url: &str, fail: bool, hits: Arc<AtomicUsize>) -> Arc<Upstream> {
        Arc::new(Upstream::new(
            url.to_string(),
            Arc::new(Fixed { fail, hits }),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn lower_latency_ranks_first() {
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let a = upstream("udp://1.1.1.1:53", false, hits_a.clone());
        let b = upstream("udp://8.8.8.8:53", false, hits_b.clone());

        a.observe(Duration::from_millis(500));
        b.observe(Duration::from_millis(5));

        exchange_ranked(&[a, b], &query()).await.unwrap();
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_move_to_next_candidate() {
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let a = upstream("udp://1.1.1.1:53", true, hits_a.clone());
        let b = upstream("udp://8.8.8.8:53", false, hits_b.clone());

        a.observe(Duration::from_millis(1));
        b.observe(Duration::from_millis(10));

        exchange_ranked(&[a, b], &query()).await.unwrap();
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_failing_returns_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let a = upstream("udp://1.1.1.1:53", true, hits.clone());
        assert!(exchange_ranked(&[a], &query()).await.is_err());
    }
}
