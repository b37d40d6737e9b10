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

//! The DNS service façade: it owns the listeners, router, caches, coalescer,
//! bootstrap, and fallback pool, and runs the request pipeline
//! `received → coalesced → cache-checked → routed → forwarded → cached →
//! responded`.

pub mod config;
pub(crate) mod listener;

use self::{
    config::{BindRetryConfig, Config},
    listener::ListenerSet,
};
use crate::{
    bootstrap::Bootstrap,
    cache::{fingerprint, ResponseCache},
    error::{Result, SteerError},
    fallback::FallbackPool,
    pending::{self, PendingRequests, SharedAnswer, Ticket},
    router::{group::normalize_domain, table::{RoutingTable, TableCacheConfig}, Decision, Router},
    upstream::{
        exchange_ranked,
        qhandle::QHandleError,
        upstream_from_url, Upstream, UpstreamOptions,
    },
    MAX_LEN,
};
use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Message, MessageBuilder, Rtype};
use log::{debug, info, warn};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::{watch, Notify},
    task::JoinHandle,
    time::timeout,
};

// Received UDP datagrams are read into buffers of this size.
const UDP_RECV_SIZE: usize = 4096;

struct ServiceInner {
    router: Router,
    shared_cache: Option<ResponseCache>,
    pending: Option<PendingRequests>,
    fallback: Option<FallbackPool>,
    bootstrap: Arc<Bootstrap>,
    upstreams: Vec<Arc<Upstream>>,
    shutdown_rx: watch::Receiver<bool>,
    inflight: AtomicUsize,
    drained: Notify,
}

impl ServiceInner {
    // Spawn a request-scoped task counted against the drain gate.
    fn spawn_tracked<F>(self: &Arc<Self>, fut: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let inner = self.clone();
        tokio::spawn(async move {
            let _gauge = Gauge(inner);
            fut.await
        })
    }
}

struct Gauge(Arc<ServiceInner>);

impl Drop for Gauge {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_one();
        }
    }
}

/// The DNS forwarding service.
pub struct DnsService {
    inner: Arc<ServiceInner>,
    listen_addrs: Vec<SocketAddr>,
    bind_retry: BindRetryConfig,
    shutdown_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    bound_udp: Mutex<Vec<SocketAddr>>,
    bound_tcp: Mutex<Vec<SocketAddr>>,
}

impl DnsService {
    /// Wire the whole engine together from the validated configuration.
    /// Listeners are not bound until [`start`](Self::start).
    pub fn new(conf: Config) -> Result<Self> {
        let bootstrap = Arc::new(Bootstrap::new(
            &conf.bootstrap.servers,
            conf.bootstrap.timeout,
        )?);

        let opts = UpstreamOptions {
            timeout: conf.upstreams.timeout,
            bootstrap: bootstrap.clone(),
        };
        let table_cache = TableCacheConfig {
            client_size: conf
                .cache
                .enabled
                .then(|| NonZeroUsize::new(conf.cache.client_size))
                .flatten(),
        };
        let (table, mut upstreams) =
            RoutingTable::build(&conf.upstreams.groups, &opts, &table_cache)?;
        let router = Router::new(table, conf.private_subnets.clone());

        let fallback = if conf.fallbacks.servers.is_empty() {
            None
        } else {
            let fb_opts = UpstreamOptions {
                timeout: conf.fallbacks.timeout,
                bootstrap: bootstrap.clone(),
            };
            let mut transports = Vec::with_capacity(conf.fallbacks.servers.len());
            for url in &conf.fallbacks.servers {
                let upstream = Arc::new(upstream_from_url(url, &fb_opts)?);
                upstreams.push(upstream.clone());
                transports.push(upstream);
            }
            Some(FallbackPool::new(transports))
        };

        let shared_cache = conf
            .cache
            .enabled
            .then(|| NonZeroUsize::new(conf.cache.size))
            .flatten()
            .map(ResponseCache::new);
        let pending = conf.pending_requests.enabled.then(PendingRequests::new);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ServiceInner {
                router,
                shared_cache,
                pending,
                fallback,
                bootstrap,
                upstreams,
                shutdown_rx,
                inflight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
            listen_addrs: conf.listen_addrs,
            bind_retry: conf.bind_retry,
            shutdown_timeout: conf.shutdown_timeout,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
            bound_udp: Mutex::new(Vec::new()),
            bound_tcp: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listeners (retrying per configuration) and start serving.
    pub async fn start(&self) -> Result<()> {
        let ListenerSet { udp, tcp } =
            listener::bind_all(&self.listen_addrs, &self.bind_retry).await?;

        let mut loops = self.loops.lock().unwrap();
        let mut bound_udp = self.bound_udp.lock().unwrap();
        let mut bound_tcp = self.bound_tcp.lock().unwrap();

        for socket in udp {
            if let Ok(addr) = socket.local_addr() {
                bound_udp.push(addr);
            }
            loops.push(tokio::spawn(udp_loop(self.inner.clone(), socket)));
        }
        for listener in tcp {
            if let Ok(addr) = listener.local_addr() {
                bound_tcp.push(addr);
            }
            loops.push(tokio::spawn(tcp_loop(self.inner.clone(), listener)));
        }

        info!("dns service ready");
        Ok(())
    }

    /// The UDP addresses actually bound. Useful with port 0.
    pub fn udp_addrs(&self) -> Vec<SocketAddr> {
        self.bound_udp.lock().unwrap().clone()
    }

    /// The TCP addresses actually bound. Useful with port 0.
    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.bound_tcp.lock().unwrap().clone()
    }

    /// Stop accepting input, drain in-flight requests up to the shutdown
    /// timeout, then close transports, bootstrap, and caches in
    /// reverse-construction order. Never blocks past the timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for handle in self.loops.lock().unwrap().drain(..) {
            handle.abort();
        }

        let inner = self.inner.clone();
        let drained = timeout(self.shutdown_timeout, async move {
            while inner.inflight.load(Ordering::SeqCst) > 0 {
                inner.drained.notified().await;
            }
        })
        .await;

        let mut errs: Vec<String> = Vec::new();
        if drained.is_err() {
            errs.push(format!(
                "{} request(s) still in flight after {:?}",
                self.inner.inflight.load(Ordering::SeqCst),
                self.shutdown_timeout
            ));
        }

        for upstream in &self.inner.upstreams {
            upstream.shutdown();
        }
        if let Some(fallback) = &self.inner.fallback {
            fallback.shutdown();
        }
        self.inner.bootstrap.shutdown();

        if errs.is_empty() {
            info!("dns service stopped");
            Ok(())
        } else {
            Err(SteerError::ShutdownErrors(errs.join("; ")))
        }
    }
}

async fn udp_loop(inner: Arc<ServiceInner>, socket: Arc<UdpSocket>) {
    let mut shutdown = inner.shutdown_rx.clone();
    let mut buf = vec![0; UDP_RECV_SIZE];
    loop {
        let (len, src) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("receiving datagram failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        let data = Bytes::copy_from_slice(&buf[..len]);
        let socket = socket.clone();
        let task_inner = inner.clone();
        inner.spawn_tracked(async move {
            let msg = match Message::from_octets(data) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dropping unparsable datagram from {}: {}", src, e);
                    return;
                }
            };

            if let Some(reply) = handle_message(&task_inner, msg.clone(), src.ip()).await {
                let reply = if reply.as_slice().len() > listener::udp_payload_limit(&msg) {
                    match listener::truncate(&msg, &reply) {
                        Some(t) => t,
                        None => return,
                    }
                } else {
                    reply
                };
                if let Err(e) = socket.send_to(reply.as_slice(), src).await {
                    warn!("sending reply to {} failed: {}", src, e);
                }
            }
        });
    }
}

async fn tcp_loop(inner: Arc<ServiceInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_rx.clone();
    loop {
        let (stream, peer) = tokio::select! {
            r = listener.accept() => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("accepting connection failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        let conn_inner = inner.clone();
        tokio::spawn(tcp_conn(conn_inner, stream, peer));
    }
}

// One TCP connection: pipelined queries, responses written in completion
// order. Closing the connection cancels only the writes; in-flight upstream
// exchanges keep running and still fill the caches.
async fn tcp_conn(inner: Arc<ServiceInner>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    let mut shutdown = inner.shutdown_rx.clone();
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let mut len = [0; 2];
        tokio::select! {
            r = reader.read_exact(&mut len) => if r.is_err() { return },
            _ = shutdown.changed() => return,
        }
        let len = usize::from(u16::from_be_bytes(len));
        let mut buf = vec![0; len];
        if reader.read_exact(&mut buf).await.is_err() {
            return;
        }

        let msg = match Message::from_octets(Bytes::from(buf)) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping unparsable message from {}: {}", peer, e);
                continue;
            }
        };

        let task_inner = inner.clone();
        let writer = writer.clone();
        inner.spawn_tracked(async move {
            if let Some(reply) = handle_message(&task_inner, msg, peer.ip()).await {
                let mut framed = BytesMut::with_capacity(reply.as_slice().len() + 2);
                framed.extend_from_slice(&(reply.as_slice().len() as u16).to_be_bytes());
                framed.extend_from_slice(reply.as_slice());

                let mut writer = writer.lock().await;
                if writer.write_all(&framed).await.is_err() {
                    debug!("client {} went away before the reply", peer);
                }
            }
        });
    }
}

// Everything the pipeline needs after parsing, owned so the producing task
// outlives a cancelled requester.
#[derive(Clone)]
struct RequestContext {
    msg: Message<Bytes>,
    client: IpAddr,
    qname: String,
    qtype: Rtype,
    id: u16,
    fingerprint: Bytes,
}

async fn handle_message(
    inner: &Arc<ServiceInner>,
    msg: Message<Bytes>,
    client: IpAddr,
) -> Option<Message<Bytes>> {
    // We have to ensure the number of queries is larger than 0 as it is a
    // gurantee for the routing code. Not using `query_count()` because it is
    // manually set, and may not be correct.
    let question = match msg.sole_question() {
        Ok(q) => q,
        Err(e) => {
            warn!("DNS message parsing errored: {}, returning SERVFAIL", e);
            return synthesize(&msg, Rcode::ServFail);
        }
    };

    let ctx = RequestContext {
        id: msg.header().id(),
        client,
        qname: normalize_domain(&question.qname().to_string()),
        qtype: question.qtype(),
        fingerprint: fingerprint(&msg)?,
        msg: msg.clone(),
    };

    match resolve(inner, ctx).await {
        Ok(reply) => Some(reply),
        Err(e) => {
            // Catch all failures here and return server fail.
            warn!("upstream encountered error: {}, returning SERVFAIL", e);
            synthesize(&msg, Rcode::ServFail)
        }
    }
}

// Build a minimal answer with the given rcode and RA set.
fn synthesize(msg: &Message<Bytes>, rcode: Rcode) -> Option<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .ok()?
        .start_answer(msg, rcode)
        .ok()?;
    builder.header_mut().set_ra(true);
    Some(builder.into_message())
}

async fn resolve(
    inner: &Arc<ServiceInner>,
    ctx: RequestContext,
) -> std::result::Result<Message<Bytes>, Arc<QHandleError>> {
    let (upstreams, client_cache, network) =
        match inner.router.decide(ctx.client, &ctx.qname, ctx.qtype) {
            Decision::RefusePrivateRdns => {
                return synthesize(&ctx.msg, Rcode::NXDomain)
                    .ok_or_else(|| Arc::new(QHandleError::NoUpstreamAvailable));
            }
            Decision::Forward {
                upstreams,
                client_cache,
                network,
            } => (
                upstreams.to_vec(),
                client_cache.cloned(),
                network.map(|n| n.to_string()).unwrap_or_default(),
            ),
        };

    if let Some(pending) = &inner.pending {
        match pending.acquire(ctx.fingerprint.clone(), network) {
            Ticket::Waiter(slot) => {
                let answer = pending::wait(slot).await.ok_or_else(|| {
                    Arc::new(QHandleError::IoError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "in-flight producer went away",
                    )))
                })??;
                return restamp(&answer, ctx.id).map_err(Arc::new);
            }
            Ticket::Producer(producer) => {
                let id = ctx.id;
                let task_inner = inner.clone();
                let handle = inner.spawn_tracked(async move {
                    let answer = produce(&task_inner, &ctx, upstreams, client_cache).await;
                    producer.complete(answer.clone());
                    answer
                });
                let answer = handle.await.map_err(|e| {
                    Arc::new(QHandleError::IoError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("request task failed: {}", e),
                    )))
                })??;
                return restamp(&answer, id).map_err(Arc::new);
            }
        }
    }

    // Coalescing disabled: still produce in a detached task, so a client
    // going away never cancels the exchange and the caches get filled.
    let id = ctx.id;
    let task_inner = inner.clone();
    let handle = inner
        .spawn_tracked(async move { produce(&task_inner, &ctx, upstreams, client_cache).await });
    let answer = handle.await.map_err(|e| {
        Arc::new(QHandleError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("request task failed: {}", e),
        )))
    })??;
    restamp(&answer, id).map_err(Arc::new)
}

// cache-checked → forwarded → cached. The returned message carries whatever
// transaction ID the source used; callers re-stamp it.
async fn produce(
    inner: &Arc<ServiceInner>,
    ctx: &RequestContext,
    upstreams: Vec<Arc<Upstream>>,
    client_cache: Option<ResponseCache>,
) -> SharedAnswer {
    if let Some(cache) = &client_cache {
        if let Some(hit) = cache.get(&ctx.fingerprint, ctx.id) {
            return Ok(hit);
        }
    }
    if let Some(cache) = &inner.shared_cache {
        if let Some(hit) = cache.get(&ctx.fingerprint, ctx.id) {
            return Ok(hit);
        }
    }

    let answer = match exchange_ranked(&upstreams, &ctx.msg).await {
        Ok(answer) => answer,
        Err(e) => match &inner.fallback {
            Some(fallback) => {
                warn!("primary upstreams failed ({}), consulting fallbacks", e);
                fallback.exchange(&ctx.msg).await.map_err(Arc::new)?
            }
            None => return Err(Arc::new(e)),
        },
    };

    if let Some(cache) = &inner.shared_cache {
        cache.put(ctx.fingerprint.clone(), &answer);
    }
    if let Some(cache) = &client_cache {
        cache.put(ctx.fingerprint.clone(), &answer);
    }

    Ok(answer)
}

fn restamp(msg: &Message<Bytes>, id: u16) -> std::result::Result<Message<Bytes>, QHandleError> {
    let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))?;
    msg.header_mut().set_id(id);
    Ok(Message::from_octets(msg.into_octets().freeze())?)
}
