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

use bytes::{Bytes, BytesMut};
use domain::{
    base::{iana::Rcode, Dname, Message, MessageBuilder, Rtype},
    rdata::A,
};
use dsteer::{
    mock::Server,
    router::group::{MatchCriteria, UpstreamGroup},
    router::PrivateSubnets,
    service::config::{
        BindRetryConfig, BootstrapConfig, CacheConfig, Config, FallbackConfig,
        PendingRequestsConfig, UpstreamConfig,
    },
    DnsService,
};
use std::{
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::{atomic::AtomicUsize, atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    time::timeout,
};
use tokio_test::assert_ok;

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

async fn mock_tcp(marker: &str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(marker.parse().unwrap());
    let hits = server.hits();
    tokio::spawn(server.run_tcp(listener));
    (addr, hits)
}

async fn mock_tcp_slow(marker: &str, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(marker.parse().unwrap()).with_delay(delay);
    let hits = server.hits();
    tokio::spawn(server.run_tcp(listener));
    (addr, hits)
}

fn query(name: &str, rtype: Rtype, id: u16) -> Message<Bytes> {
    let name = Dname::<Bytes>::from_str(name).unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512)).unwrap();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    builder.push((&name, rtype)).unwrap();
    builder.into_message()
}

fn marker_of(msg: &Message<Bytes>) -> Ipv4Addr {
    msg.answer()
        .unwrap()
        .limit_to::<A>()
        .next()
        .unwrap()
        .unwrap()
        .data()
        .addr()
}

async fn ask(server: SocketAddr, msg: &Message<Bytes>) -> Message<Bytes> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket.send(msg.as_slice()).await.unwrap();

    let mut buf = vec![0; 4096];
    let len = timeout(TEST_TIMEOUT, socket.recv(&mut buf)).await.unwrap().unwrap();
    buf.truncate(len);
    Message::from_octets(Bytes::from(buf)).unwrap()
}

fn group(name: &str, addr: SocketAddr, criteria: Vec<MatchCriteria>) -> UpstreamGroup {
    UpstreamGroup {
        name: name.into(),
        address: format!("tcp://{}", addr),
        match_criteria: criteria,
    }
}

fn domain_criterion(domain: &str) -> MatchCriteria {
    MatchCriteria {
        client: None,
        question_domain: Some(domain.to_string()),
    }
}

fn config(groups: Vec<UpstreamGroup>) -> Config {
    Config {
        listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
        bind_retry: BindRetryConfig::default(),
        pending_requests: PendingRequestsConfig { enabled: true },
        cache: CacheConfig::default(),
        bootstrap: BootstrapConfig::default(),
        upstreams: UpstreamConfig {
            groups,
            timeout: Duration::from_secs(1),
        },
        fallbacks: FallbackConfig::default(),
        private_subnets: PrivateSubnets::default(),
        shutdown_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn question_domain_steers_queries() {
    let (default_addr, _) = mock_tcp("1.1.1.1").await;
    let (dom_addr, _) = mock_tcp("2.2.2.2").await;

    let svc = DnsService::new(config(vec![
        group("default", default_addr, vec![]),
        group("dom", dom_addr, vec![domain_criterion("test.example.com")]),
    ]))
    .unwrap();
    svc.start().await.unwrap();
    let listen = svc.udp_addrs()[0];

    let plain = ask(listen, &query("example.com", Rtype::A, 100)).await;
    assert_eq!(plain.header().id(), 100);
    assert_eq!(marker_of(&plain), Ipv4Addr::new(1, 1, 1, 1));

    let steered = ask(listen, &query("test.example.com", Rtype::A, 101)).await;
    assert_eq!(marker_of(&steered), Ipv4Addr::new(2, 2, 2, 2));

    assert_ok!(svc.shutdown().await);
}

#[tokio::test]
async fn concurrent_duplicates_share_one_exchange() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const CLIENTS: u16 = 1000;

    let (slow_addr, hits) = mock_tcp_slow("7.7.7.7", Duration::from_secs(1)).await;
    let svc = DnsService::new(config(vec![group("default", slow_addr, vec![])])).unwrap();
    svc.start().await.unwrap();
    let listen = svc.tcp_addrs()[0];

    // Pipeline a thousand identical queries (distinct transaction IDs) over
    // one connection while the upstream is still chewing on the first.
    let mut stream = tokio::net::TcpStream::connect(listen).await.unwrap();
    for id in 0..CLIENTS {
        let q = query("example.com", Rtype::A, id);
        let mut framed = BytesMut::with_capacity(q.as_slice().len() + 2);
        framed.extend_from_slice(&(q.as_slice().len() as u16).to_be_bytes());
        framed.extend_from_slice(q.as_slice());
        stream.write_all(&framed).await.unwrap();
    }

    let mut seen = Vec::with_capacity(usize::from(CLIENTS));
    for _ in 0..CLIENTS {
        let mut len = [0; 2];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut len))
            .await
            .unwrap()
            .unwrap();
        let mut buf = vec![0; usize::from(u16::from_be_bytes(len))];
        stream.read_exact(&mut buf).await.unwrap();
        let reply = Message::from_octets(Bytes::from(buf)).unwrap();
        // Every waiter gets its own transaction ID back.
        assert_eq!(marker_of(&reply), Ipv4Addr::new(7, 7, 7, 7));
        seen.push(reply.header().id());
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..CLIENTS).collect::<Vec<_>>());

    assert_eq!(hits.load(Ordering::SeqCst), 1);

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn fallback_answers_and_fills_the_cache() {
    // The primary points at a dead TCP port.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (fallback_addr, fallback_hits) = mock_tcp("8.8.4.4").await;

    let mut conf = config(vec![group("default", dead_addr, vec![])]);
    conf.upstreams.timeout = Duration::from_millis(300);
    conf.cache = CacheConfig {
        enabled: true,
        size: 64 * 1024,
        client_size: 4 * 1024,
    };
    conf.fallbacks = FallbackConfig {
        servers: vec![format!("tcp://{}", fallback_addr)],
        timeout: Duration::from_secs(1),
    };

    let svc = DnsService::new(conf).unwrap();
    svc.start().await.unwrap();
    let listen = svc.udp_addrs()[0];

    let first = ask(listen, &query("example.com", Rtype::A, 31)).await;
    assert_eq!(first.header().rcode(), Rcode::NoError);
    assert_eq!(marker_of(&first), Ipv4Addr::new(8, 8, 4, 4));
    assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);

    // The fallback answer went into the cache: no further exchange.
    let second = ask(listen, &query("example.com", Rtype::A, 32)).await;
    assert_eq!(second.header().id(), 32);
    assert_eq!(marker_of(&second), Ipv4Addr::new(8, 8, 4, 4));
    assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn cached_ttls_count_down() {
    let (addr, hits) = mock_tcp("6.6.6.6").await;
    let mut conf = config(vec![group("default", addr, vec![])]);
    conf.cache = CacheConfig {
        enabled: true,
        size: 64 * 1024,
        client_size: 4 * 1024,
    };

    let svc = DnsService::new(conf).unwrap();
    svc.start().await.unwrap();
    let listen = svc.udp_addrs()[0];

    let first = ask(listen, &query("example.com", Rtype::A, 41)).await;
    let first_ttl = first
        .answer()
        .unwrap()
        .limit_to::<A>()
        .next()
        .unwrap()
        .unwrap()
        .ttl();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = ask(listen, &query("example.com", Rtype::A, 42)).await;
    let second_ttl = second
        .answer()
        .unwrap()
        .limit_to::<A>()
        .next()
        .unwrap()
        .unwrap()
        .ttl();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(second_ttl < first_ttl);

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let (addr, _) = mock_tcp("1.1.1.1").await;
    let svc = DnsService::new(config(vec![group("default", addr, vec![])])).unwrap();
    svc.start().await.unwrap();
    let listen = svc.udp_addrs()[0];

    ask(listen, &query("example.com", Rtype::A, 51)).await;

    let started = std::time::Instant::now();
    svc.shutdown().await.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(2));

    // No more answers after shutdown.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(listen).await.unwrap();
    socket
        .send(query("example.com", Rtype::A, 52).as_slice())
        .await
        .unwrap();
    let mut buf = vec![0; 512];
    let res = timeout(Duration::from_millis(500), socket.recv(&mut buf)).await;
    assert!(matches!(res, Err(_) | Ok(Err(_))));
}

#[tokio::test]
async fn tcp_listener_serves_pipelined_queries() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (addr, _) = mock_tcp("5.5.5.5").await;
    let svc = DnsService::new(config(vec![group("default", addr, vec![])])).unwrap();
    svc.start().await.unwrap();
    let listen = svc.tcp_addrs()[0];

    let mut stream = tokio::net::TcpStream::connect(listen).await.unwrap();

    // Two queries back to back on one connection.
    for id in [61u16, 62] {
        let q = query("example.com", Rtype::A, id);
        let mut framed = BytesMut::with_capacity(q.as_slice().len() + 2);
        framed.extend_from_slice(&(q.as_slice().len() as u16).to_be_bytes());
        framed.extend_from_slice(q.as_slice());
        stream.write_all(&framed).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        let mut len = [0; 2];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut len))
            .await
            .unwrap()
            .unwrap();
        let mut buf = vec![0; usize::from(u16::from_be_bytes(len))];
        stream.read_exact(&mut buf).await.unwrap();
        let reply = Message::from_octets(Bytes::from(buf)).unwrap();
        assert_eq!(marker_of(&reply), Ipv4Addr::new(5, 5, 5, 5));
        seen.push(reply.header().id());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![61, 62]);

    svc.shutdown().await.unwrap();
}
