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

//! Byte-budgeted LRU response caching. The same store type backs both the
//! shared cache and the per-client caches; entries are keyed by the request
//! fingerprint (lower-cased qname, qtype, qclass, DNSSEC-OK bit) and served
//! back with their TTLs decremented by the time spent in the cache.

use crate::{MAX_LEN, MAX_TTL, NEG_MAX_TTL};
use bytes::{BufMut, Bytes, BytesMut};
use clru::{CLruCache, CLruCacheConfig, WeightScale};
use domain::{
    base::{
        iana::Rcode,
        name::ToLabelIter,
        opt::{Opt, OptRecord},
        Message, MessageBuilder, ParsedDname, Rtype,
    },
    rdata::{AllRecordData, Soa},
};
use log::{debug, info};
use std::{
    collections::hash_map::RandomState,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

// Accounting overhead per entry on top of the wire lengths.
const ENTRY_OVERHEAD: usize = 64;

struct CacheRecord {
    created_instant: Instant,
    msg: Message<Bytes>,
    ttl: Duration,
}

impl CacheRecord {
    fn new(msg: Message<Bytes>, ttl: Duration) -> Self {
        Self {
            created_instant: Instant::now(),
            msg,
            ttl,
        }
    }

    fn get(&self) -> Message<Bytes> {
        self.msg.clone()
    }
}

struct MessageWeight;

impl WeightScale<Bytes, CacheRecord> for MessageWeight {
    fn weight(&self, key: &Bytes, value: &CacheRecord) -> usize {
        key.len() + value.msg.as_slice().len() + ENTRY_OVERHEAD
    }
}

/// A byte-budgeted LRU cache for responses.
#[derive(Clone)]
pub struct ResponseCache {
    #[allow(clippy::type_complexity)]
    cache: Arc<Mutex<CLruCache<Bytes, CacheRecord, RandomState, MessageWeight>>>,
}

impl ResponseCache {
    /// Create a store holding at most `size` bytes worth of entries.
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            cache: Arc::new(Mutex::new(CLruCache::with_config(
                CLruCacheConfig::new(size).with_scale(MessageWeight),
            ))),
        }
    }

    /// Store a response under its fingerprint. Responses the TTL rules deem
    /// uncacheable are skipped.
    pub fn put(&self, key: Bytes, msg: &Message<Bytes>) {
        let ttl = match response_ttl(msg) {
            Some(ttl) => ttl,
            None => {
                debug!("response not cacheable, skipping");
                return;
            }
        };

        if self
            .cache
            .lock()
            .unwrap()
            .put_with_weight(key, CacheRecord::new(msg.clone(), ttl))
            .is_err()
        {
            debug!("response larger than the cache budget, skipping");
        }
    }

    /// Fetch a fresh response, re-stamped with the requester's transaction
    /// ID and with its TTLs decremented by the time elapsed since insertion.
    /// Stale entries are evicted and count as a miss.
    pub fn get(&self, key: &Bytes, id: u16) -> Option<Message<Bytes>> {
        let (msg, elapsed) = {
            let mut cache = self.cache.lock().unwrap();
            let (expired, msg, elapsed) = match cache.get(key) {
                Some(r) => {
                    let elapsed = r.created_instant.elapsed();
                    (elapsed > r.ttl, r.get(), elapsed)
                }
                None => return None,
            };
            if expired {
                cache.pop(key);
                return None;
            }
            (msg, elapsed)
        };

        info!("cache hit");
        rewrite(&msg, elapsed.as_secs() as u32, id)
    }
}

/// Compute the fingerprint of a query: lower-cased qname wire format, qtype,
/// qclass, and the DNSSEC-OK bit.
pub(crate) fn fingerprint(msg: &Message<Bytes>) -> Option<Bytes> {
    let question = msg.first_question()?;
    let mut buf = BytesMut::with_capacity(MAX_LEN / 16);

    for label in question.qname().iter_labels() {
        buf.put_u8(label.as_slice().len() as u8);
        buf.extend(label.as_slice().iter().map(u8::to_ascii_lowercase));
    }
    buf.extend_from_slice(&question.qtype().to_int().to_be_bytes());
    buf.extend_from_slice(&question.qclass().to_int().to_be_bytes());
    buf.put_u8(u8::from(msg.opt().map_or(false, |opt| opt.dnssec_ok())));

    Some(buf.freeze())
}

// The cacheability and lifetime of a response. Positive answers live for
// their minimum record TTL clamped to a day; negative answers (NXDOMAIN and
// NODATA) live for the SOA-derived TTL clamped to an hour. A zero TTL or a
// non-cacheable rcode yields None.
fn response_ttl(msg: &Message<Bytes>) -> Option<Duration> {
    let ttl = match msg.header().rcode() {
        Rcode::NoError if msg.header_counts().ancount() > 0 => min_record_ttl(msg)?.min(MAX_TTL),
        Rcode::NoError | Rcode::NXDomain => soa_negative_ttl(msg)?.min(NEG_MAX_TTL),
        _ => return None,
    };

    if ttl == 0 {
        None
    } else {
        Some(Duration::from_secs(u64::from(ttl)))
    }
}

// Minimum TTL across answer, authority, and additional records, OPT excluded.
fn min_record_ttl(msg: &Message<Bytes>) -> Option<u32> {
    let mut min = None;
    let mut section = msg.answer().ok()?;
    loop {
        for rr in (&mut section).flatten() {
            if rr.rtype() != Rtype::Opt {
                min = Some(rr.ttl().min(min.unwrap_or(u32::MAX)));
            }
        }
        section = match section.next_section().ok()? {
            Some(s) => s,
            None => break,
        };
    }
    min
}

// Negative TTL per RFC 2308: the minimum of the authority SOA's TTL and its
// MINIMUM field.
fn soa_negative_ttl(msg: &Message<Bytes>) -> Option<u32> {
    let authority = msg.authority().ok()?;
    let mut min = None;
    for record in authority.limit_to::<Soa<ParsedDname<_>>>().flatten() {
        let ttl = record.ttl().min(record.data().minimum());
        min = Some(ttl.min(min.unwrap_or(u32::MAX)));
    }
    min
}

// Rebuild a message with the given transaction ID and all record TTLs
// decremented. OPT is carried over with its flags instead of a TTL tweak.
// Any failure to reassemble counts as a cache miss.
fn rewrite(msg: &Message<Bytes>, decrement: u32, id: u16) -> Option<Message<Bytes>> {
    let mut target =
        MessageBuilder::from_target(BytesMut::with_capacity(msg.as_slice().len() + 16)).ok()?;
    *target.header_mut() = msg.header();
    target.header_mut().set_id(id);

    let mut question = target.question();
    for q in msg.question().flatten() {
        question.push(q).ok()?;
    }

    let mut source = msg.answer().ok()?;
    let mut answer = question.answer();
    for rr in (&mut source).flatten() {
        let mut rr = rr
            .into_record::<AllRecordData<_, ParsedDname<_>>>()
            .ok()??;
        rr.set_ttl(rr.ttl().saturating_sub(decrement));
        answer.push(rr).ok()?;
    }

    let mut source = source.next_section().ok()??;
    let mut authority = answer.authority();
    for rr in (&mut source).flatten() {
        let mut rr = rr
            .into_record::<AllRecordData<_, ParsedDname<_>>>()
            .ok()??;
        rr.set_ttl(rr.ttl().saturating_sub(decrement));
        authority.push(rr).ok()?;
    }

    let source = source.next_section().ok()??;
    let mut additional = authority.additional();
    for rr in source.flatten() {
        if rr.rtype() == Rtype::Opt {
            let rr = rr.into_record::<Opt<_>>().ok()??;
            let opt = OptRecord::from_record(rr);
            additional
                .opt(|newopt| {
                    newopt.set_udp_payload_size(opt.udp_payload_size());
                    newopt.set_version(opt.version());
                    newopt.set_dnssec_ok(opt.dnssec_ok());
                    Ok(())
                })
                .ok()?;
        } else {
            let mut rr = rr
                .into_record::<AllRecordData<_, ParsedDname<_>>>()
                .ok()??;
            rr.set_ttl(rr.ttl().saturating_sub(decrement));
            additional.push(rr).ok()?;
        }
    }

    Some(additional.into_message())
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, response_ttl, ResponseCache};
    use bytes::{Bytes, BytesMut};
    use domain::{
        base::{iana::Rcode, Dname, Message, MessageBuilder, Record, Rtype},
        rdata::{Soa, A},
    };
    use std::{num::NonZeroUsize, str::FromStr, time::Duration};

    fn query(name: &str, rtype: Rtype, id: u16) -> Message<Bytes> {
        let name = Dname::<Bytes>::from_str(name).unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512)).unwrap();
        builder.header_mut().set_id(id);
        let mut builder = builder.question();
        builder.push((&name, rtype)).unwrap();
        builder.into_message()
    }

    fn answer(query: &Message<Bytes>, ttl: u32) -> Message<Bytes> {
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512))
            .unwrap()
            .start_answer(query, Rcode::NoError)
            .unwrap();
        builder
            .push(Record::new(
                &name,
                domain::base::iana::Class::In,
                ttl,
                A::from_octets(1, 2, 3, 4),
            ))
            .unwrap();
        builder.into_message()
    }

    fn nxdomain(query: &Message<Bytes>, soa_ttl: u32, soa_minimum: u32) -> Message<Bytes> {
        let name = Dname::<Bytes>::from_str("example.com").unwrap();
        let mname = Dname::<Bytes>::from_str("ns1.example.com").unwrap();
        let rname = Dname::<Bytes>::from_str("hostmaster.example.com").unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512))
            .unwrap()
            .start_answer(query, Rcode::NXDomain)
            .unwrap()
            .authority();
        builder
            .push(Record::new(
                &name,
                domain::base::iana::Class::In,
                soa_ttl,
                Soa::new(&mname, &rname, 1.into(), 3600, 900, 86400, soa_minimum),
            ))
            .unwrap();
        builder.into_message()
    }

    #[test]
    fn fingerprint_ignores_case_and_id() {
        let a = fingerprint(&query("Example.COM", Rtype::A, 1)).unwrap();
        let b = fingerprint(&query("example.com", Rtype::A, 999)).unwrap();
        let c = fingerprint(&query("example.com", Rtype::Aaaa, 1)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn positive_ttl_clamped() {
        let q = query("example.com", Rtype::A, 1);
        assert_eq!(
            response_ttl(&answer(&q, 300)),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            response_ttl(&answer(&q, 1_000_000)),
            Some(Duration::from_secs(86400))
        );
        // All-zero TTLs bypass caching.
        assert_eq!(response_ttl(&answer(&q, 0)), None);
    }

    #[test]
    fn negative_ttl_from_soa() {
        let q = query("example.com", Rtype::A, 1);
        assert_eq!(
            response_ttl(&nxdomain(&q, 600, 300)),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            response_ttl(&nxdomain(&q, 600, 7200)),
            Some(Duration::from_secs(600))
        );
        assert_eq!(
            response_ttl(&nxdomain(&q, 7200, 7200)),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn nodata_without_soa_not_cached() {
        let q = query("example.com", Rtype::A, 1);
        let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(512))
            .unwrap()
            .start_answer(&q, Rcode::NoError)
            .unwrap();
        builder.header_mut().set_qr(true);
        assert_eq!(response_ttl(&builder.into_message()), None);
    }

    #[test]
    fn hit_rewrites_id_and_decrements() {
        let cache = ResponseCache::new(NonZeroUsize::new(64 * 1024).unwrap());
        let q = query("example.com", Rtype::A, 21);
        let key = fingerprint(&q).unwrap();
        cache.put(key.clone(), &answer(&q, 300));

        let hit = cache.get(&key, 42).unwrap();
        assert_eq!(hit.header().id(), 42);
        let rr = hit
            .answer()
            .unwrap()
            .limit_to::<A>()
            .next()
            .unwrap()
            .unwrap();
        assert!(rr.ttl() <= 300);
    }

    #[test]
    fn stale_entries_miss() {
        let cache = ResponseCache::new(NonZeroUsize::new(64 * 1024).unwrap());
        let q = query("example.com", Rtype::A, 1);
        let key = fingerprint(&q).unwrap();

        // A response whose minimum TTL rounds the lifetime down to a second.
        cache.put(key.clone(), &answer(&q, 1));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get(&key, 1).is_none());
    }

    #[test]
    fn eviction_keeps_budget() {
        // Budget fits roughly one entry; inserting a second evicts the first.
        let cache = ResponseCache::new(NonZeroUsize::new(200).unwrap());
        let q1 = query("one.example.com", Rtype::A, 1);
        let q2 = query("two.example.com", Rtype::A, 2);
        let (k1, k2) = (fingerprint(&q1).unwrap(), fingerprint(&q2).unwrap());

        cache.put(k1.clone(), &answer(&q1, 300));
        cache.put(k2.clone(), &answer(&q2, 300));
        assert!(cache.get(&k1, 1).is_none());
        assert!(cache.get(&k2, 2).is_some());
    }

    #[test]
    fn errors_not_cached() {
        let cache = ResponseCache::new(NonZeroUsize::new(64 * 1024).unwrap());
        let q = query("example.com", Rtype::A, 1);
        let key = fingerprint(&q).unwrap();
        let failure = MessageBuilder::from_target(BytesMut::with_capacity(512))
            .unwrap()
            .start_answer(&q, Rcode::ServFail)
            .unwrap()
            .into_message();
        cache.put(key.clone(), &failure);
        assert!(cache.get(&key, 1).is_none());
    }
}
