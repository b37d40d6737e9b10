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

//! The routing table derived from the upstream groups at startup: one
//! per-client configuration per client prefix, plus the fleet-wide entry
//! for the empty prefix and the private-RDNS transports.

use super::{
    group::{self, GroupError, UpstreamGroup, GROUP_DEFAULT, GROUP_PRIVATE},
    rdns::{cidr_bits, cidr_contains},
};
use crate::{
    cache::ResponseCache,
    error::SteerError,
    upstream::{upstream_from_url, Upstream, UpstreamOptions},
};
use cidr_utils::cidr::IpCidr;
use dsuffix::SuffixMap;
use std::{collections::HashMap, net::IpAddr, num::NonZeroUsize, sync::Arc};

/// The per-client upstream configuration: a generic transport list plus the
/// two views of the domain→transports map.
pub(crate) struct ClientConfig {
    pub(crate) generic: Vec<Arc<Upstream>>,
    // Reserved entries allow falling out to the generic list when empty;
    // specified entries pin the query onto the dedicated transports.
    pub(crate) reserved: SuffixMap<Vec<Arc<Upstream>>>,
    pub(crate) specified: SuffixMap<Vec<Arc<Upstream>>>,
    pub(crate) cache: Option<ResponseCache>,
}

impl ClientConfig {
    fn new(cache: Option<ResponseCache>) -> Self {
        Self {
            generic: Vec::new(),
            reserved: SuffixMap::new(),
            specified: SuffixMap::new(),
            cache,
        }
    }

    fn add_generic(&mut self, upstream: Arc<Upstream>) {
        self.generic.push(upstream);
    }

    fn add_domain(&mut self, domain: &str, upstream: Arc<Upstream>) {
        for map in [&mut self.reserved, &mut self.specified] {
            match map.get_mut(domain) {
                Some(list) => list.push(upstream.clone()),
                None => {
                    map.insert(domain, vec![upstream.clone()]);
                }
            }
        }
    }
}

/// The startup-built, read-only routing table.
pub(crate) struct RoutingTable {
    // The empty-prefix entry serving the fleet-wide `default` group.
    pub(crate) wide: ClientConfig,
    // Explicit client prefixes, sorted by descending prefix length so that a
    // linear scan finds the longest match first.
    pub(crate) clients: Vec<(IpCidr, ClientConfig)>,
    // Transports of the `private` group, when configured.
    pub(crate) private: Option<Vec<Arc<Upstream>>>,
}

/// Byte budgets for the caches attached to the table entries.
pub(crate) struct TableCacheConfig {
    pub(crate) client_size: Option<NonZeroUsize>,
}

impl RoutingTable {
    /// Build the table from the groups. Identical endpoint URLs across
    /// groups share one transport. Returns the table together with every
    /// distinct transport for shutdown bookkeeping.
    pub(crate) fn build(
        groups: &[UpstreamGroup],
        opts: &UpstreamOptions,
        cache: &TableCacheConfig,
    ) -> Result<(Self, Vec<Arc<Upstream>>), SteerError> {
        group::validate(groups)?;

        let mut sorted: Vec<&UpstreamGroup> = groups.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut by_url: HashMap<String, Arc<Upstream>> = HashMap::new();
        let mut wide = ClientConfig::new(None);
        let mut clients: Vec<(IpCidr, ClientConfig)> = Vec::new();
        let mut private = None;

        for group in sorted {
            let upstream = match by_url.get(&group.address) {
                Some(u) => u.clone(),
                None => {
                    let u = Arc::new(upstream_from_url(&group.address, opts)?);
                    by_url.insert(group.address.clone(), u.clone());
                    u
                }
            };

            if group.name == GROUP_DEFAULT {
                wide.add_generic(upstream);
                continue;
            }
            if group.name == GROUP_PRIVATE {
                private = Some(vec![upstream]);
                continue;
            }

            for criterion in &group.match_criteria {
                let entry = match &criterion.client {
                    None => &mut wide,
                    Some(prefix) => {
                        if let Some(i) =
                            clients.iter().position(|(c, _)| c == prefix)
                        {
                            &mut clients[i].1
                        } else {
                            clients.push((
                                prefix.clone(),
                                ClientConfig::new(
                                    cache
                                        .client_size
                                        .map(ResponseCache::new),
                                ),
                            ));
                            &mut clients.last_mut().unwrap().1
                        }
                    }
                };

                match &criterion.question_domain {
                    None => entry.add_generic(upstream.clone()),
                    Some(domain) => {
                        entry.add_domain(&group::normalize_domain(domain), upstream.clone())
                    }
                }
            }
        }

        // Longest prefix first; ties ordered by their textual form to keep
        // rebuilds structurally identical.
        clients.sort_by(|(a, _), (b, _)| {
            cidr_bits(b)
                .cmp(&cidr_bits(a))
                .then_with(|| a.to_string().cmp(&b.to_string()))
        });

        let upstreams = by_url.into_values().collect();
        Ok((
            Self {
                wide,
                clients,
                private,
            },
            upstreams,
        ))
    }

    /// Find the per-client configuration under the longest prefix containing
    /// the address, if any.
    pub(crate) fn find(&self, addr: IpAddr) -> Option<(&IpCidr, &ClientConfig)> {
        self.clients
            .iter()
            .find(|(cidr, _)| cidr_contains(cidr, addr))
            .map(|(cidr, conf)| (cidr, conf))
    }
}

#[cfg(test)]
mod tests {
    use super::{RoutingTable, TableCacheConfig};
    use crate::{
        bootstrap::Bootstrap,
        router::group::{GroupError, MatchCriteria, UpstreamGroup},
        upstream::UpstreamOptions,
    };
    use cidr_utils::cidr::IpCidr;
    use std::{sync::Arc, time::Duration};

    fn opts() -> UpstreamOptions {
        UpstreamOptions {
            timeout: Duration::from_secs(1),
            bootstrap: Arc::new(Bootstrap::new(&[], Duration::from_secs(1)).unwrap()),
        }
    }

    fn no_cache() -> TableCacheConfig {
        TableCacheConfig { client_size: None }
    }

    fn group(name: &str, address: &str, criteria: Vec<MatchCriteria>) -> UpstreamGroup {
        UpstreamGroup {
            name: name.into(),
            address: address.to_string(),
            match_criteria: criteria,
        }
    }

    fn criterion(client: Option<&str>, domain: Option<&str>) -> MatchCriteria {
        MatchCriteria {
            client: client.map(|c| IpCidr::from_str(c).unwrap()),
            question_domain: domain.map(str::to_string),
        }
    }

    #[test]
    fn identical_urls_share_a_transport() {
        let groups = [
            group("default", "udp://8.8.8.8:53", vec![]),
            group(
                "dom",
                "udp://8.8.8.8:53",
                vec![criterion(None, Some("example.com"))],
            ),
        ];
        let (table, upstreams) =
            RoutingTable::build(&groups, &opts(), &no_cache()).unwrap();
        assert_eq!(upstreams.len(), 1);
        assert_eq!(table.wide.generic.len(), 1);
        assert!(table.wide.specified.get("example.com.").is_some());
    }

    #[test]
    fn placement_of_predefined_groups() {
        let groups = [
            group("default", "udp://8.8.8.8:53", vec![]),
            group("private", "udp://192.168.1.1:53", vec![]),
        ];
        let (table, upstreams) =
            RoutingTable::build(&groups, &opts(), &no_cache()).unwrap();
        assert_eq!(upstreams.len(), 2);
        assert_eq!(table.wide.generic.len(), 1);
        assert_eq!(table.private.as_ref().unwrap().len(), 1);
        assert!(table.clients.is_empty());
    }

    #[test]
    fn longest_prefix_sorted_first() {
        let groups = [
            group("default", "udp://8.8.8.8:53", vec![]),
            group(
                "wide",
                "udp://1.1.1.1:53",
                vec![criterion(Some("10.0.0.0/8"), None)],
            ),
            group(
                "narrow",
                "udp://9.9.9.9:53",
                vec![criterion(Some("10.0.0.0/24"), None)],
            ),
        ];
        let (table, _) = RoutingTable::build(&groups, &opts(), &no_cache()).unwrap();

        let (cidr, conf) = table.find("10.0.0.7".parse().unwrap()).unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/24");
        assert_eq!(conf.generic[0].url(), "udp://9.9.9.9:53");

        let (cidr, _) = table.find("10.1.0.7".parse().unwrap()).unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");

        assert!(table.find("11.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn duplicate_pair_is_a_build_error() {
        let groups = [
            group("default", "udp://8.8.8.8:53", vec![]),
            group(
                "a",
                "udp://1.1.1.1:53",
                vec![criterion(None, Some("example.com"))],
            ),
            group(
                "b",
                "udp://9.9.9.9:53",
                vec![criterion(None, Some("EXAMPLE.com"))],
            ),
        ];
        match RoutingTable::build(&groups, &opts(), &no_cache()) {
            Err(crate::error::SteerError::GroupError(GroupError::DuplicateMatch {
                ..
            })) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rebuild_is_deterministic() {
        let groups = [
            group("default", "udp://8.8.8.8:53", vec![]),
            group(
                "z",
                "udp://1.1.1.1:53",
                vec![criterion(Some("10.0.0.0/8"), Some("a.example.com"))],
            ),
            group(
                "a",
                "udp://9.9.9.9:53",
                vec![criterion(Some("192.168.0.0/16"), None)],
            ),
        ];
        let (first, _) = RoutingTable::build(&groups, &opts(), &no_cache()).unwrap();
        let (second, _) = RoutingTable::build(&groups, &opts(), &no_cache()).unwrap();

        let shape = |t: &RoutingTable| {
            (
                t.wide.generic.iter().map(|u| u.url().to_string()).collect::<Vec<_>>(),
                t.clients
                    .iter()
                    .map(|(c, conf)| {
                        (
                            c.to_string(),
                            conf.generic.iter().map(|u| u.url().to_string()).collect::<Vec<_>>(),
                        )
                    })
                    .collect::<Vec<_>>(),
            )
        };
        assert_eq!(shape(&first), shape(&second));
    }
}
