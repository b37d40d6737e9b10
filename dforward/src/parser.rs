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

//! The YAML configuration schema and its one-shot conversion into the typed
//! service configuration. Durations are plain seconds, sizes plain bytes.

use cidr_utils::cidr::IpCidr;
use dsteer::{
    router::group::{MatchCriteria, UpstreamGroup},
    router::PrivateSubnets,
    service::config::{
        BindRetryConfig, BootstrapConfig, CacheConfig, Config, FallbackConfig,
        PendingRequestsConfig, UpstreamConfig,
    },
};
use log::LevelFilter;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use thiserror::Error;

/// Errors of the schema-level validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The server section lists no addresses.
    #[error("server section: at least one listen address is required")]
    NoListenAddrs,

    /// Cache enabled with a zero or oversized budget.
    #[error("cache section: '{0}' must be between 1 and the machine word limit")]
    BadCacheSize(&'static str),

    /// A section-level timeout is zero.
    #[error("{0} section: the timeout must be positive")]
    NonPositiveTimeout(&'static str),

    /// Retrying bind with a zero interval.
    #[error("bind_retry: the interval must be positive")]
    NonPositiveInterval,

    /// A client prefix failed to parse.
    #[error("group '{0}': '{1}' is not a valid client prefix")]
    BadPrefix(String, String),

    /// A client prefix carries host bits.
    #[error("group '{0}': client prefix '{1}' is not properly masked")]
    UnmaskedPrefix(String, String),
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
#[serde(remote = "LevelFilter")]
enum LevelFilterDef {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

const fn default_verbosity() -> LevelFilter {
    LevelFilter::Info
}

const fn default_timeout() -> u64 {
    2
}

const fn default_retry_interval() -> u64 {
    1
}

const fn default_retry_count() -> u32 {
    4
}

const fn default_shutdown_timeout() -> u64 {
    5
}

#[derive(Deserialize, Clone)]
pub struct LogSection {
    #[serde(with = "LevelFilterDef", default = "default_verbosity")]
    pub verbosity: LevelFilter,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
        }
    }
}

#[derive(Deserialize, Clone, Default)]
pub struct CacheSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub client_size: u64,
}

#[derive(Deserialize, Clone)]
pub struct BindRetrySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retry_interval")]
    pub interval: u64,
    #[serde(default = "default_retry_count")]
    pub count: u32,
}

impl Default for BindRetrySection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_retry_interval(),
            count: default_retry_count(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct PendingRequestsSection {
    pub enabled: bool,
}

impl Default for PendingRequestsSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Deserialize, Clone)]
pub struct ServerSection {
    pub listen_addresses: Vec<SocketAddr>,
    #[serde(default)]
    pub bind_retry: BindRetrySection,
    #[serde(default)]
    pub pending_requests: PendingRequestsSection,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

#[derive(Deserialize, Clone, Default)]
pub struct BootstrapSection {
    #[serde(default)]
    pub servers: Vec<SocketAddr>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Clone)]
pub struct MatchSection {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub question_domain: Option<String>,
}

#[derive(Deserialize, Clone)]
pub struct GroupSection {
    pub address: String,
    #[serde(rename = "match", default)]
    pub matches: Vec<MatchSection>,
}

#[derive(Deserialize, Clone)]
pub struct UpstreamSection {
    pub groups: BTreeMap<String, GroupSection>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Clone, Default)]
pub struct FallbackSection {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Clone)]
pub struct DnsSection {
    #[serde(default)]
    pub cache: CacheSection,
    pub server: ServerSection,
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub fallback: FallbackSection,
}

/// The whole configuration file.
#[derive(Deserialize, Clone)]
pub struct Parsed {
    #[serde(default)]
    pub log: LogSection,
    pub dns: DnsSection,
}

impl Parsed {
    /// Validate the schema-level constraints and produce the typed service
    /// configuration plus the logging verbosity.
    pub fn into_config(self) -> Result<(Config, LevelFilter), ConfigError> {
        let dns = self.dns;

        if dns.server.listen_addresses.is_empty() {
            return Err(ConfigError::NoListenAddrs);
        }
        if dns.server.bind_retry.enabled && dns.server.bind_retry.interval == 0 {
            return Err(ConfigError::NonPositiveInterval);
        }
        if dns.upstream.timeout == 0 {
            return Err(ConfigError::NonPositiveTimeout("upstream"));
        }
        if dns.bootstrap.timeout == 0 {
            return Err(ConfigError::NonPositiveTimeout("bootstrap"));
        }
        if dns.fallback.timeout == 0 {
            return Err(ConfigError::NonPositiveTimeout("fallback"));
        }

        let cache = if dns.cache.enabled {
            CacheConfig {
                enabled: true,
                size: checked_size(dns.cache.size, "size")?,
                client_size: checked_size(dns.cache.client_size, "client_size")?,
            }
        } else {
            // Sizes are ignored entirely when the cache is off.
            CacheConfig::default()
        };

        let mut groups = Vec::with_capacity(dns.upstream.groups.len());
        for (name, section) in &dns.upstream.groups {
            let mut match_criteria = Vec::with_capacity(section.matches.len());
            for m in &section.matches {
                match_criteria.push(MatchCriteria {
                    client: m
                        .client
                        .as_deref()
                        .map(|c| parse_prefix(name, c))
                        .transpose()?,
                    question_domain: m.question_domain.clone(),
                });
            }
            groups.push(UpstreamGroup {
                name: name.as_str().into(),
                address: section.address.clone(),
                match_criteria,
            });
        }

        Ok((
            Config {
                listen_addrs: dns.server.listen_addresses,
                bind_retry: BindRetryConfig {
                    enabled: dns.server.bind_retry.enabled,
                    interval: Duration::from_secs(dns.server.bind_retry.interval),
                    count: dns.server.bind_retry.count,
                },
                pending_requests: PendingRequestsConfig {
                    enabled: dns.server.pending_requests.enabled,
                },
                cache,
                bootstrap: BootstrapConfig {
                    servers: dns.bootstrap.servers,
                    timeout: Duration::from_secs(dns.bootstrap.timeout),
                },
                upstreams: UpstreamConfig {
                    groups,
                    timeout: Duration::from_secs(dns.upstream.timeout),
                },
                fallbacks: FallbackConfig {
                    servers: dns.fallback.servers,
                    timeout: Duration::from_secs(dns.fallback.timeout),
                },
                private_subnets: PrivateSubnets::default(),
                shutdown_timeout: Duration::from_secs(dns.server.shutdown_timeout),
            },
            self.log.verbosity,
        ))
    }
}

fn checked_size(size: u64, field: &'static str) -> Result<usize, ConfigError> {
    match usize::try_from(size) {
        Ok(s) if s >= 1 => Ok(s),
        _ => Err(ConfigError::BadCacheSize(field)),
    }
}

// Parse a client prefix, insisting that no host bits are set.
fn parse_prefix(group: &str, s: &str) -> Result<IpCidr, ConfigError> {
    let bad = || ConfigError::BadPrefix(group.to_string(), s.to_string());

    let (addr_str, bits_str) = match s.split_once('/') {
        Some((a, b)) => (a, Some(b)),
        None => (s, None),
    };
    let addr: IpAddr = addr_str.parse().map_err(|_| bad())?;
    let max_bits = if addr.is_ipv4() { 32 } else { 128 };
    let bits: u8 = match bits_str {
        Some(b) => b.parse().map_err(|_| bad())?,
        None => max_bits,
    };
    if bits > max_bits {
        return Err(bad());
    }

    if !is_masked(addr, bits) {
        return Err(ConfigError::UnmaskedPrefix(
            group.to_string(),
            s.to_string(),
        ));
    }

    IpCidr::from_str(&format!("{}/{}", addr, bits)).map_err(|_| bad())
}

fn is_masked(addr: IpAddr, bits: u8) -> bool {
    match addr {
        IpAddr::V4(a) => bits >= 32 || u32::from(a) & (u32::MAX >> bits) == 0,
        IpAddr::V6(a) => bits >= 128 || u128::from(a) & (u128::MAX >> bits) == 0,
    }
}
