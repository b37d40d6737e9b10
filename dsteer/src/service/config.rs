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

//! The validated, typed configuration record the service consumes. Parsing
//! and schema-level validation belong to the enclosing program; the types
//! here are already past that stage.

use crate::router::{group::UpstreamGroup, PrivateSubnets};
use std::{net::SocketAddr, time::Duration};

/// The configuration of a [`DnsService`](super::DnsService).
pub struct Config {
    /// UDP+TCP bind endpoints; at least one.
    pub listen_addrs: Vec<SocketAddr>,
    /// Retrying of failing binds at startup.
    pub bind_retry: BindRetryConfig,
    /// Coalescing of duplicate in-flight requests.
    pub pending_requests: PendingRequestsConfig,
    /// The response cache budgets.
    pub cache: CacheConfig,
    /// The bootstrap resolvers for encrypted upstream hostnames.
    pub bootstrap: BootstrapConfig,
    /// The upstream groups and their exchange timeout.
    pub upstreams: UpstreamConfig,
    /// The fallback upstreams and their exchange timeout.
    pub fallbacks: FallbackConfig,
    /// The networks considered private for reverse-lookup handling.
    pub private_subnets: PrivateSubnets,
    /// How long a shutdown may take before in-flight work is abandoned.
    pub shutdown_timeout: Duration,
}

/// Retrying-bind behaviour for the listeners.
#[derive(Clone)]
pub struct BindRetryConfig {
    /// Whether failing binds are retried at all.
    pub enabled: bool,
    /// The pause between attempts.
    pub interval: Duration,
    /// How many extra attempts are made after the first failure.
    pub count: u32,
}

impl Default for BindRetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(1),
            count: 4,
        }
    }
}

/// Duplicate-request coalescing behaviour.
#[derive(Clone, Default)]
pub struct PendingRequestsConfig {
    /// Whether concurrent duplicates share one upstream exchange.
    pub enabled: bool,
}

/// Cache budgets in bytes. When disabled, the sizes are ignored.
#[derive(Clone, Default)]
pub struct CacheConfig {
    /// Whether responses are cached at all.
    pub enabled: bool,
    /// The shared cache budget in bytes.
    pub size: usize,
    /// The per-client cache budget in bytes, one store per client prefix.
    pub client_size: usize,
}

/// The bootstrap resolver endpoints.
#[derive(Clone)]
pub struct BootstrapConfig {
    /// Plain resolvers consulted in order.
    pub servers: Vec<SocketAddr>,
    /// Cap on each bootstrap exchange.
    pub timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// The upstream groups and their shared exchange timeout.
pub struct UpstreamConfig {
    /// All groups, including the predefined ones.
    pub groups: Vec<UpstreamGroup>,
    /// Cap on each upstream exchange.
    pub timeout: Duration,
}

/// The fallback pool configuration.
#[derive(Clone)]
pub struct FallbackConfig {
    /// Upstream URLs consulted after the primary path fails. May be empty.
    pub servers: Vec<String>,
    /// Cap on each fallback exchange.
    pub timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout: Duration::from_secs(2),
        }
    }
}
