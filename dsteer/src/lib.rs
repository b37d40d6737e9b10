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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! This is the core library for dforward. It implements the DNS forwarding
//! engine: bootstrap resolution for encrypted upstreams, upstream transports
//! with connection pooling, per-client and per-domain upstream steering,
//! response caching, duplicate-query coalescing, a fallback pool, and the
//! listening service tying them together.

pub mod bootstrap;
pub mod cache;
pub mod error;
pub mod fallback;
#[doc(hidden)]
pub mod mock;
pub mod pending;
pub mod router;
pub mod service;
pub mod upstream;

use compact_str::CompactString;

// Maximum TTL as defined in https://tools.ietf.org/html/rfc2181, 2147483647
//   Setting this to a value of 1 day, in seconds
pub(crate) const MAX_TTL: u32 = 86400_u32;

// Negative responses are kept for at most an hour per RFC 2308.
pub(crate) const NEG_MAX_TTL: u32 = 3600_u32;

// EDNS-friendly maximum payload length.
pub(crate) const MAX_LEN: usize = 1232;

/// The name of an upstream group.
pub type Label = CompactString;

pub use self::{
    router::Router,
    service::{config::Config, DnsService},
    upstream::Upstream,
};
