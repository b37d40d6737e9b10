// Copyright 2020 LEXUGE
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
//! This is a simple algorithm mapping domain name suffixes to arbitrary payloads.
//!
//! Features:
//!
//! -  Longest-suffix lookups with per-match depth
//! -  Minimal dependencies
//!
//! # Getting Started
//!
//! ```
//! use dsuffix::SuffixMap;
//! let mut map: SuffixMap<u32> = SuffixMap::new();
//! map.insert("apple.com", 1);
//! assert_eq!(map.longest_match("store.apple.com"), Some((2, &1)));
//! ```

pub mod map;

pub use map::SuffixMap;
