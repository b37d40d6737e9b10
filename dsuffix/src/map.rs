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

//! A domain suffix map backed by a reversed-label trie.

use hashbrown::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct LevelNode<T> {
    payload: Option<T>,
    next_lvs: HashMap<Arc<str>, LevelNode<T>>,
}

impl<T> LevelNode<T> {
    fn new() -> Self {
        Self {
            payload: None,
            next_lvs: HashMap::new(),
        }
    }
}

/// Domain suffix map. Keys are domain names; a key matches itself and every
/// name below it. Lookups return the deepest (longest) matching suffix.
/// Labels are compared case-insensitively; trailing dots are ignored.
#[derive(Debug, Clone)]
pub struct SuffixMap<T> {
    root: LevelNode<T>,
}

impl<T> Default for SuffixMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn levels(domain: &str) -> impl Iterator<Item = String> + '_ {
    domain
        .split('.')
        .filter(|lv| !lv.is_empty())
        .rev()
        .map(str::to_ascii_lowercase)
}

impl<T> SuffixMap<T> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            root: LevelNode::new(),
        }
    }

    /// Insert a payload under a domain suffix, replacing and returning any
    /// previous payload stored under the exact same suffix.
    pub fn insert(&mut self, domain: &str, payload: T) -> Option<T> {
        let mut ptr = &mut self.root;
        for lv in levels(domain) {
            ptr = ptr
                .next_lvs
                .entry(Arc::from(lv.as_str()))
                .or_insert_with(LevelNode::new);
        }
        ptr.payload.replace(payload)
    }

    /// Get the payload stored under the exact suffix, if any.
    pub fn get(&self, domain: &str) -> Option<&T> {
        let mut ptr = &self.root;
        for lv in levels(domain) {
            ptr = ptr.next_lvs.get(lv.as_str())?;
        }
        ptr.payload.as_ref()
    }

    /// Get a mutable reference to the payload stored under the exact suffix.
    pub fn get_mut(&mut self, domain: &str) -> Option<&mut T> {
        let mut ptr = &mut self.root;
        for lv in levels(domain) {
            ptr = ptr.next_lvs.get_mut(lv.as_str())?;
        }
        ptr.payload.as_mut()
    }

    /// Match the domain against the inserted suffixes and return the deepest
    /// match together with its depth in labels. If `apple.com` is inserted,
    /// then `www.apple.com` and `stores.www.apple.com` match it at depth 2,
    /// while `apple.cn` does not match.
    pub fn longest_match(&self, domain: &str) -> Option<(usize, &T)> {
        let mut ptr = &self.root;
        let mut depth = 0;
        let mut best = self.root.payload.as_ref().map(|p| (0, p));
        for lv in levels(domain) {
            ptr = match ptr.next_lvs.get(lv.as_str()) {
                Some(v) => v,
                None => break,
            };
            depth += 1;
            if let Some(p) = ptr.payload.as_ref() {
                best = Some((depth, p));
            }
        }
        best
    }

    /// Whether the map contains no suffixes at all.
    pub fn is_empty(&self) -> bool {
        self.root.payload.is_none() && self.root.next_lvs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::SuffixMap;

    #[test]
    fn matches() {
        let mut map = SuffixMap::new();
        map.insert("apple.com", 1);
        map.insert("apple.cn", 2);
        assert_eq!(map.longest_match("store.apple.com"), Some((2, &1)));
        assert_eq!(map.longest_match("store.apple.com."), Some((2, &1)));
        assert_eq!(map.longest_match("baidu.com"), None);
        assert_eq!(map.longest_match("你好.store.www.apple.cn"), Some((2, &2)));
    }

    #[test]
    fn longest_wins() {
        let mut map = SuffixMap::new();
        map.insert("example.com", 1);
        map.insert("test.example.com", 2);
        assert_eq!(map.longest_match("example.com"), Some((2, &1)));
        assert_eq!(map.longest_match("test.example.com"), Some((3, &2)));
        assert_eq!(map.longest_match("deep.test.example.com"), Some((3, &2)));
        assert_eq!(map.longest_match("other.example.com"), Some((2, &1)));
    }

    #[test]
    fn case_and_dots() {
        let mut map = SuffixMap::new();
        map.insert("Example.COM.", 7);
        assert_eq!(map.get("example.com"), Some(&7));
        assert_eq!(map.longest_match("WWW.EXAMPLE.COM."), Some((2, &7)));
    }

    #[test]
    fn replace_and_mutate() {
        let mut map = SuffixMap::new();
        assert_eq!(map.insert("example.com", vec![1]), None);
        assert_eq!(map.insert("example.com", vec![2]), Some(vec![1]));
        map.get_mut("example.com").unwrap().push(3);
        assert_eq!(map.get("example.com"), Some(&vec![2, 3]));
    }

    #[test]
    fn root_catch_all() {
        let mut map = SuffixMap::new();
        map.insert(".", 0);
        map.insert("example.com", 1);
        assert_eq!(map.longest_match("baidu.com"), Some((0, &0)));
        assert_eq!(map.longest_match("www.example.com"), Some((2, &1)));
        assert!(!map.is_empty());
    }

    #[test]
    fn empty() {
        let map: SuffixMap<u32> = SuffixMap::new();
        assert!(map.is_empty());
        assert_eq!(map.longest_match("example.com"), None);
    }
}
