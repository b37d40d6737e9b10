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

use super::{init, parser::ConfigError, InitError};
use dsteer::error::{GroupError, SteerError};

#[test]
fn check_example() {
    init(serde_yaml::from_str(include_str!("../configs/example.yaml")).unwrap()).unwrap();
}

#[test]
fn check_fail_no_default() {
    match init(serde_yaml::from_str(include_str!("../configs/fail_no_default.yaml")).unwrap())
        .err()
        .unwrap()
    {
        InitError::Steer(SteerError::GroupError(GroupError::MissingDefault)) => {}
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn check_fail_match_on_default() {
    match init(
        serde_yaml::from_str(include_str!("../configs/fail_match_on_default.yaml")).unwrap(),
    )
    .err()
    .unwrap()
    {
        InitError::Steer(SteerError::GroupError(GroupError::PredefinedWithMatch(name))) => {
            assert_eq!(name, "default")
        }
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn check_fail_bad_prefix() {
    match init(serde_yaml::from_str(include_str!("../configs/fail_bad_prefix.yaml")).unwrap())
        .err()
        .unwrap()
    {
        InitError::Config(ConfigError::UnmaskedPrefix(group, prefix)) => {
            assert_eq!(group, "office");
            assert_eq!(prefix, "10.0.0.1/8");
        }
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn check_fail_dup_match() {
    match init(serde_yaml::from_str(include_str!("../configs/fail_dup_match.yaml")).unwrap())
        .err()
        .unwrap()
    {
        InitError::Steer(SteerError::GroupError(GroupError::DuplicateMatch { domain, .. })) => {
            assert_eq!(domain, "example.com.")
        }
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn check_fail_no_listen() {
    match init(serde_yaml::from_str(include_str!("../configs/fail_no_listen.yaml")).unwrap())
        .err()
        .unwrap()
    {
        InitError::Config(ConfigError::NoListenAddrs) => {}
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn check_fail_cache_size() {
    match init(serde_yaml::from_str(include_str!("../configs/fail_cache_size.yaml")).unwrap())
        .err()
        .unwrap()
    {
        InitError::Config(ConfigError::BadCacheSize("size")) => {}
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn check_fail_empty_match() {
    match init(serde_yaml::from_str(include_str!("../configs/fail_empty_match.yaml")).unwrap())
        .err()
        .unwrap()
    {
        InitError::Steer(SteerError::GroupError(GroupError::EmptyCriterion(name))) => {
            assert_eq!(name, "office")
        }
        e => panic!("Not the right error type: {}", e),
    }
}

#[test]
fn example_starts_and_stops() {
    let yaml =
        include_str!("../configs/example.yaml").replace("127.0.0.1:5355", "127.0.0.1:0");
    let (svc, _) = init(serde_yaml::from_str(&yaml).unwrap()).unwrap();
    tokio_test::block_on(async {
        svc.start().await.unwrap();
        svc.shutdown().await.unwrap();
    });
}

#[test]
fn cache_sizes_ignored_when_disabled() {
    // The same zero size passes once the cache is off.
    let yaml = include_str!("../configs/fail_cache_size.yaml")
        .replace("enabled: true", "enabled: false");
    init(serde_yaml::from_str(&yaml).unwrap()).unwrap();
}
