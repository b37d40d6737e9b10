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

//! Upstream groups: a named endpoint plus the match criteria steering
//! requests onto it, and the validation rules the whole set must satisfy.

use crate::Label;
use bytes::Bytes;
use cidr_utils::cidr::IpCidr;
use domain::base::Dname;
use std::{collections::HashSet, str::FromStr};
use thiserror::Error;

/// The group every unmatched request is served by. Exactly one group with
/// this name must exist.
pub const GROUP_DEFAULT: &str = "default";

/// The group serving reverse lookups of private addresses. Optional, but
/// the name is reserved and the group carries no match criteria.
pub const GROUP_PRIVATE: &str = "private";

/// Result alias for group validation.
pub type Result<T> = std::result::Result<T, GroupError>;

/// Error related to the upstream group configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    /// The group list is empty.
    #[error("no upstream groups specified")]
    NoGroups,

    /// No group carries the `default` name.
    #[error("the group '{GROUP_DEFAULT}' must be specified")]
    MissingDefault,

    /// Two groups share one name.
    #[error("the group '{0}' is specified more than once")]
    DuplicateName(Label),

    /// `default` or `private` carries match criteria.
    #[error("the predefined group '{0}' cannot have match criteria")]
    PredefinedWithMatch(Label),

    /// A match criterion has neither a client prefix nor a domain.
    #[error("group '{0}': a match criterion must specify a client or a question domain")]
    EmptyCriterion(Label),

    /// A match criterion carries a malformed domain name.
    #[error("group '{0}': '{1}' is not a valid domain name")]
    InvalidDomain(Label, String),

    /// Two groups produce the same (domain, client prefix) pair.
    #[error("multiple groups match domain '{domain}' for client prefix '{prefix}'")]
    DuplicateMatch {
        /// The clashing question-domain suffix, lower-cased, or empty.
        domain: String,
        /// The clashing client prefix, or empty.
        prefix: String,
    },
}

/// One criterion steering requests onto a group: an optional client prefix
/// and an optional question-domain suffix, at least one of them present.
#[derive(Debug, Clone)]
pub struct MatchCriteria {
    /// The client prefix to match, properly masked.
    pub client: Option<IpCidr>,
    /// The question-domain suffix to match.
    pub question_domain: Option<String>,
}

/// A named bundle of one upstream endpoint and its match criteria.
#[derive(Debug, Clone)]
pub struct UpstreamGroup {
    /// The group name; `default` and `private` are reserved.
    pub name: Label,
    /// The upstream endpoint URL.
    pub address: String,
    /// The criteria steering requests onto this group.
    pub match_criteria: Vec<MatchCriteria>,
}

// Lower-case a domain and give it a trailing dot.
pub(crate) fn normalize_domain(domain: &str) -> String {
    let mut d = domain.to_ascii_lowercase();
    if !d.ends_with('.') {
        d.push('.');
    }
    d
}

/// Check the whole group set: presence and purity of the predefined groups,
/// name uniqueness, criterion well-formedness, and uniqueness of the
/// (domain, client-prefix) pairs across all non-predefined groups.
pub fn validate(groups: &[UpstreamGroup]) -> Result<()> {
    if groups.is_empty() {
        return Err(GroupError::NoGroups);
    }

    let mut names = HashSet::new();
    for group in groups {
        if !names.insert(group.name.clone()) {
            return Err(GroupError::DuplicateName(group.name.clone()));
        }
    }

    if !names.contains(GROUP_DEFAULT) {
        return Err(GroupError::MissingDefault);
    }

    let mut pairs = HashSet::new();
    for group in groups {
        let predefined = group.name == GROUP_DEFAULT || group.name == GROUP_PRIVATE;
        if predefined {
            if !group.match_criteria.is_empty() {
                return Err(GroupError::PredefinedWithMatch(group.name.clone()));
            }
            continue;
        }

        for criterion in &group.match_criteria {
            let domain = match &criterion.question_domain {
                Some(d) => {
                    Dname::<Bytes>::from_str(d.trim_end_matches('.')).map_err(|_| {
                        GroupError::InvalidDomain(group.name.clone(), d.clone())
                    })?;
                    normalize_domain(d)
                }
                None => String::new(),
            };

            if criterion.client.is_none() && domain.is_empty() {
                return Err(GroupError::EmptyCriterion(group.name.clone()));
            }

            let prefix = criterion
                .client
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default();
            if !pairs.insert((domain.clone(), prefix.clone())) {
                return Err(GroupError::DuplicateMatch { domain, prefix });
            }
        }
    }

    Ok(())
}
