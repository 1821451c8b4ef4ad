// Copyright 2021 Stratus Data Systems, Inc.

//! Query interface to the peer-validation policy oracle. The engine never
//! decides authorization itself; it asks the oracle which feeds a host may
//! receive and intersects the answer with what the peer requested.

use std::net::Ipv4Addr;

use crate::types::Feed;

/// The policy oracle's query API.
pub trait FeedPolicy: Send + Sync {
    /// The feeds the given host is allowed to receive. The host is
    /// identified both by name (or dotted-decimal string) and by address.
    fn allowed_feeds(&self, host: &str, addr: Ipv4Addr) -> Vec<Feed>;
}

/// Reduces a requested feed to the part the policy allows.
pub fn reduce_to_allowed(requested: Feed, allowed: &[Feed]) -> Feed {
    let union = allowed.iter().fold(Feed::NONE, |acc, f| acc | *f);
    requested & union
}

/// An in-memory policy: a list of host patterns and the feeds they may
/// receive. A pattern is an exact host string or `"*"` for any host.
#[derive(Default)]
pub struct StaticPolicy {
    rules: Vec<(String, Feed)>,
}

impl StaticPolicy {
    pub fn new() -> StaticPolicy {
        StaticPolicy { rules: Vec::new() }
    }

    pub fn allow(mut self, host: &str, feed: Feed) -> StaticPolicy {
        self.rules.push((String::from(host), feed));
        self
    }

    pub fn allow_any(self, feed: Feed) -> StaticPolicy {
        self.allow("*", feed)
    }
}

impl FeedPolicy for StaticPolicy {
    fn allowed_feeds(&self, host: &str, _addr: Ipv4Addr) -> Vec<Feed> {
        self.rules
            .iter()
            .filter(|(pattern, _)| pattern == "*" || pattern == host)
            .map(|(_, feed)| *feed)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reduction_intersects_with_union_of_allowed() {
        let allowed = [Feed(0x01), Feed(0x02)];
        assert_eq!(reduce_to_allowed(Feed(0x0f), &allowed), Feed(0x03));
        assert_eq!(reduce_to_allowed(Feed(0x0c), &allowed), Feed::NONE);
        assert_eq!(reduce_to_allowed(Feed(0x0f), &[]), Feed::NONE);
    }

    #[test]
    fn static_policy_matches_host_and_wildcard() {
        let policy = StaticPolicy::new()
            .allow("10.1.1.1", Feed(0x01))
            .allow_any(Feed(0x02));

        let addr = Ipv4Addr::new(10, 1, 1, 1);
        assert_eq!(
            policy.allowed_feeds("10.1.1.1", addr),
            vec![Feed(0x01), Feed(0x02)]
        );
        assert_eq!(
            policy.allowed_feeds("10.9.9.9", addr),
            vec![Feed(0x02)]
        );
    }
}
