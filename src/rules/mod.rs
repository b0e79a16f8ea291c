//! Rule matching for DNS decisions
//!
//! The DNS server asks a [`RuleMatcher`] twice per query at most: once by the
//! queried name ([`MatchPhase::Domain`]) and, if that phase did not settle the
//! answer, once more by the resolved address ([`MatchPhase::Ip`]).
//!
//! # Example
//!
//! ```
//! use fakeip_relay::rules::{DnsVerdict, StaticRule, StaticRuleMatcher};
//!
//! let matcher = StaticRuleMatcher::builder()
//!     .rule(StaticRule::new("ads", DnsVerdict::Fake).with_domain_suffix("example.com"))
//!     .default_verdict(DnsVerdict::Real)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(matcher.rule_count(), 1);
//! ```

mod matcher;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fakedns::DnsSession;

pub use matcher::{StaticRule, StaticRuleMatcher, StaticRuleMatcherBuilder};

/// Point at which rules are evaluated for a DNS query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchPhase {
    /// Before resolution, by queried name
    Domain,
    /// After resolution, by resolved address
    Ip,
}

impl fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain => write!(f, "domain"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

/// What a rule decides for a DNS query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsVerdict {
    /// Answer with an address from the fake pool
    Fake,
    /// Answer with the upstream's real response
    Real,
    /// Undecided at this phase; resolve remotely and ask again by address
    Unknown,
    /// Not a DNS decision. Reaching the DNS server with it is a configuration error.
    Pass,
}

impl fmt::Display for DnsVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fake => "fake",
            Self::Real => "real",
            Self::Unknown => "unknown",
            Self::Pass => "pass",
        };
        f.write_str(s)
    }
}

impl FromStr for DnsVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fake" => Ok(Self::Fake),
            "real" => Ok(Self::Real),
            "unknown" => Ok(Self::Unknown),
            "pass" => Ok(Self::Pass),
            other => Err(format!("unknown DNS verdict: {other}")),
        }
    }
}

/// Opaque reference to the rule that produced a routing decision
///
/// Cheap to clone; carried from the DNS session into connect sessions so the
/// routing decision made at DNS time is applied to the later connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleHandle(Arc<str>);

impl RuleHandle {
    /// Create a handle for the rule with the given tag
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref()))
    }

    /// The rule's tag
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of evaluating rules against a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMatch {
    /// Decision
    pub verdict: DnsVerdict,
    /// Rule that produced it, if any (the default verdict has none)
    pub rule: Option<RuleHandle>,
    /// Country code attached by the rule
    pub country: Option<String>,
}

impl DnsMatch {
    /// A bare verdict with no rule attached
    #[must_use]
    pub fn verdict(verdict: DnsVerdict) -> Self {
        Self {
            verdict,
            rule: None,
            country: None,
        }
    }
}

/// Rule evaluation consumed by the DNS server
///
/// Returning `None` means no rule applied; the server then resolves remotely
/// as if the verdict were [`DnsVerdict::Real`].
pub trait RuleMatcher: Send + Sync {
    /// Evaluate rules for `session` at `phase`
    fn match_dns(&self, session: &DnsSession, phase: MatchPhase) -> Option<DnsMatch>;
}

impl<F> RuleMatcher for F
where
    F: Fn(&DnsSession, MatchPhase) -> Option<DnsMatch> + Send + Sync,
{
    fn match_dns(&self, session: &DnsSession, phase: MatchPhase) -> Option<DnsMatch> {
        self(session, phase)
    }
}
