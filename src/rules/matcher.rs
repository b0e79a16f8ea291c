//! Static, configuration-driven rule matcher

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::debug;

use super::{DnsMatch, DnsVerdict, MatchPhase, RuleHandle, RuleMatcher};
use crate::config::{DnsConfig, DnsRuleConfig};
use crate::error::ConfigError;
use crate::fakedns::DnsSession;

/// One rule: name and address conditions plus the verdict they produce
#[derive(Debug, Clone)]
pub struct StaticRule {
    handle: RuleHandle,
    domains: Vec<String>,
    domain_suffixes: Vec<String>,
    cidrs: Vec<Ipv4Net>,
    verdict: DnsVerdict,
    country: Option<String>,
}

impl StaticRule {
    /// Create a rule with no conditions
    pub fn new(tag: impl AsRef<str>, verdict: DnsVerdict) -> Self {
        Self {
            handle: RuleHandle::new(tag),
            domains: Vec::new(),
            domain_suffixes: Vec::new(),
            cidrs: Vec::new(),
            verdict,
            country: None,
        }
    }

    /// Match this exact domain
    #[must_use]
    pub fn with_domain(mut self, domain: impl AsRef<str>) -> Self {
        self.domains.push(normalize(domain.as_ref()));
        self
    }

    /// Match this domain and all its subdomains
    #[must_use]
    pub fn with_domain_suffix(mut self, suffix: impl AsRef<str>) -> Self {
        self.domain_suffixes.push(normalize(suffix.as_ref()));
        self
    }

    /// Match resolved addresses inside this network
    #[must_use]
    pub fn with_cidr(mut self, cidr: Ipv4Net) -> Self {
        self.cidrs.push(cidr);
        self
    }

    /// Attach a country code to matches of this rule
    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    fn from_config(config: &DnsRuleConfig) -> Self {
        let mut rule = Self::new(&config.tag, config.verdict);
        for domain in &config.domains {
            rule = rule.with_domain(domain);
        }
        for suffix in &config.domain_suffixes {
            rule = rule.with_domain_suffix(suffix);
        }
        rule.cidrs.extend(config.cidrs.iter().copied());
        rule.country.clone_from(&config.country);
        rule
    }

    fn matches_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
            || self.domain_suffixes.iter().any(|suffix| {
                domain == suffix
                    || (domain.len() > suffix.len()
                        && domain.ends_with(suffix.as_str())
                        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
            })
    }

    fn matches_ip(&self, ip: Ipv4Addr) -> bool {
        self.cidrs.iter().any(|net| net.contains(&ip))
    }

    fn to_match(&self) -> DnsMatch {
        DnsMatch {
            verdict: self.verdict,
            rule: Some(self.handle.clone()),
            country: self.country.clone(),
        }
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// Ordered list of rules; the first matching rule wins
#[derive(Debug, Clone, Default)]
pub struct StaticRuleMatcher {
    rules: Vec<StaticRule>,
    default_verdict: Option<DnsVerdict>,
}

impl StaticRuleMatcher {
    /// Create a builder
    #[must_use]
    pub fn builder() -> StaticRuleMatcherBuilder {
        StaticRuleMatcherBuilder::default()
    }

    /// Build the matcher from the DNS configuration section
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any rule yields `pass`.
    pub fn from_config(config: &DnsConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        for rule in &config.rules {
            builder = builder.rule(StaticRule::from_config(rule));
        }
        if let Some(verdict) = config.default_verdict {
            builder = builder.default_verdict(verdict);
        }
        builder.build()
    }

    /// Number of rules
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl RuleMatcher for StaticRuleMatcher {
    fn match_dns(&self, session: &DnsSession, phase: MatchPhase) -> Option<DnsMatch> {
        let hit = match phase {
            MatchPhase::Domain => {
                let domain = session.domain();
                self.rules.iter().find(|r| r.matches_domain(&domain))
            }
            MatchPhase::Ip => session
                .real_ip()
                .and_then(|ip| self.rules.iter().find(|r| r.matches_ip(ip))),
        };

        if let Some(rule) = hit {
            debug!(
                domain = %session.domain(),
                rule = %rule.handle,
                %phase,
                verdict = %rule.verdict,
                "DNS rule matched"
            );
            return Some(rule.to_match());
        }

        self.default_verdict.map(DnsMatch::verdict)
    }
}

/// Builder for [`StaticRuleMatcher`]
#[derive(Debug, Default)]
pub struct StaticRuleMatcherBuilder {
    rules: Vec<StaticRule>,
    default_verdict: Option<DnsVerdict>,
}

impl StaticRuleMatcherBuilder {
    /// Append a rule (lower index wins)
    #[must_use]
    pub fn rule(mut self, rule: StaticRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Verdict used when no rule matches
    #[must_use]
    pub fn default_verdict(mut self, verdict: DnsVerdict) -> Self {
        self.default_verdict = Some(verdict);
        self
    }

    /// Build the matcher
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any rule or the default yields `pass`.
    pub fn build(self) -> Result<StaticRuleMatcher, ConfigError> {
        if let Some(rule) = self.rules.iter().find(|r| r.verdict == DnsVerdict::Pass) {
            return Err(ConfigError::ValidationError(format!(
                "DNS rule '{}' uses verdict 'pass', which is not a DNS decision",
                rule.handle
            )));
        }
        if self.default_verdict == Some(DnsVerdict::Pass) {
            return Err(ConfigError::ValidationError(
                "DNS default verdict 'pass' is not a DNS decision".into(),
            ));
        }
        Ok(StaticRuleMatcher {
            rules: self.rules,
            default_verdict: self.default_verdict,
        })
    }
}
