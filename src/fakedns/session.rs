//! Per-query DNS session state
//!
//! A [`DnsSession`] is created when a query packet is accepted and carries
//! everything needed to answer it later: the requester's address, the
//! question, the verdict, and the resolved addresses. Only the DNS server's
//! serialized context mutates a session; caches hold immutable snapshots.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::time::Instant;

use super::packet::UdpDatagram;
use crate::error::FakeDnsError;
use crate::rules::{DnsMatch, DnsVerdict, RuleHandle};

/// Outcome of rule matching for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchResult {
    /// No phase has run yet
    #[default]
    Unset,
    /// Answer with a fake address
    Fake,
    /// Answer with the upstream's response
    Real,
    /// Resolve remotely and decide by address
    Unknown,
}

impl MatchResult {
    /// Whether this result settles the answer without an IP-phase match
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Fake | Self::Real)
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unset => "unset",
            Self::Fake => "fake",
            Self::Real => "real",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The question of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Queried name as it appeared on the wire
    pub name: Name,
    /// Queried record type
    pub record_type: RecordType,
}

/// State of one DNS query from ingress to response
#[derive(Debug, Clone)]
pub struct DnsSession {
    transaction_id: u16,
    query: DnsQuery,
    source: SocketAddrV4,
    request: Bytes,
    match_result: MatchResult,
    fake_ip: Option<Ipv4Addr>,
    real_ip: Option<Ipv4Addr>,
    real_response: Option<Bytes>,
    matched_rule: Option<RuleHandle>,
    country_code: Option<String>,
    expire_at: Option<Instant>,
}

impl DnsSession {
    /// Create a session from a query datagram
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError::MalformedPacket` if the payload is not a DNS
    /// query with at least one question.
    pub fn from_datagram(datagram: &UdpDatagram<'_>) -> Result<Self, FakeDnsError> {
        let message = Message::from_vec(datagram.payload)
            .map_err(|e| FakeDnsError::malformed(format!("dns: {e}")))?;

        if message.message_type() != MessageType::Query {
            return Err(FakeDnsError::malformed("dns message is not a query"));
        }

        let question = message
            .queries()
            .first()
            .ok_or_else(|| FakeDnsError::malformed("dns query has no question"))?;

        Ok(Self {
            transaction_id: message.id(),
            query: DnsQuery {
                name: question.name().clone(),
                record_type: question.query_type(),
            },
            source: datagram.source,
            request: Bytes::copy_from_slice(datagram.payload),
            match_result: MatchResult::Unset,
            fake_ip: None,
            real_ip: None,
            real_response: None,
            matched_rule: None,
            country_code: None,
            expire_at: None,
        })
    }

    /// DNS transaction ID
    #[must_use]
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// The question
    #[must_use]
    pub fn query(&self) -> &DnsQuery {
        &self.query
    }

    /// Queried name as the client wrote it, without the trailing dot
    #[must_use]
    pub fn name(&self) -> String {
        let name = self.query.name.to_ascii();
        match name.strip_suffix('.') {
            Some(stripped) => stripped.to_string(),
            None => name,
        }
    }

    /// Queried domain in lowercase, the form rules match against
    #[must_use]
    pub fn domain(&self) -> String {
        self.name().to_ascii_lowercase()
    }

    /// Whether rules apply to this query type
    ///
    /// Only A and CNAME queries are matched; everything else is passed
    /// through to upstream resolvers.
    #[must_use]
    pub fn should_match(&self) -> bool {
        matches!(self.query.record_type, RecordType::A | RecordType::CNAME)
    }

    /// Address and port the query came from
    #[must_use]
    pub fn source(&self) -> SocketAddrV4 {
        self.source
    }

    /// Raw query payload, forwarded verbatim upstream
    #[must_use]
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// Current match result
    #[must_use]
    pub fn match_result(&self) -> MatchResult {
        self.match_result
    }

    /// Allocated fake address
    #[must_use]
    pub fn fake_ip(&self) -> Option<Ipv4Addr> {
        self.fake_ip
    }

    /// First A answer from the upstream response
    #[must_use]
    pub fn real_ip(&self) -> Option<Ipv4Addr> {
        self.real_ip
    }

    /// Upstream response payload
    #[must_use]
    pub fn real_response(&self) -> Option<&Bytes> {
        self.real_response.as_ref()
    }

    /// Rule that decided this session
    #[must_use]
    pub fn matched_rule(&self) -> Option<&RuleHandle> {
        self.matched_rule.as_ref()
    }

    /// Country code attached by the matching rule
    #[must_use]
    pub fn country_code(&self) -> Option<&str> {
        self.country_code.as_deref()
    }

    /// When the fake answer's TTL runs out
    #[must_use]
    pub fn expire_at(&self) -> Option<Instant> {
        self.expire_at
    }

    pub(crate) fn set_match_result(&mut self, result: MatchResult) {
        self.match_result = result;
    }

    /// Record a rule outcome and return its verdict
    pub(crate) fn apply_match(&mut self, matched: DnsMatch) -> DnsVerdict {
        if matched.rule.is_some() {
            self.matched_rule = matched.rule;
        }
        if matched.country.is_some() {
            self.country_code = matched.country;
        }
        match matched.verdict {
            DnsVerdict::Fake => self.match_result = MatchResult::Fake,
            DnsVerdict::Real => self.match_result = MatchResult::Real,
            DnsVerdict::Unknown => self.match_result = MatchResult::Unknown,
            DnsVerdict::Pass => {}
        }
        matched.verdict
    }

    pub(crate) fn set_fake_ip(&mut self, addr: Ipv4Addr, expire_at: Instant) {
        self.fake_ip = Some(addr);
        self.expire_at = Some(expire_at);
    }

    /// Record the upstream response and extract its first A answer
    pub(crate) fn set_real_response(&mut self, payload: Bytes) {
        self.real_ip = Message::from_vec(&payload).ok().and_then(|message| {
            message.answers().iter().find_map(|record| match record.data() {
                Some(RData::A(a)) => Some(a.0),
                _ => None,
            })
        });
        self.real_response = Some(payload);
    }
}

impl fmt::Display for DnsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} from {} ({})",
            self.transaction_id,
            self.domain(),
            self.query.record_type,
            self.source,
            self.match_result
        )
    }
}
