//! Fake-IP DNS server
//!
//! The server claims IPv4/UDP packets addressed to its listener, decides per
//! query whether to answer with a fake address or the upstream's real answer,
//! and remembers fake answers so later connections can recover the domain and
//! routing decision behind a fake address.
//!
//! # Concurrency
//!
//! All cache mutations happen on one task (the server core) that consumes a
//! command channel. Packet ingress, upstream answers, and eviction timers all
//! enter through that channel. Reverse lookups read the fake-session map
//! directly; entries are immutable `Arc` snapshots so readers never observe a
//! half-updated session.
//!
//! ```text
//! input() ──► Query ──┐
//! resolver ─► Response┼──► ServerCore ──► output channel (IPv4/UDP packets)
//! timers ───► Expire* ┘        │
//!                              └──► fake sessions ◄── lookup_session_by_fake_ip()
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Header, Message};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use parking_lot::Mutex;
use smoltcp::wire::IpVersion;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::cache::SessionCache;
use super::config::FakeDnsConfig;
use super::packet::{build_ipv4_udp, parse_ipv4_udp};
use super::pool::AddressPool;
use super::resolver::DnsResolver;
use super::session::{DnsSession, MatchResult};
use crate::error::FakeDnsError;
use crate::rules::{DnsVerdict, MatchPhase, RuleMatcher};
use crate::session::FakeIpLookup;

enum Command {
    Query(DnsSession),
    Response(Bytes),
    ExpireFake { address: Ipv4Addr, generation: u64 },
    ExpirePending { transaction_id: u16, generation: u64 },
    Snapshot(oneshot::Sender<CacheSnapshot>),
    Stop,
}

/// Point-in-time cache sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheSnapshot {
    /// Sessions reachable by fake address
    pub fake_sessions: usize,
    /// Queries awaiting an upstream answer
    pub pending_sessions: usize,
    /// Fake addresses currently allocated
    pub allocated_addresses: usize,
}

/// Tracks which listeners have a live DNS server
///
/// Only one server may answer on a given listener address. Servers built with
/// a registry claim their listener at construction and release it on drop.
#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    claimed: Arc<Mutex<HashSet<SocketAddrV4>>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a listener is claimed
    #[must_use]
    pub fn is_claimed(&self, listen: SocketAddrV4) -> bool {
        self.claimed.lock().contains(&listen)
    }

    fn claim(&self, listen: SocketAddrV4) -> Result<ListenerClaim, FakeDnsError> {
        if !self.claimed.lock().insert(listen) {
            return Err(FakeDnsError::ListenerInUse(listen));
        }
        Ok(ListenerClaim {
            registry: self.clone(),
            listen,
        })
    }
}

#[derive(Debug)]
struct ListenerClaim {
    registry: ListenerRegistry,
    listen: SocketAddrV4,
}

impl Drop for ListenerClaim {
    fn drop(&mut self) {
        self.registry.claimed.lock().remove(&self.listen);
    }
}

/// Builder for [`DnsServer`]
pub struct DnsServerBuilder {
    config: FakeDnsConfig,
    matcher: Option<Arc<dyn RuleMatcher>>,
    resolvers: Vec<Arc<dyn DnsResolver>>,
    registry: Option<ListenerRegistry>,
}

impl DnsServerBuilder {
    /// Rule matcher consulted for each A/CNAME query
    #[must_use]
    pub fn matcher(mut self, matcher: Arc<dyn RuleMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Add an upstream resolver
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Claim the listener in `registry`
    #[must_use]
    pub fn registry(mut self, registry: &ListenerRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Build the server; response packets are sent to `output`
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError::ListenerInUse` if the registry already holds a
    /// server for this listener, or `FakeDnsError::PoolExhausted` if the pool
    /// range has no usable address.
    pub fn build(self, output: mpsc::Sender<Bytes>) -> Result<DnsServer, FakeDnsError> {
        let claim = self
            .registry
            .as_ref()
            .map(|registry| registry.claim(self.config.listen))
            .transpose()?;

        let pool = self
            .config
            .pool
            .map(AddressPool::new)
            .transpose()?
            .map(Arc::new);

        let fake_sessions = Arc::new(SessionCache::new());
        let pending_sessions = Arc::new(SessionCache::new());
        let (commands, receiver) = mpsc::unbounded_channel();

        let core = ServerCore {
            config: self.config.clone(),
            pool: pool.clone(),
            fake_sessions: Arc::clone(&fake_sessions),
            pending_sessions: Arc::clone(&pending_sessions),
            matcher: self.matcher,
            resolvers: self.resolvers,
            output,
            commands: commands.downgrade(),
            inflight: JoinSet::new(),
            generation: 0,
        };

        Ok(DnsServer {
            listen: self.config.listen,
            pool,
            fake_sessions,
            pending_sessions,
            commands,
            core: Mutex::new(Some((core, receiver))),
            stopped: AtomicBool::new(false),
            _claim: claim,
        })
    }
}

/// Fake-IP DNS server handle
///
/// Cheap operations (`input`, reverse lookups) run on the caller; everything
/// that mutates state is forwarded to the server core started by
/// [`DnsServer::start`].
pub struct DnsServer {
    listen: SocketAddrV4,
    pool: Option<Arc<AddressPool>>,
    fake_sessions: Arc<SessionCache<Ipv4Addr>>,
    pending_sessions: Arc<SessionCache<u16>>,
    commands: mpsc::UnboundedSender<Command>,
    core: Mutex<Option<(ServerCore, mpsc::UnboundedReceiver<Command>)>>,
    stopped: AtomicBool,
    _claim: Option<ListenerClaim>,
}

impl fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsServer")
            .field("listen", &self.listen)
            .field("pool", &self.pool.as_ref().map(|p| p.network()))
            .field("fake_sessions", &self.fake_sessions.len())
            .field("pending_sessions", &self.pending_sessions.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl DnsServer {
    /// Start building a server
    #[must_use]
    pub fn builder(config: FakeDnsConfig) -> DnsServerBuilder {
        DnsServerBuilder {
            config,
            matcher: None,
            resolvers: Vec::new(),
            registry: None,
        }
    }

    /// Spawn the server core on the current runtime
    ///
    /// Returns `None` if the server was already started or stopped. Packets
    /// accepted before `start` are queued and processed once it runs.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let (core, receiver) = self.core.lock().take()?;
        info!(
            "FakeDNS server started on {} (pool={:?}, {} resolvers)",
            self.listen,
            self.pool.as_ref().map(|p| p.network()),
            core.resolvers.len()
        );
        Some(tokio::spawn(core.run(receiver)))
    }

    /// Offer a packet from the IP stack
    ///
    /// Returns `true` if the packet was an IPv4/UDP DNS query addressed to
    /// this server's listener and has been taken. Anything else is declined
    /// untouched so other layers can process it.
    pub fn input(&self, packet: &[u8], version: IpVersion) -> bool {
        if version != IpVersion::Ipv4 || self.stopped.load(Ordering::Acquire) {
            return false;
        }

        let Ok(datagram) = parse_ipv4_udp(packet) else {
            return false;
        };
        if datagram.destination != self.listen {
            return false;
        }

        match DnsSession::from_datagram(&datagram) {
            Ok(session) => {
                trace!("FakeDNS received {}", session);
                self.commands.send(Command::Query(session)).is_ok()
            }
            Err(err) => {
                debug!("FakeDNS rejected packet from {}: {}", datagram.source, err);
                false
            }
        }
    }

    /// Listener address
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddrV4 {
        self.listen
    }

    /// Whether `addr` lies in the fake address range
    #[must_use]
    pub fn is_fake_ip(&self, addr: Ipv4Addr) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.contains(addr))
    }

    /// Session that produced the fake address `addr`, if still cached
    #[must_use]
    pub fn lookup_session_by_fake_ip(&self, addr: Ipv4Addr) -> Option<Arc<DnsSession>> {
        self.fake_sessions.get(&addr)
    }

    /// Cache sizes after every previously accepted packet has been processed
    ///
    /// Falls back to reading the caches directly once the core has stopped.
    pub async fn snapshot(&self) -> CacheSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_ok() {
            if let Ok(snapshot) = rx.await {
                return snapshot;
            }
        }
        CacheSnapshot {
            fake_sessions: self.fake_sessions.len(),
            pending_sessions: self.pending_sessions.len(),
            allocated_addresses: self.pool.as_ref().map_or(0, |p| p.allocated_count()),
        }
    }

    /// Stop the server
    ///
    /// Cancels in-flight upstream resolutions and stops every resolver.
    /// Further packets are declined. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some((mut core, _receiver)) = self.core.lock().take() {
            core.shutdown();
        } else {
            let _ = self.commands.send(Command::Stop);
        }
        info!("FakeDNS server on {} stopped", self.listen);
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl FakeIpLookup for DnsServer {
    fn is_fake_ip(&self, addr: Ipv4Addr) -> bool {
        DnsServer::is_fake_ip(self, addr)
    }

    fn lookup_session_by_fake_ip(&self, addr: Ipv4Addr) -> Option<Arc<DnsSession>> {
        DnsServer::lookup_session_by_fake_ip(self, addr)
    }
}

/// State owned by the serialized server task
struct ServerCore {
    config: FakeDnsConfig,
    pool: Option<Arc<AddressPool>>,
    fake_sessions: Arc<SessionCache<Ipv4Addr>>,
    pending_sessions: Arc<SessionCache<u16>>,
    matcher: Option<Arc<dyn RuleMatcher>>,
    resolvers: Vec<Arc<dyn DnsResolver>>,
    output: mpsc::Sender<Bytes>,
    // Weak so that dropping the `DnsServer` ends the core
    commands: mpsc::WeakUnboundedSender<Command>,
    inflight: JoinSet<()>,
    generation: u64,
}

impl ServerCore {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = tokio::select! {
                command = commands.recv() => command,
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!("FakeDNS resolver task panicked: {}", err);
                        }
                    }
                    continue;
                }
            };
            match command {
                Some(Command::Stop) | None => break,
                Some(command) => self.handle(command),
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.inflight.abort_all();
        for resolver in self.resolvers.drain(..) {
            resolver.stop();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Query(session) => self.on_query(session),
            Command::Response(payload) => self.on_response(payload),
            Command::ExpireFake {
                address,
                generation,
            } => self.on_expire_fake(address, generation),
            Command::ExpirePending {
                transaction_id,
                generation,
            } => self.on_expire_pending(transaction_id, generation),
            Command::Snapshot(reply) => {
                let _ = reply.send(CacheSnapshot {
                    fake_sessions: self.fake_sessions.len(),
                    pending_sessions: self.pending_sessions.len(),
                    allocated_addresses: self.pool.as_ref().map_or(0, |p| p.allocated_count()),
                });
            }
            Command::Stop => {}
        }
    }

    fn on_query(&mut self, mut session: DnsSession) {
        if !session.should_match() {
            session.set_match_result(MatchResult::Real);
            self.resolve_remotely(session);
            return;
        }

        let verdict = self.run_match(&mut session, MatchPhase::Domain);
        match verdict {
            DnsVerdict::Fake => {
                if self.assign_fake_ip(&mut session) {
                    self.respond(&session);
                } else {
                    session.set_match_result(MatchResult::Real);
                    self.resolve_remotely(session);
                }
            }
            DnsVerdict::Real | DnsVerdict::Unknown => self.resolve_remotely(session),
            DnsVerdict::Pass => reject_pass(&session, MatchPhase::Domain),
        }
    }

    fn on_response(&mut self, payload: Bytes) {
        let message = match Message::from_vec(&payload) {
            Ok(message) => message,
            Err(err) => {
                debug!("FakeDNS dropped unparsable upstream answer: {}", err);
                return;
            }
        };
        let transaction_id = message.id();

        let Some(pending_query) = self
            .pending_sessions
            .get(&transaction_id)
            .map(|pending| pending.query().clone())
        else {
            debug!(
                tx_id = transaction_id,
                "FakeDNS dropped upstream answer with no pending query"
            );
            return;
        };

        // A reused transaction ID may still receive answers for the query it
        // replaced. Answers without a question section match on the ID alone.
        let same_question = message.queries().first().map_or(true, |q| {
            q.name() == &pending_query.name && q.query_type() == pending_query.record_type
        });
        if !same_question {
            debug!(
                tx_id = transaction_id,
                "FakeDNS dropped upstream answer for a superseded query"
            );
            return;
        }

        let Some(pending) = self.pending_sessions.remove(&transaction_id) else {
            return;
        };
        let mut session = Arc::try_unwrap(pending).unwrap_or_else(|shared| (*shared).clone());
        session.set_real_response(payload);

        if !session.match_result().is_final() {
            match self.run_match(&mut session, MatchPhase::Ip) {
                DnsVerdict::Fake => {
                    if !self.assign_fake_ip(&mut session) {
                        session.set_match_result(MatchResult::Real);
                    }
                }
                DnsVerdict::Real | DnsVerdict::Unknown => {
                    session.set_match_result(MatchResult::Real);
                }
                DnsVerdict::Pass => {
                    reject_pass(&session, MatchPhase::Ip);
                    return;
                }
            }
        }

        self.respond(&session);
    }

    fn on_expire_fake(&mut self, address: Ipv4Addr, generation: u64) {
        if let Some(session) = self.fake_sessions.expire(&address, generation) {
            if let Some(pool) = &self.pool {
                pool.release(address);
            }
            trace!(fake_ip = %address, domain = %session.domain(), "FakeDNS fake session evicted");
        }
    }

    fn on_expire_pending(&mut self, transaction_id: u16, generation: u64) {
        if let Some(session) = self.pending_sessions.expire(&transaction_id, generation) {
            debug!(
                domain = %session.domain(),
                "FakeDNS pending session evicted: {}",
                FakeDnsError::UpstreamTimeout { transaction_id }
            );
        }
    }

    /// Ask the matcher; no verdict means resolve remotely as if `real`
    fn run_match(&self, session: &mut DnsSession, phase: MatchPhase) -> DnsVerdict {
        let matched = self
            .matcher
            .as_ref()
            .and_then(|matcher| matcher.match_dns(session, phase));
        match matched {
            Some(matched) => session.apply_match(matched),
            None => {
                session.set_match_result(MatchResult::Real);
                DnsVerdict::Real
            }
        }
    }

    /// Allocate and cache a fake address; `false` means degrade to real
    fn assign_fake_ip(&mut self, session: &mut DnsSession) -> bool {
        let Some(pool) = &self.pool else {
            debug!(domain = %session.domain(), "FakeDNS has no pool; answering with real data");
            return false;
        };

        let address = match pool.fetch() {
            Ok(address) => address,
            Err(err) => {
                debug!(domain = %session.domain(), "{}; answering with real data", err);
                return false;
            }
        };

        session.set_fake_ip(address, Instant::now() + self.config.fake_ip_ttl);
        session.set_match_result(MatchResult::Fake);

        let generation = self.next_generation();
        let timer = self.schedule(
            self.config.fake_session_lifetime(),
            Command::ExpireFake {
                address,
                generation,
            },
        );
        if let Some(stale) = self
            .fake_sessions
            .insert(address, Arc::new(session.clone()), generation, timer)
        {
            warn!(fake_ip = %address, "FakeDNS replaced live fake session {}", stale);
        }

        debug!(domain = %session.domain(), fake_ip = %address, "FakeDNS assigned fake address");
        true
    }

    fn resolve_remotely(&mut self, session: DnsSession) {
        let transaction_id = session.transaction_id();
        let request = session.request().clone();

        let generation = self.next_generation();
        let timer = self.schedule(
            self.config.pending_session_lifetime,
            Command::ExpirePending {
                transaction_id,
                generation,
            },
        );
        if let Some(previous) =
            self.pending_sessions
                .insert(transaction_id, Arc::new(session), generation, timer)
        {
            debug!(
                tx_id = transaction_id,
                "FakeDNS transaction ID reused; superseded {}", previous
            );
        }

        if self.resolvers.is_empty() {
            warn!(tx_id = transaction_id, "FakeDNS has no upstream resolvers");
            return;
        }

        for resolver in &self.resolvers {
            let resolver = Arc::clone(resolver);
            let request = request.clone();
            let commands = self.commands.clone();
            self.inflight.spawn(async move {
                match resolver.resolve(request).await {
                    Ok(response) => {
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands.send(Command::Response(response));
                        }
                    }
                    Err(err) => debug!("FakeDNS upstream {:?} failed: {}", resolver, err),
                }
            });
        }
    }

    fn respond(&self, session: &DnsSession) {
        let payload = match session.match_result() {
            MatchResult::Fake => match build_fake_response(session, self.config.fake_ip_ttl_secs()) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("FakeDNS dropped answer for {}: {}", session, err);
                    return;
                }
            },
            MatchResult::Real => match session.real_response() {
                Some(payload) => payload.clone(),
                None => {
                    warn!("FakeDNS has no upstream payload for {}", session);
                    return;
                }
            },
            MatchResult::Unset | MatchResult::Unknown => {
                error!("FakeDNS refused to answer undecided session {}", session);
                return;
            }
        };

        let packet = match build_ipv4_udp(self.config.listen, session.source(), &payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("FakeDNS dropped answer for {}: {}", session, err);
                return;
            }
        };

        match self.output.try_send(packet) {
            Ok(()) => trace!("FakeDNS answered {}", session),
            Err(TrySendError::Full(_)) => {
                warn!("FakeDNS output queue full; dropped answer for {}", session);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("FakeDNS output closed; dropped answer for {}", session);
            }
        }
    }

    fn schedule(&self, delay: Duration, command: Command) -> AbortHandle {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command);
            }
        })
        .abort_handle()
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

fn reject_pass(session: &DnsSession, phase: MatchPhase) {
    error!(
        "FakeDNS rule returned 'pass' in {} phase for {}; check the DNS rule configuration",
        phase, session
    );
}

/// Build the A-record answer for a fake session
///
/// # Errors
///
/// Returns `FakeDnsError::ResponseBuild` if the stored request cannot be
/// decoded or the response cannot be encoded.
pub fn build_fake_response(session: &DnsSession, ttl: u32) -> Result<Bytes, FakeDnsError> {
    let request = Message::from_vec(session.request())
        .map_err(|e| FakeDnsError::ResponseBuild(e.to_string()))?;

    let mut response = Message::new();
    response.set_header(Header::response_from_request(request.header()));
    response.set_recursion_available(true);
    if let Some(question) = request.queries().first() {
        response.add_query(question.clone());
    }
    if let Some(address) = session.fake_ip() {
        response.add_answer(Record::from_rdata(
            session.query().name.clone(),
            ttl,
            RData::A(A(address)),
        ));
    }

    response
        .to_vec()
        .map(Bytes::from)
        .map_err(|e| FakeDnsError::ResponseBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakedns::session::tests::{query_packet, CLIENT, LISTENER};
    use crate::rules::{DnsMatch, RuleHandle};
    use async_trait::async_trait;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::RecordType;
    use std::sync::atomic::AtomicUsize;

    /// Answers every query with `answer` after `delay`
    #[derive(Debug)]
    struct ScriptedResolver {
        answer: Ipv4Addr,
        delay: Duration,
        echo_question: bool,
        calls: AtomicUsize,
        stopped: AtomicBool,
    }

    impl ScriptedResolver {
        fn new(answer: Ipv4Addr, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer,
                delay,
                echo_question: true,
                calls: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            })
        }

        /// Answers that leave the question section out
        fn without_question(answer: Ipv4Addr) -> Arc<Self> {
            Arc::new(Self {
                answer,
                delay: Duration::ZERO,
                echo_question: false,
                calls: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DnsResolver for ScriptedResolver {
        async fn resolve(&self, query: Bytes) -> Result<Bytes, FakeDnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let request = Message::from_vec(&query).unwrap();
            let mut response = Message::new();
            response.set_header(Header::response_from_request(request.header()));
            let question = request.queries()[0].clone();
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                30,
                RData::A(A(self.answer)),
            ));
            if self.echo_question {
                response.add_query(question);
            }
            Ok(Bytes::from(response.to_vec().unwrap()))
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn fixed(verdict: DnsVerdict) -> Arc<dyn RuleMatcher> {
        Arc::new(move |_: &DnsSession, _: MatchPhase| {
            Some(DnsMatch {
                verdict,
                rule: Some(RuleHandle::new("fixed")),
                country: None,
            })
        })
    }

    fn config(pool: &str, ttl: u64) -> FakeDnsConfig {
        FakeDnsConfig::new(LISTENER.parse().unwrap())
            .with_pool(pool.parse().unwrap())
            .with_fake_ip_ttl(Duration::from_secs(ttl))
            .with_pending_session_lifetime(Duration::from_secs(5))
    }

    fn decode(packet: &[u8]) -> (SocketAddrV4, SocketAddrV4, Message) {
        let datagram = parse_ipv4_udp(packet).unwrap();
        (
            datagram.source,
            datagram.destination,
            Message::from_vec(datagram.payload).unwrap(),
        )
    }

    fn first_a(message: &Message) -> (Ipv4Addr, u32) {
        let record = &message.answers()[0];
        match record.data() {
            Some(RData::A(a)) => (a.0, record.ttl()),
            other => panic!("expected A record, got {other:?}"),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for answer")
            .expect("output closed")
    }

    #[tokio::test]
    async fn test_fake_answer_scenario() {
        let (tx, mut rx) = mpsc::channel(8);
        let server = DnsServer::builder(config("10.0.0.4/30", 60))
            .matcher(fixed(DnsVerdict::Fake))
            .build(tx)
            .unwrap();
        server.start().unwrap();

        assert!(server.input(&query_packet(0x0101, "example.com", RecordType::A), IpVersion::Ipv4));

        let (src, dst, message) = decode(&recv(&mut rx).await);
        assert_eq!(src, LISTENER.parse().unwrap());
        assert_eq!(dst, CLIENT.parse().unwrap());
        assert_eq!(message.id(), 0x0101);
        assert_eq!(message.message_type(), MessageType::Response);
        assert_eq!(message.answers()[0].name().to_ascii(), "example.com.");
        assert_eq!(first_a(&message), (Ipv4Addr::new(10, 0, 0, 5), 60));

        let fake = Ipv4Addr::new(10, 0, 0, 5);
        assert!(server.is_fake_ip(fake));
        let session = server.lookup_session_by_fake_ip(fake).unwrap();
        assert_eq!(session.domain(), "example.com");
        assert_eq!(session.matched_rule().unwrap().tag(), "fixed");
        assert_eq!(session.match_result(), MatchResult::Fake);
    }

    #[tokio::test]
    async fn test_input_declines_foreign_packets() {
        let (tx, _rx) = mpsc::channel(8);
        let server = DnsServer::builder(config("10.0.0.0/24", 60)).build(tx).unwrap();
        let query = crate::fakedns::session::tests::query_bytes(1, "a.com", RecordType::A);

        let wrong_port =
            build_ipv4_udp(CLIENT.parse().unwrap(), "198.19.0.53:5353".parse().unwrap(), &query)
                .unwrap();
        let wrong_addr =
            build_ipv4_udp(CLIENT.parse().unwrap(), "8.8.8.8:53".parse().unwrap(), &query).unwrap();
        let not_dns =
            build_ipv4_udp(CLIENT.parse().unwrap(), LISTENER.parse().unwrap(), b"junk").unwrap();
        let good = query_packet(1, "a.com", RecordType::A);

        assert!(!server.input(&wrong_port, IpVersion::Ipv4));
        assert!(!server.input(&wrong_addr, IpVersion::Ipv4));
        assert!(!server.input(&not_dns, IpVersion::Ipv4));
        assert!(!server.input(&good[..12], IpVersion::Ipv4));
        assert!(!server.input(&good, IpVersion::Ipv6));
        assert!(server.input(&good, IpVersion::Ipv4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_session_lives_twice_ttl() {
        let (tx, mut rx) = mpsc::channel(8);
        let server = DnsServer::builder(config("10.0.0.4/30", 60))
            .matcher(fixed(DnsVerdict::Fake))
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(1, "example.com", RecordType::A), IpVersion::Ipv4);
        recv(&mut rx).await;
        let fake = Ipv4Addr::new(10, 0, 0, 5);

        tokio::time::sleep(Duration::from_secs(119)).await;
        server.snapshot().await;
        assert!(server.lookup_session_by_fake_ip(fake).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = server.snapshot().await;
        assert!(server.lookup_session_by_fake_ip(fake).is_none());
        assert_eq!(snapshot.fake_sessions, 0);
        assert_eq!(snapshot.allocated_addresses, 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_degrades_to_real() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(93, 184, 216, 34), Duration::ZERO);
        let server = DnsServer::builder(config("10.0.0.9/32", 60))
            .matcher(fixed(DnsVerdict::Fake))
            .resolver(upstream.clone())
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(1, "one.com", RecordType::A), IpVersion::Ipv4);
        let (_, _, first) = decode(&recv(&mut rx).await);
        assert_eq!(first_a(&first).0, Ipv4Addr::new(10, 0, 0, 9));

        server.input(&query_packet(2, "two.com", RecordType::A), IpVersion::Ipv4);
        let (_, _, second) = decode(&recv(&mut rx).await);
        assert_eq!(second.id(), 2);
        assert_eq!(first_a(&second).0, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_a_query_passes_through() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(1, 1, 1, 1), Duration::ZERO);
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Fake))
            .resolver(upstream.clone())
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(9, "example.com", RecordType::AAAA), IpVersion::Ipv4);
        let (_, _, message) = decode(&recv(&mut rx).await);
        assert_eq!(message.id(), 9);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.snapshot().await.fake_sessions, 0);
    }

    #[tokio::test]
    async fn test_unknown_then_ip_phase_fake() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(5, 6, 7, 8), Duration::ZERO);
        let matcher: Arc<dyn RuleMatcher> = Arc::new(|session: &DnsSession, phase: MatchPhase| {
            let verdict = match phase {
                MatchPhase::Domain => DnsVerdict::Unknown,
                MatchPhase::Ip if session.real_ip() == Some(Ipv4Addr::new(5, 6, 7, 8)) => {
                    DnsVerdict::Fake
                }
                MatchPhase::Ip => DnsVerdict::Real,
            };
            Some(DnsMatch {
                verdict,
                rule: Some(RuleHandle::new(phase.to_string())),
                country: Some("JP".into()),
            })
        });
        let server = DnsServer::builder(config("10.0.0.4/30", 60))
            .matcher(matcher)
            .resolver(upstream)
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(4, "video.example", RecordType::A), IpVersion::Ipv4);
        let (_, _, message) = decode(&recv(&mut rx).await);
        let (fake, ttl) = first_a(&message);
        assert_eq!(fake, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ttl, 60);

        let session = server.lookup_session_by_fake_ip(fake).unwrap();
        assert_eq!(session.real_ip(), Some(Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(session.matched_rule().unwrap().tag(), "ip");
        assert_eq!(session.country_code(), Some("JP"));
    }

    #[tokio::test]
    async fn test_unknown_resolves_to_real() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(5, 6, 7, 8), Duration::ZERO);
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Unknown))
            .resolver(upstream)
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(4, "a.example", RecordType::A), IpVersion::Ipv4);
        let (_, _, message) = decode(&recv(&mut rx).await);
        assert_eq!(first_a(&message).0, Ipv4Addr::new(5, 6, 7, 8));
        assert_eq!(server.snapshot().await.fake_sessions, 0);
    }

    #[tokio::test]
    async fn test_answer_without_question_matches_on_transaction_id() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::without_question(Ipv4Addr::new(5, 6, 7, 8));
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Real))
            .resolver(upstream)
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(12, "bare.example", RecordType::A), IpVersion::Ipv4);
        let (_, dst, message) = decode(&recv(&mut rx).await);
        assert_eq!(dst, CLIENT.parse().unwrap());
        assert_eq!(message.id(), 12);
        assert!(message.queries().is_empty());
        assert_eq!(first_a(&message).0, Ipv4Addr::new(5, 6, 7, 8));
        assert_eq!(server.snapshot().await.pending_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_session_times_out_silently() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(3600));
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Real))
            .resolver(upstream)
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(4, "slow.example", RecordType::A), IpVersion::Ipv4);
        assert_eq!(server.snapshot().await.pending_sessions, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(server.snapshot().await.pending_sessions, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_transaction_id_answers_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(1));
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Real))
            .resolver(upstream.clone())
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(77, "first.example", RecordType::A), IpVersion::Ipv4);
        server.input(&query_packet(77, "second.example", RecordType::A), IpVersion::Ipv4);
        assert_eq!(server.snapshot().await.pending_sessions, 1);

        let (_, _, message) = decode(&recv(&mut rx).await);
        assert_eq!(message.queries()[0].name().to_ascii(), "second.example.");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_upstream_answers_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let fast = ScriptedResolver::new(Ipv4Addr::new(1, 1, 1, 1), Duration::ZERO);
        let slow = ScriptedResolver::new(Ipv4Addr::new(2, 2, 2, 2), Duration::from_millis(20));
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Real))
            .resolver(fast)
            .resolver(slow.clone())
            .build(tx)
            .unwrap();
        server.start().unwrap();

        server.input(&query_packet(5, "a.example", RecordType::A), IpVersion::Ipv4);
        let (_, _, message) = decode(&recv(&mut rx).await);
        assert_eq!(first_a(&message).0, Ipv4Addr::new(1, 1, 1, 1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pass_verdict_is_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(1, 1, 1, 1), Duration::ZERO);
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .matcher(fixed(DnsVerdict::Pass))
            .resolver(upstream.clone())
            .build(tx)
            .unwrap();
        server.start().unwrap();

        assert!(server.input(&query_packet(5, "a.example", RecordType::A), IpVersion::Ipv4));
        let snapshot = server.snapshot().await;
        assert_eq!(snapshot.pending_sessions, 0);
        assert_eq!(snapshot.fake_sessions, 0);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_stops_resolvers_and_declines_input() {
        let (tx, _rx) = mpsc::channel(8);
        let upstream = ScriptedResolver::new(Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(60));
        let server = DnsServer::builder(config("10.0.0.0/24", 60))
            .resolver(upstream.clone())
            .build(tx)
            .unwrap();
        let core = server.start().unwrap();

        server.input(&query_packet(5, "a.example", RecordType::A), IpVersion::Ipv4);
        server.snapshot().await;
        server.stop();
        core.await.unwrap();

        assert!(upstream.stopped.load(Ordering::SeqCst));
        assert!(server.is_stopped());
        assert!(!server.input(&query_packet(6, "b.example", RecordType::A), IpVersion::Ipv4));
        assert!(server.start().is_none());
    }

    #[tokio::test]
    async fn test_registry_one_server_per_listener() {
        let registry = ListenerRegistry::new();
        let (tx, _rx) = mpsc::channel(8);

        let first = DnsServer::builder(config("10.0.0.0/24", 60))
            .registry(&registry)
            .build(tx.clone())
            .unwrap();
        assert!(registry.is_claimed(LISTENER.parse().unwrap()));

        let second = DnsServer::builder(config("10.0.0.0/24", 60))
            .registry(&registry)
            .build(tx.clone());
        assert!(matches!(second, Err(FakeDnsError::ListenerInUse(_))));

        drop(first);
        assert!(!registry.is_claimed(LISTENER.parse().unwrap()));
        assert!(DnsServer::builder(config("10.0.0.0/24", 60))
            .registry(&registry)
            .build(tx)
            .is_ok());
    }
}
