//! Delegation walker.
//!
//! Iterative resolution from the root hints down to the servers
//! authoritative for the query name. Each step races the current zone's
//! nameservers through the pool, then classifies the response: a final
//! answer, a referral one zone closer to the target, a CNAME to chase,
//! or a negative result. Glue-less referrals trigger nested resolutions
//! of the nameserver names, sharing the one per-request query budget.
//!
//! When validation is on, every response is handed to the DNSSEC
//! authenticator in walk order together with the zone's DNSKEY RRset and
//! the DS records its parent delivered.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taproot_cache::MessageCache;
use taproot_dnssec::{Authenticator, DeliveredZone, TrustAnchors, Verdict};
use tracing::{debug, instrument, trace, warn};

use super::cname;
use super::hints::root_server_addrs;
use super::ipv6::ipv6_available;
use super::wire;
use super::{Exchanger, ResolverError, Result};

/// Walker configuration.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Exchanges allowed per client request, nested lookups included.
    pub max_queries_per_request: u32,

    /// Cap on servers raced per zone.
    pub desired_nameservers_per_zone: usize,

    /// Resolve glue-less NS names one at a time instead of all at once.
    pub lazy_enrichment: bool,

    /// Feed responses to the DNSSEC authenticator.
    pub enable_dnssec: bool,

    /// Demand that every RRSIG on an RRset verifies, not just one.
    pub require_all_signatures_valid: bool,

    /// Ceiling for validated TTLs, in seconds.
    pub max_allowed_ttl: u32,

    /// Whole-request deadline.
    pub request_timeout: Duration,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            max_queries_per_request: 50,
            desired_nameservers_per_zone: 5,
            lazy_enrichment: true,
            enable_dnssec: false,
            require_all_signatures_valid: false,
            max_allowed_ttl: 172_800,
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// A finished resolution: the response plus the authentication verdict
/// when validation ran.
#[derive(Debug)]
pub struct Resolution {
    /// The response message.
    pub message: Message,

    /// DNSSEC verdict; `None` when validation was off for this request.
    pub verdict: Option<Verdict>,

    /// Validated TTL cap for the answered type, from RFC 4035 §5.3.3.
    /// The cache must not exceed it.
    pub validated_ttl: Option<u32>,
}

/// Cached nameserver addresses for a zone.
#[derive(Debug, Clone)]
struct NsCacheEntry {
    addresses: Vec<SocketAddr>,
    expires_at: Instant,
}

/// Iterative resolver walking the delegation hierarchy.
pub struct DelegationWalker {
    config: WalkerConfig,
    exchanger: Arc<dyn Exchanger>,
    cache: Option<Arc<MessageCache>>,
    trust_anchors: Arc<TrustAnchors>,
    /// Zone apex to known nameserver addresses.
    ns_cache: DashMap<Name, NsCacheEntry>,
}

impl DelegationWalker {
    /// Creates a walker without a message cache.
    pub fn new(
        config: WalkerConfig,
        exchanger: Arc<dyn Exchanger>,
        trust_anchors: Arc<TrustAnchors>,
    ) -> Self {
        Self {
            config,
            exchanger,
            cache: None,
            trust_anchors,
            ns_cache: DashMap::new(),
        }
    }

    /// Creates a walker that consults `cache` while chasing CNAMEs.
    pub fn with_cache(
        config: WalkerConfig,
        exchanger: Arc<dyn Exchanger>,
        trust_anchors: Arc<TrustAnchors>,
        cache: Arc<MessageCache>,
    ) -> Self {
        Self {
            config,
            exchanger,
            cache: Some(cache),
            trust_anchors,
            ns_cache: DashMap::new(),
        }
    }

    /// The walker configuration.
    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    pub(crate) fn cache(&self) -> Option<&Arc<MessageCache>> {
        self.cache.as_ref()
    }

    /// Resolves one question, walking from the root.
    #[instrument(skip(self), fields(qname = %question.name(), qtype = %question.query_type()))]
    pub async fn resolve(&self, question: &Query, do_bit: bool) -> Result<Resolution> {
        self.resolve_with_timeout(question, do_bit, self.config.request_timeout)
            .await
    }

    /// Resolves one question under an explicit timeout. Background
    /// refreshes use this with a deadline tighter than client requests.
    pub async fn resolve_with_timeout(
        &self,
        question: &Query,
        do_bit: bool,
        timeout: Duration,
    ) -> Result<Resolution> {
        let budget = Arc::new(AtomicI64::new(i64::from(self.config.max_queries_per_request)));
        let deadline = Instant::now() + timeout;
        self.resolve_shared(question.clone(), do_bit, budget, deadline)
            .await
    }

    /// Resolution sharing an existing budget and deadline; used by CNAME
    /// branches and glue lookups. Boxed to break async recursion.
    pub(crate) fn resolve_shared(
        &self,
        question: Query,
        do_bit: bool,
        budget: Arc<AtomicI64>,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<Resolution>> {
        async move { self.walk(question, do_bit, budget, deadline).await }.boxed()
    }

    // ------------------------------------------------------------------
    // The walk loop
    // ------------------------------------------------------------------

    async fn walk(
        &self,
        question: Query,
        do_bit: bool,
        budget: Arc<AtomicI64>,
        deadline: Instant,
    ) -> Result<Resolution> {
        let qname = wire::canonical_name(question.name());
        let validating = self.config.enable_dnssec && do_bit;

        let mut authenticator = validating.then(|| {
            Authenticator::with_policy(
                question.clone(),
                self.trust_anchors.clone(),
                self.config.require_all_signatures_valid,
                self.config.max_allowed_ttl,
            )
        });

        // Every walk starts at the root hints.
        let mut current_zone = Name::root();
        let mut servers = root_server_addrs();
        servers.truncate(self.config.desired_nameservers_per_zone.max(1));

        // DS records the parent delivered for `current_zone`.
        let mut pending_ds: Vec<Record> = Vec::new();
        let mut visited: HashSet<(Name, SocketAddr)> = HashSet::new();

        loop {
            if Instant::now() >= deadline {
                return Err(ResolverError::Timeout);
            }
            spend_budget(&budget)?;

            // A zone/server pair showing up twice means the delegation
            // graph led us in a circle.
            let mut any_new = false;
            for server in &servers {
                if visited.insert((current_zone.clone(), *server)) {
                    any_new = true;
                }
            }
            if !any_new {
                return Err(ResolverError::ResolutionLoop {
                    zone: current_zone.to_string(),
                });
            }

            let query = build_query(&question, validating);
            trace!(zone = %current_zone, servers = servers.len(), "querying zone servers");
            let (response, _rtt) = self.exchanger.exchange(&servers, &query).await?;

            if let Some(auth) = authenticator.as_mut() {
                let dnskeys = self
                    .fetch_dnskeys(&current_zone, &servers, &budget, deadline)
                    .await;
                let zone = DeliveredZone::new(current_zone.clone(), dnskeys, pending_ds.clone());
                auth.add_response(Arc::new(zone), response.clone());
            }

            // Terminal: the name does not exist.
            if wire::is_nxdomain(&response) {
                debug!(qname = %qname, "NXDOMAIN");
                return Ok(finish(&question, response, authenticator));
            }

            // Terminal: the answer section addresses the question,
            // directly or through a CNAME.
            let has_direct = wire::records_of_name_and_type_exist(
                response.answers(),
                &qname,
                question.query_type(),
            );
            let has_cname = question.query_type() != RecordType::CNAME
                && wire::records_of_name_and_type_exist(response.answers(), &qname, RecordType::CNAME);

            if has_direct || has_cname {
                let mut resolution = finish(&question, response, authenticator);
                if !has_direct {
                    cname::follow(self, &question, &mut resolution, do_bit, budget, deadline)
                        .await?;
                }
                return Ok(resolution);
            }

            // Referral: NS records for a zone strictly between here and
            // the query name.
            if let Some(referral) = self.referral_in(&response, &current_zone, &qname) {
                let next_servers = self
                    .referral_addresses(&referral, &response, &budget, deadline)
                    .await?;

                self.remember_zone(&referral.zone, &next_servers, referral.ns_ttl);

                trace!(
                    from = %current_zone,
                    to = %referral.zone,
                    servers = next_servers.len(),
                    "following referral"
                );

                pending_ds = referral.ds_records;
                current_zone = referral.zone;
                servers = next_servers;
                servers.truncate(self.config.desired_nameservers_per_zone.max(1));
                continue;
            }

            // A lame referral names the zone we are already in; rotate
            // the server list and try the next one.
            if self.is_lame_referral(&response, &current_zone) {
                warn!(zone = %current_zone, "lame referral, rotating servers");
                servers.rotate_left(1);
                continue;
            }

            // Terminal: NODATA. A true NODATA carries an SOA (or at least
            // no NS set) in authority; leftover NS records here mean a
            // referral we could not use.
            let has_soa = wire::records_of_type_exist(response.name_servers(), RecordType::SOA);
            let has_ns = wire::records_of_type_exist(response.name_servers(), RecordType::NS);
            if wire::is_nodata(&response) && (has_soa || !has_ns) {
                debug!(qname = %qname, "NODATA");
                return Ok(finish(&question, response, authenticator));
            }

            return Err(ResolverError::Protocol(
                "response is neither answer, referral, nor negative".to_string(),
            ));
        }
    }

    // ------------------------------------------------------------------
    // Referral processing
    // ------------------------------------------------------------------

    fn referral_in(
        &self,
        response: &Message,
        current_zone: &Name,
        qname: &Name,
    ) -> Option<Referral> {
        let mut zone: Option<Name> = None;
        let mut ns_names = Vec::new();
        let mut ns_ttl = u32::MAX;

        for record in wire::records_of_type(response.name_servers(), RecordType::NS) {
            let owner = wire::canonical_name(record.name());

            // Bailiwick: the referred zone must sit strictly between the
            // zone we asked and the name we want.
            let moves_closer = current_zone.zone_of(&owner)
                && owner != *current_zone
                && owner.zone_of(qname);
            if !moves_closer {
                trace!(owner = %owner, zone = %current_zone, "ignoring out-of-bailiwick NS record");
                continue;
            }

            if let Some(existing) = &zone {
                // A referral delegates one zone; stray NS sets for other
                // owners are ignored.
                if *existing != owner {
                    continue;
                }
            } else {
                zone = Some(owner);
            }

            if let RData::NS(ns) = record.data() {
                ns_ttl = ns_ttl.min(record.ttl());
                ns_names.push(wire::canonical_name(&ns.0));
            }
        }

        let zone = zone?;
        let ds_records = wire::records_of_name_and_type(response.name_servers(), &zone, RecordType::DS)
            .into_iter()
            .cloned()
            .collect();

        Some(Referral {
            zone,
            ns_names,
            ds_records,
            ns_ttl: if ns_ttl == u32::MAX { 3600 } else { ns_ttl },
        })
    }

    fn is_lame_referral(&self, response: &Message, current_zone: &Name) -> bool {
        wire::records_of_type(response.name_servers(), RecordType::NS)
            .iter()
            .any(|record| wire::canonical_name(record.name()) == *current_zone)
    }

    /// Resolves the addresses behind a referral: glue first, nested
    /// lookups for glue-less NS names second.
    async fn referral_addresses(
        &self,
        referral: &Referral,
        response: &Message,
        budget: &Arc<AtomicI64>,
        deadline: Instant,
    ) -> Result<Vec<SocketAddr>> {
        let want_v6 = ipv6_available();
        let mut addresses = Vec::new();

        for ns_name in &referral.ns_names {
            for record in response.additionals() {
                if wire::canonical_name(record.name()) != *ns_name {
                    continue;
                }
                match record.data() {
                    RData::A(a) => addresses.push(SocketAddr::new(IpAddr::V4(a.0), 53)),
                    RData::AAAA(aaaa) if want_v6 => {
                        addresses.push(SocketAddr::new(IpAddr::V6(aaaa.0), 53));
                    }
                    _ => {}
                }
            }
        }

        if !addresses.is_empty() {
            return Ok(addresses);
        }

        // No glue: a previous walk may have left addresses for this zone
        // in the nameserver cache.
        if let Some(entry) = self.ns_cache.get(&referral.zone) {
            if entry.expires_at > Instant::now() && !entry.addresses.is_empty() {
                trace!(zone = %referral.zone, "using cached nameserver addresses");
                return Ok(entry.addresses.clone());
            }
        }

        // Still nothing: resolve the NS names themselves, on the same
        // budget.
        for ns_name in &referral.ns_names {
            // An NS inside the zone it serves but without glue cannot be
            // reached; skip it rather than loop.
            if referral.zone.zone_of(ns_name) {
                debug!(ns = %ns_name, zone = %referral.zone, "glue-less in-zone NS skipped");
                continue;
            }

            let ns_question = Query::query(ns_name.clone(), RecordType::A);
            match self
                .resolve_shared(ns_question, false, budget.clone(), deadline)
                .await
            {
                Ok(resolution) => {
                    for record in resolution.message.answers() {
                        if let RData::A(a) = record.data() {
                            addresses.push(SocketAddr::new(IpAddr::V4(a.0), 53));
                        }
                    }
                }
                Err(e) => {
                    debug!(ns = %ns_name, error = %e, "nameserver address lookup failed");
                }
            }

            if self.config.lazy_enrichment && !addresses.is_empty() {
                break;
            }
        }

        if addresses.is_empty() {
            return Err(ResolverError::NoNameserversAvailable);
        }
        Ok(addresses)
    }

    // ------------------------------------------------------------------
    // Zone/server bookkeeping
    // ------------------------------------------------------------------

    fn remember_zone(&self, zone: &Name, addresses: &[SocketAddr], ttl: u32) {
        if addresses.is_empty() {
            return;
        }
        self.ns_cache.insert(
            zone.clone(),
            NsCacheEntry {
                addresses: addresses.to_vec(),
                expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );
    }

    /// Fetches the DNSKEY RRset for a zone from its own servers.
    ///
    /// Failures degrade to an empty key set; the authenticator then
    /// classifies the zone instead of the walk failing.
    async fn fetch_dnskeys(
        &self,
        zone: &Name,
        servers: &[SocketAddr],
        budget: &Arc<AtomicI64>,
        deadline: Instant,
    ) -> Vec<Record> {
        if Instant::now() >= deadline || spend_budget(budget).is_err() {
            return Vec::new();
        }

        let question = Query::query(zone.clone(), RecordType::DNSKEY);
        let query = build_query(&question, true);

        match self.exchanger.exchange(servers, &query).await {
            Ok((response, _)) => response.answers().to_vec(),
            Err(e) => {
                debug!(zone = %zone, error = %e, "DNSKEY fetch failed");
                Vec::new()
            }
        }
    }
}

struct Referral {
    zone: Name,
    ns_names: Vec<Name>,
    ds_records: Vec<Record>,
    ns_ttl: u32,
}

fn finish(question: &Query, message: Message, authenticator: Option<Authenticator>) -> Resolution {
    match authenticator {
        Some(mut auth) => {
            let verdict = auth.result();
            let validated_ttl = auth.answer_ttl(question.query_type());
            Resolution {
                message,
                verdict: Some(verdict),
                validated_ttl,
            }
        }
        None => Resolution {
            message,
            verdict: None,
            validated_ttl: None,
        },
    }
}

/// Builds an iterative query: fresh random id, no RD, EDNS at 4096 with
/// the DO bit when validation wants DNSSEC records.
fn build_query(question: &Query, do_bit: bool) -> Message {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(false);
    message.add_query(question.clone());
    wire::set_edns(&mut message, 4096, do_bit);
    message
}

/// Takes one query from the shared budget.
fn spend_budget(budget: &AtomicI64) -> Result<()> {
    if budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
        return Err(ResolverError::QueryBudgetExceeded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::{A, CNAME, NS};
    use parking_lot::Mutex;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn ns_record(owner: &str, target: &str) -> Record {
        Record::from_rdata(name(owner), 172_800, RData::NS(NS(name(target))))
    }

    fn a_record(owner: &str, addr: [u8; 4]) -> Record {
        Record::from_rdata(
            name(owner),
            300,
            RData::A(A::new(addr[0], addr[1], addr[2], addr[3])),
        )
    }

    fn referral_response(zone: &str, ns: &str, glue: [u8; 4]) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_name_server(ns_record(zone, ns));
        message.add_additional(a_record(ns, glue));
        message
    }

    fn answer_response(owner: &str, addr: [u8; 4]) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_authoritative(true);
        message.add_answer(a_record(owner, addr));
        message
    }

    /// Test double: replays a scripted sequence of responses.
    struct ScriptedExchanger {
        script: Mutex<Vec<Message>>,
        calls: AtomicI64,
    }

    impl ScriptedExchanger {
        fn new(mut responses: Vec<Message>) -> Self {
            responses.reverse();
            Self {
                script: Mutex::new(responses),
                calls: AtomicI64::new(0),
            }
        }

        fn calls(&self) -> i64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Exchanger for ScriptedExchanger {
        async fn exchange(
            &self,
            _servers: &[SocketAddr],
            query: &Message,
        ) -> Result<(Message, Duration)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = self
                .script
                .lock()
                .pop()
                .ok_or_else(|| ResolverError::Protocol("script exhausted".to_string()))?;
            response.set_id(query.id());
            for q in query.queries() {
                response.add_query(q.clone());
            }
            Ok((response, Duration::from_millis(1)))
        }
    }

    fn walker(script: Vec<Message>) -> (DelegationWalker, Arc<ScriptedExchanger>) {
        let exchanger = Arc::new(ScriptedExchanger::new(script));
        let walker = DelegationWalker::new(
            WalkerConfig::default(),
            exchanger.clone(),
            Arc::new(TrustAnchors::default()),
        );
        (walker, exchanger)
    }

    #[tokio::test]
    async fn walks_two_referrals_to_an_answer() {
        let (walker, exchanger) = walker(vec![
            referral_response("com.", "a.gtld-servers.net.", [192, 5, 6, 30]),
            referral_response("example.com.", "ns1.example.com.", [192, 0, 2, 53]),
            answer_response("www.example.com.", [203, 0, 113, 5]),
        ]);

        let question = Query::query(name("www.example.com."), RecordType::A);
        let resolution = walker.resolve(&question, false).await.unwrap();

        assert_eq!(resolution.message.answers().len(), 1);
        assert!(resolution.verdict.is_none());
        assert_eq!(exchanger.calls(), 3);
    }

    #[tokio::test]
    async fn nxdomain_terminates_the_walk() {
        let mut nx = Message::new();
        nx.set_message_type(MessageType::Response);
        nx.set_response_code(hickory_proto::op::ResponseCode::NXDomain);

        let (walker, _) = walker(vec![
            referral_response("com.", "a.gtld-servers.net.", [192, 5, 6, 30]),
            nx,
        ]);

        let question = Query::query(name("nonexistent.com."), RecordType::A);
        let resolution = walker.resolve(&question, false).await.unwrap();

        assert!(wire::is_nxdomain(&resolution.message));
    }

    #[tokio::test]
    async fn referral_loop_is_detected() {
        // The same referral repeated forever: same zone, same server.
        let loop_referral = || referral_response("com.", "a.gtld-servers.net.", [192, 5, 6, 30]);
        let script: Vec<Message> = (0..10).map(|_| loop_referral()).collect();

        let (walker, _) = walker(script);
        let question = Query::query(name("www.example.com."), RecordType::A);
        let err = walker.resolve(&question, false).await.unwrap_err();

        assert!(matches!(err, ResolverError::ResolutionLoop { .. }));
    }

    #[tokio::test]
    async fn query_budget_is_enforced() {
        // A referral chain descending one label per step, every zone an
        // ancestor of the query name, far longer than the budget allows.
        let qname = format!("{}com.", "x.".repeat(40));
        let mut script = Vec::new();
        for i in 0..40 {
            let zone = format!("{}com.", "x.".repeat(i));
            script.push(referral_response(&zone, &format!("ns{i}.net."), [192, 5, 6, 30]));
        }

        let exchanger = Arc::new(ScriptedExchanger::new(script));
        let config = WalkerConfig {
            max_queries_per_request: 10,
            request_timeout: Duration::from_secs(30),
            ..WalkerConfig::default()
        };
        let walker = DelegationWalker::new(
            config,
            exchanger.clone(),
            Arc::new(TrustAnchors::default()),
        );

        let question = Query::query(name(&qname), RecordType::A);
        let err = walker.resolve(&question, false).await.unwrap_err();

        assert!(matches!(err, ResolverError::QueryBudgetExceeded));
        assert!(exchanger.calls() <= 10);
    }

    #[tokio::test]
    async fn cname_chain_is_spliced_into_the_answer() {
        let mut cname_response = Message::new();
        cname_response.set_message_type(MessageType::Response);
        cname_response.set_authoritative(true);
        cname_response.add_answer(Record::from_rdata(
            name("www.example.com."),
            300,
            RData::CNAME(CNAME(name("target.example.net."))),
        ));

        let (walker, _) = walker(vec![
            // Main walk: referral then the CNAME.
            referral_response("com.", "a.gtld-servers.net.", [192, 5, 6, 30]),
            cname_response,
            // CNAME branch walk: referral then the A record.
            referral_response("net.", "a.gtld-servers.net.", [192, 5, 6, 30]),
            answer_response("target.example.net.", [203, 0, 113, 5]),
        ]);

        let question = Query::query(name("www.example.com."), RecordType::A);
        let resolution = walker.resolve(&question, false).await.unwrap();

        let answers = resolution.message.answers();
        assert!(wire::records_of_name_and_type_exist(
            answers,
            &name("www.example.com."),
            RecordType::CNAME
        ));
        assert!(wire::records_of_name_and_type_exist(
            answers,
            &name("target.example.net."),
            RecordType::A
        ));
    }

    #[tokio::test]
    async fn out_of_bailiwick_referral_is_ignored() {
        // A referral for "org." while resolving under "com." is garbage;
        // with nothing else in the response the walk errors out.
        let (walker, _) = walker(vec![referral_response(
            "org.",
            "a0.org.afilias-nst.info.",
            [199, 19, 56, 1],
        )]);

        let question = Query::query(name("www.example.com."), RecordType::A);
        let err = walker.resolve(&question, false).await.unwrap_err();

        // The response still carries NS records, so it is not a NODATA;
        // with the referral rejected nothing usable remains.
        match err {
            ResolverError::Protocol(_) => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn budget_spend_stops_at_zero() {
        let budget = AtomicI64::new(2);
        assert!(spend_budget(&budget).is_ok());
        assert!(spend_budget(&budget).is_ok());
        assert!(spend_budget(&budget).is_err());
    }

    #[test]
    fn iterative_queries_do_not_request_recursion() {
        let question = Query::query(name("example.com."), RecordType::A);
        let query = build_query(&question, true);

        assert!(!query.recursion_desired());
        assert!(wire::is_do_set(&query));
        assert_eq!(wire::edns_payload_size(&query), 4096);
    }
}
