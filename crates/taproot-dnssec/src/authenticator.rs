//! The chain-of-trust authenticator.
//!
//! One authenticator lives for one resolution. The walker appends
//! `(zone, message)` pairs in root-to-qname order as the delegation
//! proceeds; processing is deferred until [`Authenticator::result`] so
//! the walker never pays validation latency mid-walk.

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, trace, warn};

use super::denial::{classify_denial, DenialOfExistenceState};
use super::signatures::{establish_zone_keys, extract_ds, group_section, verify_rrset, SignatureOutcome};
use super::{AuthenticationResult, DnssecError, TrustAnchors, ZoneInfo};

/// The authenticator's final output.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Overall authentication state.
    pub state: AuthenticationResult,
    /// Denial-of-existence classification backing the state.
    pub denial: DenialOfExistenceState,
    /// The error that forced a non-Secure state, when there was one.
    pub error: Option<DnssecError>,
}

/// Authentication outcome for a single zone in the chain.
#[derive(Debug, Clone)]
pub struct ZoneResult {
    pub(crate) zone_name: Name,
    pub(crate) state: AuthenticationResult,
    pub(crate) denial: DenialOfExistenceState,
    pub(crate) answer: Vec<SignatureOutcome>,
    pub(crate) authority: Vec<SignatureOutcome>,
    pub(crate) error: Option<DnssecError>,
    pub(crate) message: Message,
}

impl ZoneResult {
    /// The zone this result belongs to.
    pub fn zone_name(&self) -> &Name {
        &self.zone_name
    }

    /// The zone's authentication state.
    pub fn state(&self) -> AuthenticationResult {
        self.state
    }

    /// The denial-of-existence classification for the zone's response.
    pub fn denial(&self) -> DenialOfExistenceState {
        self.denial
    }
}

struct PendingInput {
    zone: Arc<dyn ZoneInfo>,
    message: Message,
}

/// Tracks per-zone authentication results for one resolution.
pub struct Authenticator {
    question: Query,
    trust_anchors: Arc<TrustAnchors>,
    require_all_signatures_valid: bool,
    max_allowed_ttl: u32,
    inputs: Vec<PendingInput>,
    processed: usize,
    results: Vec<ZoneResult>,
    ordering_violated: Option<DnssecError>,
}

impl Authenticator {
    /// Creates an authenticator for one question with default policy.
    pub fn new(question: Query, trust_anchors: Arc<TrustAnchors>) -> Self {
        Self::with_policy(question, trust_anchors, false, 172_800)
    }

    /// Creates an authenticator with explicit signature policy and TTL cap.
    pub fn with_policy(
        question: Query,
        trust_anchors: Arc<TrustAnchors>,
        require_all_signatures_valid: bool,
        max_allowed_ttl: u32,
    ) -> Self {
        Self {
            question,
            trust_anchors,
            require_all_signatures_valid,
            max_allowed_ttl,
            inputs: Vec::new(),
            processed: 0,
            results: Vec::new(),
            ordering_violated: None,
        }
    }

    /// Queues a zone response for processing.
    ///
    /// Responses must arrive in root-to-qname order; the violation is
    /// detected at processing time and poisons the verdict.
    pub fn add_response(&mut self, zone: Arc<dyn ZoneInfo>, message: Message) {
        trace!(zone = %zone.name(), "queued response for authentication");
        self.inputs.push(PendingInput { zone, message });
    }

    /// Number of responses queued so far.
    pub fn pending(&self) -> usize {
        self.inputs.len() - self.processed
    }

    /// Processes all queued responses and computes the verdict.
    #[instrument(skip(self), fields(question = %self.question.name()))]
    pub fn result(&mut self) -> Verdict {
        while self.processed < self.inputs.len() {
            let idx = self.processed;
            self.processed += 1;

            let zone = self.inputs[idx].zone.clone();
            let message = self.inputs[idx].message.clone();
            self.process_response(zone.as_ref(), message);
        }

        self.verdict()
    }

    /// Validated TTL for answered records of `rtype`, from the most
    /// recent zone result. Returns `None` when no verified signature
    /// covers the type.
    pub fn answer_ttl(&self, rtype: RecordType) -> Option<u32> {
        self.results
            .last()
            .and_then(|last| result_ttl(rtype, &last.answer, self.max_allowed_ttl))
    }

    /// Validated TTL for authority records of `rtype`.
    pub fn authority_ttl(&self, rtype: RecordType) -> Option<u32> {
        self.results
            .last()
            .and_then(|last| result_ttl(rtype, &last.authority, self.max_allowed_ttl))
    }

    /// The per-zone results accumulated so far (root first).
    pub fn zone_results(&self) -> &[ZoneResult] {
        &self.results
    }

    // ------------------------------------------------------------------
    // Per-zone processing
    // ------------------------------------------------------------------

    fn process_response(&mut self, zone: &dyn ZoneInfo, message: Message) {
        let zone_name = zone.name().to_lowercase();

        // Enforce root-to-qname ordering: each zone must be within the
        // previously processed zone.
        if let Some(prev) = self.results.last() {
            if !prev.zone_name.zone_of(&zone_name) {
                warn!(
                    prev = %prev.zone_name,
                    zone = %zone_name,
                    "zone response added out of delegation order"
                );
                let err = DnssecError::OutOfOrderZone {
                    zone: zone_name.to_string(),
                };
                self.ordering_violated = Some(err.clone());
                self.results.push(ZoneResult {
                    zone_name,
                    state: AuthenticationResult::Unknown,
                    denial: DenialOfExistenceState::NotFound,
                    answer: Vec::new(),
                    authority: Vec::new(),
                    error: Some(err),
                    message,
                });
                return;
            }
        }

        let now = unix_now();
        let denial = classify_denial(&message, &self.question);

        let parent_ds = if zone_name.is_root() {
            self.trust_anchors.ds_records().to_vec()
        } else {
            extract_ds(zone.ds_from_parent())
        };

        if parent_ds.is_empty() {
            // No DS provable at the parent: the zone is unsigned from our
            // point of view. Whether that is acceptable is decided by the
            // verdict, which checks the parent's denial of existence.
            debug!(zone = %zone_name, denial = %denial, "no DS delivered; zone treated as insecure");
            self.results.push(ZoneResult {
                zone_name,
                state: AuthenticationResult::Insecure,
                denial,
                answer: Vec::new(),
                authority: Vec::new(),
                error: None,
                message,
            });
            return;
        }

        let keys = match establish_zone_keys(
            &zone_name,
            zone.dnskeys(),
            &parent_ds,
            now,
            self.require_all_signatures_valid,
        ) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(zone = %zone_name, error = %err, "zone key establishment failed");
                self.results.push(ZoneResult {
                    zone_name,
                    state: AuthenticationResult::Bogus,
                    denial,
                    answer: Vec::new(),
                    authority: Vec::new(),
                    error: Some(err),
                    message,
                });
                return;
            }
        };

        let mut state = AuthenticationResult::Secure;
        let mut error = None;
        let mut answer_outcomes = Vec::new();
        let mut authority_outcomes = Vec::new();

        // Every RRset in the answer section of a signed zone must carry a
        // valid signature.
        let (answer_sets, answer_sigs) = group_section(message.answers());
        for rrset in &answer_sets {
            match verify_rrset(
                rrset,
                &answer_sigs,
                &keys,
                now,
                self.require_all_signatures_valid,
            ) {
                Ok(outcome) => answer_outcomes.push(outcome),
                Err(err) => {
                    state = AuthenticationResult::Bogus;
                    error.get_or_insert(err);
                }
            }
        }

        // In the authority section only the DNSSEC-bearing types must be
        // signed; a referral's NS set is legitimately unsigned.
        let (authority_sets, authority_sigs) = group_section(message.name_servers());
        for rrset in &authority_sets {
            let must_verify = matches!(
                rrset.rtype,
                RecordType::DS | RecordType::NSEC | RecordType::NSEC3 | RecordType::SOA
            );

            match verify_rrset(
                rrset,
                &authority_sigs,
                &keys,
                now,
                self.require_all_signatures_valid,
            ) {
                Ok(outcome) => authority_outcomes.push(outcome),
                Err(DnssecError::MissingSignature { .. }) if !must_verify => {}
                Err(err) => {
                    state = AuthenticationResult::Bogus;
                    error.get_or_insert(err);
                }
            }
        }

        debug!(zone = %zone_name, state = %state, denial = %denial, "zone processed");
        self.results.push(ZoneResult {
            zone_name,
            state,
            denial,
            answer: answer_outcomes,
            authority: authority_outcomes,
            error,
            message,
        });
    }

    // ------------------------------------------------------------------
    // Verdict
    // ------------------------------------------------------------------

    fn verdict(&self) -> Verdict {
        use AuthenticationResult::*;
        use DenialOfExistenceState::*;

        if self.results.is_empty() {
            return Verdict {
                state: Unknown,
                denial: NotFound,
                error: Some(DnssecError::NoResults),
            };
        }

        // Out-of-order insertion is a programming error in the caller;
        // the conservative answer is Bogus.
        if let Some(err) = &self.ordering_violated {
            return Verdict {
                state: Bogus,
                denial: NotFound,
                error: Some(err.clone()),
            };
        }

        // Any Bogus zone poisons the whole chain.
        if let Some(bogus) = self.results.iter().find(|r| r.state == Bogus) {
            return Verdict {
                state: Bogus,
                denial: NotFound,
                error: bogus.error.clone(),
            };
        }

        // Walk from the root while zones stay Secure. A transition to a
        // non-Secure zone is only legitimate when the parent proved the
        // DS records absent.
        for (i, current) in self.results.iter().enumerate() {
            if current.state == Secure {
                continue;
            }

            if i == 0 {
                return Verdict {
                    state: current.state,
                    denial: current.denial,
                    error: current.error.clone(),
                };
            }

            let previous = &self.results[i - 1];

            match previous.denial {
                Nsec3OptOut | NsecMissingDS | Nsec3MissingDS => {
                    return Verdict {
                        state: Insecure,
                        denial: previous.denial,
                        error: current.error.clone(),
                    };
                }
                NsecNoData | Nsec3NoData => {
                    // Only valid when the previous response answered a DS
                    // query for exactly the zone now going insecure; a
                    // NODATA proof for anything else does not cover the
                    // delegation.
                    if let Some(prev_question) = previous.message.queries().first() {
                        if prev_question.query_type() == RecordType::DS
                            && prev_question.name().to_lowercase() == current.zone_name
                        {
                            return Verdict {
                                state: Insecure,
                                denial: previous.denial,
                                error: current.error.clone(),
                            };
                        }
                    }
                    // NxDomain proofs are not accepted here: the owner
                    // must exist if its ancestor delegated to it.
                }
                _ => {}
            }

            return Verdict {
                state: Bogus,
                denial: previous.denial,
                error: current.error.clone(),
            };
        }

        // Every zone was Secure; the last one decides.
        let last = self.results.last().expect("results are non-empty");

        match last.denial {
            Nsec3OptOut => {
                return Verdict {
                    state: Insecure,
                    denial: last.denial,
                    error: last.error.clone(),
                };
            }
            NsecNxDomain | Nsec3NxDomain | NsecNoData | Nsec3NoData => {
                return Verdict {
                    state: Secure,
                    denial: last.denial,
                    error: last.error.clone(),
                };
            }
            NotFound | NsecWildcard | Nsec3Wildcard => {}
            NsecMissingDS | Nsec3MissingDS => {
                return Verdict {
                    state: Bogus,
                    denial: last.denial,
                    error: last.error.clone(),
                };
            }
        }

        // A positive answer is expected now: no SOA in authority, and the
        // answer must cover the question directly or via CNAME.
        let has_soa = last
            .message
            .name_servers()
            .iter()
            .any(|r| r.record_type() == RecordType::SOA);
        if has_soa {
            return Verdict {
                state: Bogus,
                denial: last.denial,
                error: last.error.clone(),
            };
        }

        let qname = self.question.name().to_lowercase();
        let answers_question = last.message.answers().iter().any(|r| {
            r.name().to_lowercase() == qname
                && (r.record_type() == self.question.query_type()
                    || r.record_type() == RecordType::CNAME)
        });

        Verdict {
            state: if answers_question { Secure } else { Bogus },
            denial: last.denial,
            error: last.error.clone(),
        }
    }
}

/// Minimum validated TTL over verified signatures covering `rtype`.
fn result_ttl(rtype: RecordType, outcomes: &[SignatureOutcome], max_allowed: u32) -> Option<u32> {
    let mut found = false;
    let mut ttl = max_allowed;

    for outcome in outcomes {
        if outcome.rtype == rtype && outcome.verified {
            found = true;
            ttl = ttl.min(outcome.ttl);
        }
    }

    found.then_some(ttl)
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeliveredZone;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::{A, SOA};
    use hickory_proto::rr::{RData, Record};
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn question() -> Query {
        Query::query(name("www.example.com."), RecordType::A)
    }

    fn authenticator() -> Authenticator {
        Authenticator::new(question(), Arc::new(TrustAnchors::default()))
    }

    fn message_for(qname: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_query(Query::query(name(qname), qtype));
        message
    }

    fn zone_result(
        zone: &str,
        state: AuthenticationResult,
        denial: DenialOfExistenceState,
        message: Message,
    ) -> ZoneResult {
        ZoneResult {
            zone_name: name(zone),
            state,
            denial,
            answer: Vec::new(),
            authority: Vec::new(),
            error: None,
            message,
        }
    }

    #[test]
    fn empty_chain_is_unknown() {
        let mut auth = authenticator();
        let verdict = auth.result();

        assert_eq!(verdict.state, AuthenticationResult::Unknown);
        assert_eq!(verdict.denial, DenialOfExistenceState::NotFound);
        assert!(matches!(verdict.error, Some(DnssecError::NoResults)));
    }

    #[test]
    fn any_bogus_result_wins() {
        let mut auth = authenticator();
        auth.results.push(zone_result(
            ".",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NotFound,
            message_for("com.", RecordType::DS),
        ));
        auth.results.push(zone_result(
            "com.",
            AuthenticationResult::Bogus,
            DenialOfExistenceState::NotFound,
            message_for("example.com.", RecordType::DS),
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Bogus);
    }

    #[test]
    fn first_result_not_secure_decides_immediately() {
        let mut auth = authenticator();
        auth.results.push(zone_result(
            ".",
            AuthenticationResult::Insecure,
            DenialOfExistenceState::NotFound,
            message_for("com.", RecordType::DS),
        ));

        let verdict = auth.verdict();
        assert_eq!(verdict.state, AuthenticationResult::Insecure);
    }

    #[test]
    fn opt_out_delegation_goes_insecure() {
        let mut auth = authenticator();
        auth.results.push(zone_result(
            "com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::Nsec3OptOut,
            message_for("example.com.", RecordType::DS),
        ));
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Insecure,
            DenialOfExistenceState::NotFound,
            message_for("www.example.com.", RecordType::A),
        ));

        let verdict = auth.verdict();
        assert_eq!(verdict.state, AuthenticationResult::Insecure);
        assert_eq!(verdict.denial, DenialOfExistenceState::Nsec3OptOut);
    }

    #[test]
    fn nodata_ds_proof_for_exact_child_goes_insecure() {
        let mut auth = authenticator();
        auth.results.push(zone_result(
            "com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NsecNoData,
            message_for("example.com.", RecordType::DS),
        ));
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Insecure,
            DenialOfExistenceState::NotFound,
            message_for("www.example.com.", RecordType::A),
        ));

        let verdict = auth.verdict();
        assert_eq!(verdict.state, AuthenticationResult::Insecure);
        assert_eq!(verdict.denial, DenialOfExistenceState::NsecNoData);
    }

    #[test]
    fn nodata_proof_for_wrong_name_is_bogus() {
        let mut auth = authenticator();
        // NODATA proof answered a DS query for a *different* zone.
        auth.results.push(zone_result(
            "com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NsecNoData,
            message_for("other.com.", RecordType::DS),
        ));
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Insecure,
            DenialOfExistenceState::NotFound,
            message_for("www.example.com.", RecordType::A),
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Bogus);
    }

    #[test]
    fn unproven_transition_is_bogus() {
        let mut auth = authenticator();
        auth.results.push(zone_result(
            "com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NotFound,
            message_for("example.com.", RecordType::DS),
        ));
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Insecure,
            DenialOfExistenceState::NotFound,
            message_for("www.example.com.", RecordType::A),
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Bogus);
    }

    #[test]
    fn secure_nxdomain_stays_secure() {
        let mut auth = authenticator();
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NsecNxDomain,
            message_for("www.example.com.", RecordType::A),
        ));

        let verdict = auth.verdict();
        assert_eq!(verdict.state, AuthenticationResult::Secure);
        assert_eq!(verdict.denial, DenialOfExistenceState::NsecNxDomain);
    }

    #[test]
    fn positive_answer_with_soa_in_authority_is_bogus() {
        let mut message = message_for("www.example.com.", RecordType::A);
        message.add_answer(Record::from_rdata(
            name("www.example.com."),
            300,
            RData::A(A::new(203, 0, 113, 5)),
        ));
        message.add_name_server(Record::from_rdata(
            name("example.com."),
            300,
            RData::SOA(SOA::new(
                name("ns1.example.com."),
                name("hostmaster.example.com."),
                1,
                7200,
                3600,
                1_209_600,
                300,
            )),
        ));

        let mut auth = authenticator();
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NotFound,
            message,
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Bogus);
    }

    #[test]
    fn positive_answer_matching_question_is_secure() {
        let mut message = message_for("www.example.com.", RecordType::A);
        message.add_answer(Record::from_rdata(
            name("www.example.com."),
            300,
            RData::A(A::new(203, 0, 113, 5)),
        ));

        let mut auth = authenticator();
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NotFound,
            message,
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Secure);
    }

    #[test]
    fn cname_at_qname_counts_as_positive_answer() {
        let mut message = message_for("www.example.com.", RecordType::A);
        message.add_answer(Record::from_rdata(
            name("www.example.com."),
            300,
            RData::CNAME(hickory_proto::rr::rdata::CNAME(name("target.example.net."))),
        ));

        let mut auth = authenticator();
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NotFound,
            message,
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Secure);
    }

    #[test]
    fn positive_answer_for_other_name_is_bogus() {
        let mut message = message_for("www.example.com.", RecordType::A);
        message.add_answer(Record::from_rdata(
            name("unrelated.example.com."),
            300,
            RData::A(A::new(203, 0, 113, 5)),
        ));

        let mut auth = authenticator();
        auth.results.push(zone_result(
            "example.com.",
            AuthenticationResult::Secure,
            DenialOfExistenceState::NotFound,
            message,
        ));

        assert_eq!(auth.verdict().state, AuthenticationResult::Bogus);
    }

    #[test]
    fn out_of_order_zone_poisons_the_verdict() {
        let mut auth = authenticator();

        // "example.com." processed before its parent "com.": com. is not
        // within example.com., which violates root-first ordering.
        auth.add_response(
            Arc::new(DeliveredZone::new(name("example.com."), vec![], vec![])),
            message_for("www.example.com.", RecordType::A),
        );
        auth.add_response(
            Arc::new(DeliveredZone::new(name("com."), vec![], vec![])),
            message_for("www.example.com.", RecordType::A),
        );

        let verdict = auth.result();
        assert_eq!(verdict.state, AuthenticationResult::Bogus);
        assert!(matches!(verdict.error, Some(DnssecError::OutOfOrderZone { .. })));
    }

    #[test]
    fn unsigned_delegation_processes_as_insecure() {
        let mut auth = authenticator();

        // A non-root zone with no DS from the parent is Insecure.
        auth.add_response(
            Arc::new(DeliveredZone::new(name("example.com."), vec![], vec![])),
            message_for("www.example.com.", RecordType::A),
        );

        let verdict = auth.result();
        assert_eq!(auth.zone_results().len(), 1);
        assert_eq!(auth.zone_results()[0].state(), AuthenticationResult::Insecure);
        // First (and only) zone is not Secure, so the verdict mirrors it.
        assert_eq!(verdict.state, AuthenticationResult::Insecure);
    }

    #[test]
    fn root_zone_without_keys_is_bogus() {
        let mut auth = authenticator();

        // The root always has DS material (the trust anchors), so an
        // empty DNSKEY set is a broken chain, not an unsigned zone.
        auth.add_response(
            Arc::new(DeliveredZone::new(Name::root(), vec![], vec![])),
            message_for("com.", RecordType::NS),
        );

        let verdict = auth.result();
        assert_eq!(verdict.state, AuthenticationResult::Bogus);
        assert!(matches!(verdict.error, Some(DnssecError::MissingDnskey { .. })));
    }

    #[test]
    fn verdicts_are_deterministic() {
        let build = || {
            let mut auth = authenticator();
            auth.results.push(zone_result(
                "com.",
                AuthenticationResult::Secure,
                DenialOfExistenceState::Nsec3OptOut,
                message_for("example.com.", RecordType::DS),
            ));
            auth.results.push(zone_result(
                "example.com.",
                AuthenticationResult::Insecure,
                DenialOfExistenceState::NotFound,
                message_for("www.example.com.", RecordType::A),
            ));
            auth.verdict()
        };

        let a = build();
        let b = build();
        assert_eq!(a.state, b.state);
        assert_eq!(a.denial, b.denial);
    }

    #[test]
    fn result_ttl_takes_the_minimum_verified() {
        let outcomes = vec![
            SignatureOutcome {
                rtype: RecordType::A,
                ttl: 600,
                verified: true,
            },
            SignatureOutcome {
                rtype: RecordType::A,
                ttl: 300,
                verified: true,
            },
            SignatureOutcome {
                rtype: RecordType::AAAA,
                ttl: 60,
                verified: true,
            },
        ];

        assert_eq!(result_ttl(RecordType::A, &outcomes, 172_800), Some(300));
        assert_eq!(result_ttl(RecordType::AAAA, &outcomes, 172_800), Some(60));
        assert_eq!(result_ttl(RecordType::MX, &outcomes, 172_800), None);
    }
}
