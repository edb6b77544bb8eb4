//! Request coordinator.
//!
//! The top-level pipeline for every client query: cache lookup, prefetch
//! accounting, delegation walk, DNSSEC verdict handling, cache write,
//! response shaping. One instance serves the whole process; per-request
//! state lives in the walker and its authenticator.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::RecordType;
use std::sync::Arc;
use std::time::Duration;
use taproot_cache::{MessageCache, PrefetchCounters};
use taproot_config::Config;
use taproot_dnssec::AuthenticationResult;
use taproot_resolver::walker::Resolution;
use taproot_resolver::{wire, DelegationWalker, ResolverError};
use taproot_server::{QueryContext, QueryHandler};
use tracing::{debug, info, instrument, trace, warn};

/// How far below the client deadline background refreshes run.
const PREFETCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Sweep interval for near-expiry refresh and counter reset.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Refresh entries once they fall under this share of their TTL.
const NEAR_EXPIRY_PERCENT: u8 = 10;

/// Composes cache, walker, authenticator, and prefetch into the query
/// pipeline.
pub struct Coordinator {
    config: Arc<Config>,
    cache: Arc<MessageCache>,
    walker: Arc<DelegationWalker>,
    prefetch: Arc<PrefetchCounters>,
}

impl Coordinator {
    /// Creates the coordinator.
    pub fn new(
        config: Arc<Config>,
        cache: Arc<MessageCache>,
        walker: Arc<DelegationWalker>,
        prefetch: Arc<PrefetchCounters>,
    ) -> Self {
        Self {
            config,
            cache,
            walker,
            prefetch,
        }
    }

    /// The message cache this coordinator serves from.
    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// Spawns the periodic maintenance task: refreshes entries close to
    /// expiry and resets the popularity window.
    ///
    /// Holds only a weak reference so it can never outlive the
    /// coordinator; abort the handle for a prompt stop at shutdown.
    pub fn spawn_maintenance(coordinator: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(coordinator);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else { break };

                let expiring = coordinator.cache.keys_near_expiry(NEAR_EXPIRY_PERCENT);
                if !expiring.is_empty() {
                    debug!(count = expiring.len(), "refreshing entries close to expiry");
                }
                for question in expiring {
                    coordinator.spawn_refresh(question);
                }

                coordinator.prefetch.reset();
            }
        })
    }

    /// Kicks off a background re-resolution of `question`.
    ///
    /// Runs on a short deadline and updates the cache only on success,
    /// so a failed refresh can never displace a still-valid entry.
    fn spawn_refresh(&self, question: Query) {
        let walker = self.walker.clone();
        let cache = self.cache.clone();

        tokio::spawn(async move {
            match walker
                .resolve_with_timeout(&question, false, PREFETCH_TIMEOUT)
                .await
            {
                Ok(resolution) if !resolution.message.answers().is_empty() => {
                    cache.put_with_ttl_cap(&question, &resolution.message, resolution.validated_ttl);
                    trace!(qname = %question.name(), "prefetch refreshed cache entry");
                }
                Ok(_) => {}
                Err(e) => {
                    trace!(qname = %question.name(), error = %e, "prefetch failed");
                }
            }
        });
    }

    /// Builds the client-facing response from a resolved message.
    fn build_response(&self, query: &Message, question: &Query, resolved: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(true);
        response.set_response_code(resolved.response_code());
        response.add_query(question.clone());

        let positive =
            resolved.response_code() == ResponseCode::NoError && !resolved.answers().is_empty();

        for record in resolved.answers() {
            response.add_answer(record.clone());
        }
        if !(positive && self.config.resolver.remove_authority_section_for_positive_answers) {
            for record in resolved.name_servers() {
                response.add_name_server(record.clone());
            }
        }
        if !(positive && self.config.resolver.remove_additional_section_for_positive_answers) {
            for record in resolved.additionals() {
                if record.record_type() != RecordType::OPT {
                    response.add_additional(record.clone());
                }
            }
        }

        if wire::is_do_set(query) {
            wire::set_edns(&mut response, 4096, true);
        } else if query.extensions().is_some() {
            wire::set_edns(&mut response, 4096, false);
        }

        response
    }

    /// Builds a minimal SERVFAIL reply.
    fn servfail(&self, query: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(true);
        response.set_response_code(ResponseCode::ServFail);
        for q in query.queries() {
            response.add_query(q.clone());
        }
        if wire::is_do_set(query) {
            wire::set_edns(&mut response, 4096, true);
        }
        response
    }

    fn formerr(&self, query: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_response_code(ResponseCode::FormErr);
        response
    }
}

#[async_trait]
impl QueryHandler for Coordinator {
    #[instrument(skip(self, query, context), fields(client = %context.client))]
    async fn handle(&self, query: Message, context: QueryContext) -> Message {
        // A request carries exactly one question.
        let question = match query.queries() {
            [q] => q.clone(),
            _ => return self.formerr(&query),
        };
        let do_bit = wire::is_do_set(&query);

        // Served from cache: copy with the client's id, DO mirrored.
        if let Some(cached) = self.cache.get(&question, query.id()) {
            trace!(qname = %question.name(), "cache hit");

            if self.prefetch.record_access(&question) {
                self.spawn_refresh(question.clone());
            }

            return self.build_response(&query, &question, &cached);
        }

        if self.prefetch.record_access(&question) {
            self.spawn_refresh(question.clone());
        }

        let resolution = match self.walker.resolve(&question, do_bit).await {
            Ok(resolution) => resolution,
            Err(e) => {
                match &e {
                    ResolverError::QueryBudgetExceeded | ResolverError::ResolutionLoop { .. } => {
                        warn!(qname = %question.name(), error = %e, "resolution aborted");
                    }
                    _ => debug!(qname = %question.name(), error = %e, "resolution failed"),
                }
                // Failures are negatively cached so a broken domain does
                // not hammer the same servers on every retry.
                self.cache.put_negative(&question, ResponseCode::ServFail);
                return self.servfail(&query);
            }
        };

        let Resolution {
            message,
            verdict,
            validated_ttl,
        } = resolution;

        // A Bogus chain never reaches the client or the cache. The
        // failing sections are only echoed when suppression is off.
        if let Some(verdict) = &verdict {
            if verdict.state == AuthenticationResult::Bogus {
                info!(
                    qname = %question.name(),
                    denial = %verdict.denial,
                    error = verdict.error.as_ref().map(|e| e.to_string()),
                    "DNSSEC verdict Bogus, answering SERVFAIL"
                );

                let mut response = self.servfail(&query);
                if !self.config.dnssec.suppress_bogus_response_sections {
                    for record in message.answers() {
                        response.add_answer(record.clone());
                    }
                    for record in message.name_servers() {
                        response.add_name_server(record.clone());
                    }
                }
                return response;
            }
        }

        let mut response = self.build_response(&query, &question, &message);

        if let Some(verdict) = &verdict {
            response.set_authentic_data(do_bit && verdict.state == AuthenticationResult::Secure);
        }

        // Cache write: negative results under the negative namespace,
        // positive ones capped by the validated TTL.
        if wire::is_nxdomain(&message) {
            self.cache.put_negative(&question, ResponseCode::NXDomain);
        } else if wire::is_nodata(&message) {
            self.cache.put_negative(&question, ResponseCode::NoError);
        } else {
            self.cache
                .put_with_ttl_cap(&question, &response, validated_ttl);
        }

        response
    }
}
