//! CNAME chasing.
//!
//! A positive response whose answer section maps the query name to one or
//! more CNAMEs gets its targets resolved concurrently, the results
//! spliced back into the original response. The cache is consulted per
//! target before any network work, and sub-resolutions draw on the same
//! query budget as the walk that found the CNAME.

use hickory_proto::op::{Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Instant;
use taproot_dnssec::Verdict;
use tracing::{debug, trace};

use super::walker::{DelegationWalker, Resolution};
use super::wire;
use super::{ResolverError, Result};

/// Resolves every CNAME target in `resolution` and splices the results.
///
/// Fails with [`ResolverError::AllCnameFailed`] only when every branch
/// that needed network work failed; a single successful branch carries
/// the chain.
pub(crate) async fn follow(
    walker: &DelegationWalker,
    question: &Query,
    resolution: &mut Resolution,
    do_bit: bool,
    budget: Arc<AtomicI64>,
    deadline: Instant,
) -> Result<()> {
    let qtype = question.query_type();

    let mut targets: Vec<Name> = Vec::new();
    for record in resolution.message.answers() {
        if let RData::CNAME(cname) = record.data() {
            let target = wire::canonical_name(&cname.0);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    let pending: Vec<Name> = targets
        .into_iter()
        .filter(|target| {
            let answers = resolution.message.answers();
            // The chain may already contain the next hop.
            !wire::records_of_name_and_type_exist(answers, target, qtype)
                && !wire::records_of_name_and_type_exist(answers, target, RecordType::CNAME)
        })
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    debug!(
        qname = %question.name(),
        targets = pending.len(),
        "following cname targets"
    );

    let branches = pending.iter().map(|target| {
        let budget = budget.clone();
        let target = target.clone();
        async move {
            let result = resolve_branch(walker, target.clone(), qtype, do_bit, budget, deadline).await;
            (target, result)
        }
    });

    let mut merged_any = false;
    let mut errors: Vec<String> = Vec::new();

    for (target, result) in futures::future::join_all(branches).await {
        match result {
            Ok(branch) => {
                trace!(target = %target, "cname branch resolved");
                merge(resolution, branch);
                merged_any = true;
            }
            Err(e) => {
                debug!(target = %target, error = %e, "cname branch failed");
                errors.push(format!("{target}: {e}"));
            }
        }
    }

    if !merged_any {
        return Err(ResolverError::AllCnameFailed(errors.join("; ")));
    }
    Ok(())
}

async fn resolve_branch(
    walker: &DelegationWalker,
    target: Name,
    qtype: RecordType,
    do_bit: bool,
    budget: Arc<AtomicI64>,
    deadline: Instant,
) -> Result<Resolution> {
    let branch_question = Query::query(target.clone(), qtype);

    if let Some(cache) = walker.cache() {
        if let Some(message) = cache.get(&branch_question, 0) {
            trace!(target = %target, "cname target served from cache");
            return Ok(Resolution {
                message,
                verdict: None,
                validated_ttl: None,
            });
        }
    }

    let branch = walker
        .resolve_shared(branch_question.clone(), do_bit, budget, deadline)
        .await?;

    if branch.message.answers().is_empty() && !wire::is_nxdomain(&branch.message) {
        return Err(ResolverError::Protocol(format!(
            "unable to follow cname [{target}]"
        )));
    }

    if let Some(cache) = walker.cache() {
        if !branch.message.answers().is_empty() {
            cache.put(&branch_question, &branch.message);
        }
    }

    Ok(branch)
}

/// Splices a branch response into the main resolution.
fn merge(resolution: &mut Resolution, branch: Resolution) {
    for record in branch.message.answers() {
        resolution.message.add_answer(record.clone());
    }
    for record in branch.message.name_servers() {
        resolution.message.add_name_server(record.clone());
    }
    for record in branch.message.additionals() {
        if record.record_type() != RecordType::OPT {
            resolution.message.add_additional(record.clone());
        }
    }

    // The merged answer is only authoritative if every part was.
    let authoritative = resolution.message.authoritative() && branch.message.authoritative();
    resolution.message.set_authoritative(authoritative);

    // A failing final segment outranks an intermediate success: DNS
    // rcodes have no useful order, so "any non-zero rcode from the end
    // of the chain wins" is the policy.
    if branch.message.response_code() != ResponseCode::NoError {
        resolution
            .message
            .set_response_code(branch.message.response_code());
    }

    resolution.verdict = combine_verdicts(resolution.verdict.take(), branch.verdict);
}

/// Combines authentication verdicts across chain segments, keeping the
/// weakest state. A branch without a verdict (validation off, or served
/// from cache) leaves the existing verdict untouched.
fn combine_verdicts(main: Option<Verdict>, branch: Option<Verdict>) -> Option<Verdict> {
    match (main, branch) {
        (Some(a), Some(b)) => {
            if b.state < a.state {
                Some(Verdict {
                    state: a.state.combine(b.state),
                    denial: b.denial,
                    error: b.error,
                })
            } else {
                Some(Verdict {
                    state: a.state.combine(b.state),
                    denial: a.denial,
                    error: a.error,
                })
            }
        }
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
