//! RRset grouping and signature verification.
//!
//! Cryptographic verification is delegated to the wire library's
//! ring-backed `Verifier`; this module owns the policy around it: which
//! RRSIGs cover which RRset, time-window checks, key-tag matching, the
//! any-vs-all signature rule, and the validated-TTL computation of
//! RFC 4035 §5.3.3.

use hickory_proto::dnssec::rdata::{DNSKEY, DNSSECRData, RRSIG};
use hickory_proto::dnssec::Verifier;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tracing::{debug, trace};

use super::{dnskey_verifies_rrsig, DnssecError, Result};

/// Record of one verified RRset, kept per zone result for TTL capping.
#[derive(Debug, Clone, Copy)]
pub struct SignatureOutcome {
    /// The covered record type.
    pub rtype: RecordType,
    /// Validated TTL: min of RRset TTL, RRSIG TTL, RRSIG original TTL,
    /// and the seconds until signature expiry.
    pub ttl: u32,
    /// Whether the required signatures verified.
    pub verified: bool,
}

/// A grouped RRset within one message section.
#[derive(Debug)]
pub(crate) struct Rrset<'a> {
    pub name: &'a Name,
    pub rtype: RecordType,
    pub class: DNSClass,
    pub ttl: u32,
    pub records: Vec<&'a Record>,
}

/// Splits a section into data RRsets and the RRSIGs found alongside them.
///
/// OPT pseudo-records are ignored.
pub(crate) fn group_section(section: &[Record]) -> (Vec<Rrset<'_>>, Vec<(&Record, &RRSIG)>) {
    let mut rrsets: Vec<Rrset<'_>> = Vec::new();
    let mut rrsigs = Vec::new();

    for record in section {
        match record.data() {
            RData::DNSSEC(DNSSECRData::RRSIG(sig)) => {
                rrsigs.push((record, sig));
            }
            RData::OPT(_) => {}
            _ => {
                if let Some(existing) = rrsets
                    .iter_mut()
                    .find(|set| set.rtype == record.record_type() && set.name == record.name())
                {
                    existing.ttl = existing.ttl.min(record.ttl());
                    existing.records.push(record);
                } else {
                    rrsets.push(Rrset {
                        name: record.name(),
                        rtype: record.record_type(),
                        class: record.dns_class(),
                        ttl: record.ttl(),
                        records: vec![record],
                    });
                }
            }
        }
    }

    (rrsets, rrsigs)
}

/// Verifies one RRset against the zone's trusted keys.
///
/// With `require_all` false (the default), one valid RRSIG is enough;
/// with it true, every covering RRSIG must verify.
pub(crate) fn verify_rrset(
    rrset: &Rrset<'_>,
    rrsigs: &[(&Record, &RRSIG)],
    keys: &[DNSKEY],
    now: u32,
    require_all: bool,
) -> Result<SignatureOutcome> {
    let covering: Vec<(&Record, &RRSIG)> = rrsigs
        .iter()
        .filter(|(record, sig)| {
            sig.type_covered() == rrset.rtype && record.name() == rrset.name
        })
        .copied()
        .collect();

    if covering.is_empty() {
        return Err(DnssecError::MissingSignature {
            name: rrset.name.to_string(),
            rtype: rrset.rtype.to_string(),
        });
    }

    let mut verified_any = false;
    let mut failed_any = false;
    let mut ttl = u32::MAX;
    let mut last_error: Option<DnssecError> = None;

    for (sig_record, rrsig) in covering {
        let input = rrsig;

        let expiration = input.sig_expiration().get();
        let inception = input.sig_inception().get();
        if now > expiration {
            failed_any = true;
            last_error = Some(DnssecError::SignatureExpired {
                name: rrset.name.to_string(),
                rtype: rrset.rtype.to_string(),
                expiration,
            });
            continue;
        }
        if now < inception {
            failed_any = true;
            last_error = Some(DnssecError::SignatureInvalid {
                name: rrset.name.to_string(),
                rtype: rrset.rtype.to_string(),
                reason: format!("signature not yet valid (inception {inception})"),
            });
            continue;
        }

        let Some(key) = keys.iter().find(|key| {
            key.calculate_key_tag().map(|tag| tag == input.key_tag()).unwrap_or(false)
                && key.algorithm() == input.algorithm()
        }) else {
            failed_any = true;
            last_error = Some(DnssecError::SignatureInvalid {
                name: rrset.name.to_string(),
                rtype: rrset.rtype.to_string(),
                reason: format!("no trusted DNSKEY with key tag {}", input.key_tag()),
            });
            continue;
        };

        match dnskey_verifies_rrsig(key, rrset.name, rrset.class, rrsig, &rrset.records) {
            Ok(()) => {
                verified_any = true;
                ttl = ttl
                    .min(rrset.ttl)
                    .min(sig_record.ttl())
                    .min(input.original_ttl())
                    .min(expiration.saturating_sub(now));
                trace!(
                    name = %rrset.name,
                    rtype = %rrset.rtype,
                    key_tag = input.key_tag(),
                    "RRSIG verified"
                );
            }
            Err(e) => {
                failed_any = true;
                debug!(
                    name = %rrset.name,
                    rtype = %rrset.rtype,
                    key_tag = input.key_tag(),
                    error = %e,
                    "RRSIG verification failed"
                );
                last_error = Some(DnssecError::SignatureInvalid {
                    name: rrset.name.to_string(),
                    rtype: rrset.rtype.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let verified = if require_all {
        verified_any && !failed_any
    } else {
        verified_any
    };

    if !verified {
        return Err(last_error.unwrap_or(DnssecError::SignatureInvalid {
            name: rrset.name.to_string(),
            rtype: rrset.rtype.to_string(),
            reason: "no RRSIG verified".to_string(),
        }));
    }

    Ok(SignatureOutcome {
        rtype: rrset.rtype,
        ttl,
        verified: true,
    })
}

/// Verifies a zone's DNSKEY RRset against the DS set from its parent.
///
/// On success the whole DNSKEY RRset becomes the zone's trusted key set:
/// a DS-matched key signing the set vouches for every key in it.
pub(crate) fn establish_zone_keys(
    zone: &Name,
    dnskey_records: &[Record],
    parent_ds: &[hickory_proto::dnssec::rdata::DS],
    now: u32,
    require_all: bool,
) -> Result<Vec<DNSKEY>> {
    let (rrsets, rrsigs) = group_section(dnskey_records);

    let keys: Vec<DNSKEY> = dnskey_records
        .iter()
        .filter_map(|record| match record.data() {
            RData::DNSSEC(DNSSECRData::DNSKEY(key)) => Some(key.clone()),
            _ => None,
        })
        .collect();

    if keys.is_empty() {
        return Err(DnssecError::MissingDnskey {
            zone: zone.to_string(),
        });
    }

    // At least one zone key must be vouched for by the parent's DS set.
    let anchored: Vec<&DNSKEY> = keys
        .iter()
        .filter(|key| {
            key.zone_key()
                && parent_ds
                    .iter()
                    .any(|ds| ds.covers(zone, key).unwrap_or(false))
        })
        .collect();

    if anchored.is_empty() {
        return Err(DnssecError::DsMismatch {
            zone: zone.to_string(),
        });
    }

    // The DNSKEY RRset itself must be signed by an anchored key.
    let dnskey_set = rrsets
        .into_iter()
        .find(|set| set.rtype == RecordType::DNSKEY)
        .ok_or_else(|| DnssecError::MissingDnskey {
            zone: zone.to_string(),
        })?;

    let anchored_keys: Vec<DNSKEY> = anchored.into_iter().cloned().collect();
    verify_rrset(&dnskey_set, &rrsigs, &anchored_keys, now, require_all)?;

    debug!(zone = %zone, keys = keys.len(), "zone key set established");
    Ok(keys)
}

/// Extracts DS rdata from a record slice.
pub(crate) fn extract_ds(records: &[Record]) -> Vec<hickory_proto::dnssec::rdata::DS> {
    records
        .iter()
        .filter_map(|record| match record.data() {
            RData::DNSSEC(DNSSECRData::DS(ds)) => Some(ds.clone()),
            _ => None,
        })
        .collect()
}
