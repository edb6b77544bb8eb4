//! Denial-of-existence classification.
//!
//! When a response carries no positive answer, the NSEC/NSEC3 records in
//! its authority section prove *why*: the name does not exist, the name
//! exists but not the type, a wildcard was expanded, or (NSEC3 opt-out)
//! the zone permits unsigned delegations. The classification feeds the
//! verdict algorithm: an Insecure delegation is only acceptable when the
//! parent proved the DS absent.

use data_encoding::BASE32HEX_NOPAD;
use hickory_proto::dnssec::rdata::{DNSSECRData, NSEC, NSEC3};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use std::fmt;
use tracing::trace;

/// How (and whether) a response proved nonexistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialOfExistenceState {
    /// No denial-of-existence records were found.
    NotFound,
    /// NSEC proved the name exists but the queried type does not.
    NsecNoData,
    /// NSEC proved the name does not exist.
    NsecNxDomain,
    /// NSEC accompanied a wildcard-expanded answer.
    NsecWildcard,
    /// NSEC proved no DS exists at a delegation point.
    NsecMissingDS,
    /// NSEC3 proved the name exists but the queried type does not.
    Nsec3NoData,
    /// NSEC3 proved the name does not exist.
    Nsec3NxDomain,
    /// NSEC3 accompanied a wildcard-expanded answer.
    Nsec3Wildcard,
    /// An opt-out NSEC3 span covered the name.
    Nsec3OptOut,
    /// NSEC3 proved no DS exists at a delegation point.
    Nsec3MissingDS,
}

impl DenialOfExistenceState {
    /// Returns the state name as used in log output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::NsecNoData => "NsecNoData",
            Self::NsecNxDomain => "NsecNxDomain",
            Self::NsecWildcard => "NsecWildcard",
            Self::NsecMissingDS => "NsecMissingDS",
            Self::Nsec3NoData => "Nsec3NoData",
            Self::Nsec3NxDomain => "Nsec3NxDomain",
            Self::Nsec3Wildcard => "Nsec3Wildcard",
            Self::Nsec3OptOut => "Nsec3OptOut",
            Self::Nsec3MissingDS => "Nsec3MissingDS",
        }
    }
}

impl fmt::Display for DenialOfExistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies the denial-of-existence proof in `message` for `question`.
pub fn classify_denial(message: &Message, question: &Query) -> DenialOfExistenceState {
    let qname = question.name().to_lowercase();
    let qtype = question.query_type();

    let mut nsecs: Vec<(&Name, &NSEC)> = Vec::new();
    let mut nsec3s: Vec<(&Name, &NSEC3)> = Vec::new();

    for record in message.name_servers() {
        match record.data() {
            RData::DNSSEC(DNSSECRData::NSEC(nsec)) => nsecs.push((record.name(), nsec)),
            RData::DNSSEC(DNSSECRData::NSEC3(nsec3)) => nsec3s.push((record.name(), nsec3)),
            _ => {}
        }
    }

    // A wildcard-expanded positive answer shows up as an RRSIG whose label
    // count is lower than the owner name's.
    if wildcard_expanded(message, &qname) {
        if !nsec3s.is_empty() {
            return DenialOfExistenceState::Nsec3Wildcard;
        }
        if !nsecs.is_empty() {
            return DenialOfExistenceState::NsecWildcard;
        }
        return DenialOfExistenceState::NotFound;
    }

    if let Some(state) = classify_nsec(&nsecs, &qname, qtype) {
        return state;
    }
    if let Some(state) = classify_nsec3(&nsec3s, &qname, qtype) {
        return state;
    }

    DenialOfExistenceState::NotFound
}

fn wildcard_expanded(message: &Message, qname: &Name) -> bool {
    message.answers().iter().any(|record| {
        if let RData::DNSSEC(DNSSECRData::RRSIG(sig)) = record.data() {
            record.name().to_lowercase() == *qname
                && sig.num_labels() < record.name().num_labels()
        } else {
            false
        }
    })
}

fn classify_nsec(
    nsecs: &[(&Name, &NSEC)],
    qname: &Name,
    qtype: RecordType,
) -> Option<DenialOfExistenceState> {
    // Exact owner match: the name exists, check the type bitmap.
    for (owner, nsec) in nsecs {
        if owner.to_lowercase() == *qname {
            if nsec.type_bit_maps().any(|t| t == qtype) {
                continue;
            }
            return Some(if qtype == RecordType::DS {
                DenialOfExistenceState::NsecMissingDS
            } else {
                DenialOfExistenceState::NsecNoData
            });
        }
    }

    // Covering span: owner < qname < next (with wrap-around at the apex).
    for (owner, nsec) in nsecs {
        let owner = owner.to_lowercase();
        let next = nsec.next_domain_name().to_lowercase();

        let wraps = next <= owner;
        let covers = owner < *qname && (*qname < next || wraps);
        if covers {
            trace!(owner = %owner, next = %next, qname = %qname, "NSEC covers qname");
            return Some(DenialOfExistenceState::NsecNxDomain);
        }
    }

    None
}

fn classify_nsec3(
    nsec3s: &[(&Name, &NSEC3)],
    qname: &Name,
    qtype: RecordType,
) -> Option<DenialOfExistenceState> {
    for (owner, nsec3) in nsec3s {
        let Some(qname_hash) = nsec3_hash(nsec3, qname) else {
            continue;
        };
        let Some(owner_hash) = owner_hash_label(owner) else {
            continue;
        };

        if owner_hash == qname_hash {
            if nsec3.type_bit_maps().any(|t| t == qtype) {
                continue;
            }
            return Some(if qtype == RecordType::DS {
                DenialOfExistenceState::Nsec3MissingDS
            } else {
                DenialOfExistenceState::Nsec3NoData
            });
        }

        let next_hash = nsec3.next_hashed_owner_name();
        let wraps = next_hash <= owner_hash.as_slice();
        let covers = owner_hash.as_slice() < qname_hash.as_slice()
            && (qname_hash.as_slice() < next_hash || wraps);
        if covers {
            if nsec3.opt_out() {
                return Some(DenialOfExistenceState::Nsec3OptOut);
            }
            return Some(DenialOfExistenceState::Nsec3NxDomain);
        }
    }

    None
}

/// Hashes `name` with the parameters carried by an NSEC3 record.
fn nsec3_hash(nsec3: &NSEC3, name: &Name) -> Option<Vec<u8>> {
    nsec3
        .hash_algorithm()
        .hash(nsec3.salt(), name, nsec3.iterations())
        .ok()
        .map(|digest| digest.as_ref().to_vec())
}

/// Decodes the Base32Hex first label of an NSEC3 owner name.
fn owner_hash_label(owner: &Name) -> Option<Vec<u8>> {
    let label = owner.iter().next()?;
    let upper = std::str::from_utf8(label).ok()?.to_ascii_uppercase();
    BASE32HEX_NOPAD.decode(upper.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::dnssec::Nsec3HashAlgorithm;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::Record;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn response_with_authority(qname: &str, qtype: RecordType, authority: Vec<Record>) -> (Message, Query) {
        let query = Query::query(name(qname), qtype);
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_query(query.clone());
        for record in authority {
            message.add_name_server(record);
        }
        (message, query)
    }

    fn nsec_record(owner: &str, next: &str, types: Vec<RecordType>) -> Record {
        Record::from_rdata(
            name(owner),
            3600,
            RData::DNSSEC(DNSSECRData::NSEC(NSEC::new(name(next), types))),
        )
    }

    #[test]
    fn nsec_nxdomain_when_span_covers() {
        let (message, query) = response_with_authority(
            "m.example.",
            RecordType::A,
            vec![nsec_record("a.example.", "z.example.", vec![RecordType::A])],
        );

        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::NsecNxDomain
        );
    }

    #[test]
    fn nsec_nodata_on_exact_owner_without_type() {
        let (message, query) = response_with_authority(
            "www.example.",
            RecordType::AAAA,
            vec![nsec_record("www.example.", "zzz.example.", vec![RecordType::A])],
        );

        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::NsecNoData
        );
    }

    #[test]
    fn nsec_missing_ds_for_ds_question() {
        let (message, query) = response_with_authority(
            "child.example.",
            RecordType::DS,
            vec![nsec_record(
                "child.example.",
                "other.example.",
                vec![RecordType::NS],
            )],
        );

        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::NsecMissingDS
        );
    }

    #[test]
    fn nsec_wraparound_span_covers_names_past_the_last_owner() {
        // Last NSEC in the zone points back at the apex.
        let (message, query) = response_with_authority(
            "zz.example.",
            RecordType::A,
            vec![nsec_record("w.example.", "example.", vec![RecordType::A])],
        );

        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::NsecNxDomain
        );
    }

    #[test]
    fn no_records_is_not_found() {
        let (message, query) = response_with_authority("x.example.", RecordType::A, vec![]);
        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::NotFound
        );
    }

    #[test]
    fn nsec3_nodata_on_matching_hash() {
        let qname = name("www.example.");
        let salt = b"\xaa\xbb".to_vec();
        let iterations = 5;

        let digest = Nsec3HashAlgorithm::SHA1
            .hash(&salt, &qname, iterations)
            .unwrap();
        let owner_label = BASE32HEX_NOPAD.encode(digest.as_ref()).to_lowercase();

        let nsec3 = NSEC3::new(
            Nsec3HashAlgorithm::SHA1,
            false,
            iterations,
            salt,
            vec![0xFF; 20],
            vec![RecordType::A],
        );
        let owner = name(&format!("{owner_label}.example."));

        let (message, query) = response_with_authority(
            "www.example.",
            RecordType::AAAA,
            vec![Record::from_rdata(
                owner,
                3600,
                RData::DNSSEC(DNSSECRData::NSEC3(nsec3)),
            )],
        );

        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::Nsec3NoData
        );
    }

    #[test]
    fn nsec3_opt_out_span_reports_opt_out() {
        // An owner hash of all-zeros and next hash of all-0xFF covers
        // every name; the opt-out flag makes the span permissive.
        let nsec3 = NSEC3::new(
            Nsec3HashAlgorithm::SHA1,
            true,
            0,
            Vec::new(),
            vec![0xFF; 20],
            vec![RecordType::NS],
        );
        let owner_label = BASE32HEX_NOPAD.encode(&[0u8; 20]).to_lowercase();
        let owner = name(&format!("{owner_label}.example."));

        let (message, query) = response_with_authority(
            "unsigned.example.",
            RecordType::DS,
            vec![Record::from_rdata(
                owner,
                3600,
                RData::DNSSEC(DNSSECRData::NSEC3(nsec3)),
            )],
        );

        assert_eq!(
            classify_denial(&message, &query),
            DenialOfExistenceState::Nsec3OptOut
        );
    }
}
