//! # Taproot DNSSEC Authentication
//!
//! Chain-of-trust authentication for recursive resolution per RFC 4035
//! and RFC 5155.
//!
//! The resolver feeds the [`Authenticator`] one `(zone, message)` pair per
//! delegation step, root first. Each zone's DNSKEY RRset is verified
//! against the DS records its parent delivered (the configured trust
//! anchors stand in as the root's parent), every signed RRset in the
//! response is checked against the zone's keys, and denial-of-existence
//! records are classified. The final verdict (Secure, Insecure, or
//! Bogus) falls out of the ordered sequence of per-zone results.
//!
//! All cryptographic work is synchronous and CPU-bound; nothing in this
//! crate suspends.

use hickory_proto::dnssec::rdata::{DNSKEY, DS};
use hickory_proto::dnssec::Verifier;
use hickory_proto::rr::{Name, Record};
use std::fmt;
use thiserror::Error;

pub mod authenticator;
pub mod denial;
mod signatures;

pub use authenticator::{Authenticator, Verdict, ZoneResult};
pub use denial::DenialOfExistenceState;

/// Errors produced during DNSSEC validation.
///
/// Every variant carries owned data so verdicts can be cloned out of the
/// per-zone result list.
#[derive(Debug, Clone, Error)]
pub enum DnssecError {
    /// The zone delivered no DNSKEY records although DS records exist.
    #[error("no DNSKEY records available for zone {zone}")]
    MissingDnskey {
        /// The zone missing its keys.
        zone: String,
    },

    /// An RRSIG's validity window has passed.
    #[error("signature for {name} {rtype} expired at {expiration}")]
    SignatureExpired {
        /// RRset owner name.
        name: String,
        /// Covered record type.
        rtype: String,
        /// Expiration time (seconds since epoch, serial arithmetic).
        expiration: u32,
    },

    /// An RRSIG failed cryptographic verification.
    #[error("signature for {name} {rtype} did not verify: {reason}")]
    SignatureInvalid {
        /// RRset owner name.
        name: String,
        /// Covered record type.
        rtype: String,
        /// Why verification failed.
        reason: String,
    },

    /// An RRset that must be signed carried no signature at all.
    #[error("no RRSIG present for {name} {rtype}")]
    MissingSignature {
        /// RRset owner name.
        name: String,
        /// Record type.
        rtype: String,
    },

    /// No DNSKEY in the zone's key set matches a DS from the parent.
    #[error("no DNSKEY matches the DS set delivered for zone {zone}")]
    DsMismatch {
        /// The zone whose delegation is inconsistent.
        zone: String,
    },

    /// The signature or key uses an algorithm this build cannot verify.
    #[error("unsupported DNSSEC algorithm {0}")]
    UnknownAlgorithm(u8),

    /// Zone responses were added out of root-to-qname order.
    #[error("zone {zone} processed out of delegation order")]
    OutOfOrderZone {
        /// The offending zone.
        zone: String,
    },

    /// `result()` was called without any processed responses.
    #[error("no responses have been processed")]
    NoResults,
}

/// Result type for DNSSEC operations.
pub type Result<T> = std::result::Result<T, DnssecError>;

// ============================================================================
// Authentication Result
// ============================================================================

/// Overall authentication state of a zone or of a whole resolution.
///
/// The variant order is meaningful: combining results across CNAME
/// branches takes the minimum, so a single Bogus branch poisons the
/// merged answer and an Unknown branch degrades Secure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthenticationResult {
    /// A signature failed, or the delegation chain is inconsistent.
    Bogus,
    /// The chain ends in a provably unsigned delegation.
    Insecure,
    /// Not enough information to decide either way.
    Unknown,
    /// Every required signature verified back to a trust anchor.
    Secure,
}

impl AuthenticationResult {
    /// Combines two results conservatively (minimum of the two).
    pub fn combine(self, other: Self) -> Self {
        self.min(other)
    }

    /// Returns the state name as used in log output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bogus => "Bogus",
            Self::Insecure => "Insecure",
            Self::Unknown => "Unknown",
            Self::Secure => "Secure",
        }
    }
}

impl fmt::Display for AuthenticationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Zone Capability
// ============================================================================

/// What the authenticator needs to know about one zone in the chain.
///
/// The delegation walker owns the concrete data: it observes DS records in
/// parent referrals and fetches the child's DNSKEY RRset, then hands both
/// over through this interface.
pub trait ZoneInfo: Send + Sync {
    /// The zone apex name.
    fn name(&self) -> &Name;

    /// The zone's DNSKEY RRset together with the RRSIGs covering it.
    fn dnskeys(&self) -> &[Record];

    /// DS records for this zone as delivered by the parent zone.
    fn ds_from_parent(&self) -> &[Record];
}

/// Zone data collected during a walk.
#[derive(Debug, Clone, Default)]
pub struct DeliveredZone {
    name: Name,
    dnskeys: Vec<Record>,
    ds_from_parent: Vec<Record>,
}

impl DeliveredZone {
    /// Creates zone data from walker observations.
    pub fn new(name: Name, dnskeys: Vec<Record>, ds_from_parent: Vec<Record>) -> Self {
        Self {
            name,
            dnskeys,
            ds_from_parent,
        }
    }
}

impl ZoneInfo for DeliveredZone {
    fn name(&self) -> &Name {
        &self.name
    }

    fn dnskeys(&self) -> &[Record] {
        &self.dnskeys
    }

    fn ds_from_parent(&self) -> &[Record] {
        &self.ds_from_parent
    }
}

// ============================================================================
// Trust Anchors
// ============================================================================

/// The DS records accepted a priori for the root zone.
///
/// These stand in for the root's (nonexistent) parent when the
/// authenticator verifies the root DNSKEY RRset.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    ds: Vec<DS>,
}

impl TrustAnchors {
    /// Creates a store from explicit DS records.
    pub fn from_ds(ds: Vec<DS>) -> Self {
        Self { ds }
    }

    /// Returns the anchor DS records.
    pub fn ds_records(&self) -> &[DS] {
        &self.ds
    }

    /// Returns true if no anchors are configured.
    pub fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }

    /// Returns true if `dnskey` (owned by `name`) matches any anchor.
    pub fn matches_dnskey(&self, name: &Name, dnskey: &DNSKEY) -> bool {
        self.ds
            .iter()
            .any(|ds| ds.covers(name, dnskey).unwrap_or(false))
    }
}

impl Default for TrustAnchors {
    /// The ICANN root KSKs (KSK-2017 tag 20326 and KSK-2024 tag 38696).
    fn default() -> Self {
        use data_encoding::HEXUPPER;
        use hickory_proto::dnssec::{Algorithm, DigestType};

        let anchors = [
            (
                20326u16,
                "E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D",
            ),
            (
                38696u16,
                "683D2D0ACB8C9B712A1948B27F741219298D0A450D612C483AF444A4C0FB2B16",
            ),
        ];

        let ds = anchors
            .iter()
            .filter_map(|(tag, hex)| {
                let digest = HEXUPPER.decode(hex.as_bytes()).ok()?;
                Some(DS::new(
                    *tag,
                    Algorithm::RSASHA256,
                    DigestType::SHA256,
                    digest,
                ))
            })
            .collect();

        Self { ds }
    }
}

/// Convenience wrapper so `Verifier` stays an implementation detail of
/// this crate's public surface.
pub(crate) fn dnskey_verifies_rrsig(
    dnskey: &DNSKEY,
    name: &Name,
    class: hickory_proto::rr::DNSClass,
    rrsig: &hickory_proto::dnssec::rdata::RRSIG,
    records: &[&Record],
) -> std::result::Result<(), hickory_proto::ProtoError> {
    dnskey.verify_rrsig(name, class, rrsig, records.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_takes_the_minimum() {
        use AuthenticationResult::*;

        assert_eq!(Secure.combine(Secure), Secure);
        assert_eq!(Secure.combine(Insecure), Insecure);
        assert_eq!(Insecure.combine(Bogus), Bogus);
        assert_eq!(Secure.combine(Unknown), Unknown);
        assert_eq!(Unknown.combine(Bogus), Bogus);
    }

    #[test]
    fn builtin_anchors_cover_both_root_ksks() {
        let anchors = TrustAnchors::default();
        assert_eq!(anchors.ds_records().len(), 2);

        let tags: Vec<u16> = anchors.ds_records().iter().map(|ds| ds.key_tag()).collect();
        assert!(tags.contains(&20326));
        assert!(tags.contains(&38696));
    }

    #[test]
    fn empty_anchor_store() {
        let anchors = TrustAnchors::from_ds(Vec::new());
        assert!(anchors.is_empty());
    }
}
