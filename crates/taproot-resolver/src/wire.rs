//! Small helpers over the wire types: canonical names, record-section
//! filters, and EDNS flag inspection.

use hickory_proto::op::{Edns, Message, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};

/// Returns the canonical form of a name: lowercase and fully qualified.
pub fn canonical_name(name: &Name) -> Name {
    let mut canonical = name.to_lowercase();
    canonical.set_fqdn(true);
    canonical
}

/// Records of the given type within a section.
pub fn records_of_type(records: &[Record], rtype: RecordType) -> Vec<&Record> {
    records.iter().filter(|r| r.record_type() == rtype).collect()
}

/// Returns true if the section holds at least one record of `rtype`.
pub fn records_of_type_exist(records: &[Record], rtype: RecordType) -> bool {
    records.iter().any(|r| r.record_type() == rtype)
}

/// Records matching both owner name (canonically) and type.
pub fn records_of_name_and_type<'a>(
    records: &'a [Record],
    name: &Name,
    rtype: RecordType,
) -> Vec<&'a Record> {
    let name = canonical_name(name);
    records
        .iter()
        .filter(|r| r.record_type() == rtype && canonical_name(r.name()) == name)
        .collect()
}

/// Returns true if a record of (`name`, `rtype`) exists in the section.
pub fn records_of_name_and_type_exist(records: &[Record], name: &Name, rtype: RecordType) -> bool {
    !records_of_name_and_type(records, name, rtype).is_empty()
}

/// Returns true if the message carries EDNS with the DO bit set.
pub fn is_do_set(message: &Message) -> bool {
    message
        .extensions()
        .as_ref()
        .map(|edns| edns.flags().dnssec_ok)
        .unwrap_or(false)
}

/// The advertised EDNS UDP payload size, or the 512-byte classic limit.
pub fn edns_payload_size(message: &Message) -> u16 {
    message
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload().max(512))
        .unwrap_or(512)
}

/// Attaches an EDNS OPT record with the given payload size and DO bit.
pub fn set_edns(message: &mut Message, payload: u16, do_bit: bool) {
    let mut edns = Edns::new();
    edns.set_max_payload(payload);
    edns.set_version(0);
    edns.set_dnssec_ok(do_bit);
    message.set_edns(edns);
}

/// Returns true for a NODATA response: NOERROR with an empty answer
/// section.
pub fn is_nodata(message: &Message) -> bool {
    message.response_code() == ResponseCode::NoError && message.answers().is_empty()
}

/// Returns true for an NXDOMAIN response.
pub fn is_nxdomain(message: &Message) -> bool {
    message.response_code() == ResponseCode::NXDomain
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::RData;
    use std::str::FromStr;

    fn a_record(name: &str) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            300,
            RData::A(A::new(192, 0, 2, 1)),
        )
    }

    #[test]
    fn canonical_name_lowercases_and_qualifies() {
        let name = Name::from_str("WWW.Example.COM").unwrap();
        assert_eq!(canonical_name(&name).to_string(), "www.example.com.");
    }

    #[test]
    fn name_and_type_filter_is_case_insensitive() {
        let records = vec![a_record("Host.Example."), a_record("other.example.")];
        let needle = Name::from_str("host.example.").unwrap();

        assert!(records_of_name_and_type_exist(&records, &needle, RecordType::A));
        assert_eq!(records_of_name_and_type(&records, &needle, RecordType::A).len(), 1);
        assert!(!records_of_name_and_type_exist(&records, &needle, RecordType::AAAA));
    }

    #[test]
    fn do_bit_round_trip() {
        let mut message = Message::new();
        assert!(!is_do_set(&message));
        assert_eq!(edns_payload_size(&message), 512);

        set_edns(&mut message, 4096, true);
        assert!(is_do_set(&message));
        assert_eq!(edns_payload_size(&message), 4096);

        set_edns(&mut message, 4096, false);
        assert!(!is_do_set(&message));
    }

    #[test]
    fn nodata_requires_noerror_and_empty_answer() {
        let mut message = Message::new();
        assert!(is_nodata(&message));

        message.add_answer(a_record("a.example."));
        assert!(!is_nodata(&message));

        let mut nx = Message::new();
        nx.set_response_code(ResponseCode::NXDomain);
        assert!(!is_nodata(&nx));
        assert!(is_nxdomain(&nx));
    }
}
