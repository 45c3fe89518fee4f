use std::fmt;

use serde::Serialize;

use crate::error::AggregationError;
use crate::message::Record;

/// Canonical 5-tuple identifying a bidirectional flow.
///
/// Addresses are stored in canonical textual form: dotted quad for IPv4,
/// RFC 5952 lowercase with `::` compression for IPv6. Both half-records of
/// a flow carry the same source/destination orientation, so the key is
/// identical no matter which exporter produced the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub source_address: String,
    pub destination_address: String,
    pub protocol: u8,
    pub source_port: u16,
    pub destination_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.source_address,
            self.source_port,
            self.destination_address,
            self.destination_port,
            self.protocol
        )
    }
}

/// Derive the flow key from a data record.
///
/// IPv4 address elements win when present; otherwise the IPv6 elements are
/// used. The decoder hands addresses over as typed values, so canonical
/// text falls out of their Display impls.
pub(crate) fn flow_key_from_record(record: &Record) -> Result<FlowKey, AggregationError> {
    let (source_address, destination_address) =
        if record.contains("sourceIPv4Address") || record.contains("destinationIPv4Address") {
            (
                address_text(record, "sourceIPv4Address")?,
                address_text(record, "destinationIPv4Address")?,
            )
        } else if record.contains("sourceIPv6Address") || record.contains("destinationIPv6Address") {
            (
                address_text(record, "sourceIPv6Address")?,
                address_text(record, "destinationIPv6Address")?,
            )
        } else {
            return Err(AggregationError::MalformedRecord(
                "record carries neither IPv4 nor IPv6 address elements".to_string(),
            ));
        };

    let protocol = record
        .value("protocolIdentifier")
        .and_then(|v| v.as_u8())
        .ok_or_else(|| {
            AggregationError::MalformedRecord("protocolIdentifier missing or undecodable".to_string())
        })?;
    let source_port = port_value(record, "sourceTransportPort")?;
    let destination_port = port_value(record, "destinationTransportPort")?;

    Ok(FlowKey {
        source_address,
        destination_address,
        protocol,
        source_port,
        destination_port,
    })
}

fn address_text(record: &Record, name: &str) -> Result<String, AggregationError> {
    record
        .value(name)
        .and_then(|v| v.as_ip())
        .map(|ip| ip.to_string())
        .ok_or_else(|| {
            AggregationError::MalformedRecord(format!("{name} missing or undecodable"))
        })
}

fn port_value(record: &Record, name: &str) -> Result<u16, AggregationError> {
    record
        .value(name)
        .and_then(|v| v.as_u16())
        .ok_or_else(|| {
            AggregationError::MalformedRecord(format!("{name} missing or undecodable"))
        })
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::element::{FieldValue, InfoElementWithValue};
    use crate::registry::{self, IANA_ENTERPRISE_ID};

    fn tuple_record(src: &str, dst: &str, v6: bool) -> Record {
        let (src_name, dst_name) = if v6 {
            ("sourceIPv6Address", "destinationIPv6Address")
        } else {
            ("sourceIPv4Address", "destinationIPv4Address")
        };
        let mut record = Record::new();
        record.push(InfoElementWithValue::new(
            registry::get_info_element(src_name, IANA_ENTERPRISE_ID).unwrap(),
            FieldValue::Address(src.parse::<IpAddr>().unwrap()),
        ));
        record.push(InfoElementWithValue::new(
            registry::get_info_element(dst_name, IANA_ENTERPRISE_ID).unwrap(),
            FieldValue::Address(dst.parse::<IpAddr>().unwrap()),
        ));
        record.push(InfoElementWithValue::new(
            registry::get_info_element("protocolIdentifier", IANA_ENTERPRISE_ID).unwrap(),
            FieldValue::Unsigned8(6),
        ));
        record.push(InfoElementWithValue::new(
            registry::get_info_element("sourceTransportPort", IANA_ENTERPRISE_ID).unwrap(),
            FieldValue::Unsigned16(1234),
        ));
        record.push(InfoElementWithValue::new(
            registry::get_info_element("destinationTransportPort", IANA_ENTERPRISE_ID).unwrap(),
            FieldValue::Unsigned16(5678),
        ));
        record
    }

    #[test]
    fn test_ipv4_key() {
        let record = tuple_record("10.0.0.1", "10.0.0.2", false);
        let key = flow_key_from_record(&record).unwrap();
        assert_eq!(
            key,
            FlowKey {
                source_address: "10.0.0.1".to_string(),
                destination_address: "10.0.0.2".to_string(),
                protocol: 6,
                source_port: 1234,
                destination_port: 5678,
            }
        );
    }

    #[test]
    fn test_ipv6_key_is_rfc5952_canonical() {
        // Mixed case and expanded zeros on input; the key must come out
        // lowercased and compressed.
        let record = tuple_record("2001:0:3238:DFE1:63::FEFB", "2001:0:3238:DFE1:63:0:0:FEFC", true);
        let key = flow_key_from_record(&record).unwrap();
        assert_eq!(key.source_address, "2001:0:3238:dfe1:63::fefb");
        assert_eq!(key.destination_address, "2001:0:3238:dfe1:63::fefc");
    }

    #[test]
    fn test_missing_addresses_is_malformed() {
        let mut record = Record::new();
        record.push(InfoElementWithValue::new(
            registry::get_info_element("protocolIdentifier", IANA_ENTERPRISE_ID).unwrap(),
            FieldValue::Unsigned8(6),
        ));
        let err = flow_key_from_record(&record).unwrap_err();
        assert!(matches!(err, AggregationError::MalformedRecord(_)));
    }

    #[test]
    fn test_missing_port_is_malformed() {
        let mut record = tuple_record("10.0.0.1", "10.0.0.2", false);
        // Clobber the port value with the wrong width.
        record.get_mut("sourceTransportPort").unwrap().value = Some(FieldValue::Unsigned8(1));
        let err = flow_key_from_record(&record).unwrap_err();
        assert!(matches!(err, AggregationError::MalformedRecord(_)));
    }
}
