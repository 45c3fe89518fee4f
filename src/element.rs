use std::net::IpAddr;

use serde::Serialize;

/// Abstract data type of an information element, as declared by the
/// registry. The decoder upstream has already turned wire bytes into typed
/// values; the tag is kept so merge code can reject values of the wrong
/// shape instead of silently misreading them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed32,
    String,
    Ipv4Address,
    Ipv6Address,
    DateTimeSeconds,
}

/// A decoded element value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Unsigned8(u8),
    Unsigned16(u16),
    Unsigned32(u32),
    Unsigned64(u64),
    Signed32(i32),
    String(String),
    Address(IpAddr),
    /// Seconds since the UNIX epoch, the IPFIX dateTimeSeconds encoding.
    DateTimeSeconds(u32),
}

impl FieldValue {
    /// Whether this value is the "understood empty" value for its type:
    /// the empty string, numeric zero, or an unspecified address. The
    /// correlation fill-if-empty rule is defined in terms of this.
    pub fn is_zero(&self) -> bool {
        match self {
            FieldValue::Unsigned8(v) => *v == 0,
            FieldValue::Unsigned16(v) => *v == 0,
            FieldValue::Unsigned32(v) => *v == 0,
            FieldValue::Unsigned64(v) => *v == 0,
            FieldValue::Signed32(v) => *v == 0,
            FieldValue::String(v) => v.is_empty(),
            FieldValue::Address(v) => v.is_unspecified(),
            FieldValue::DateTimeSeconds(v) => *v == 0,
        }
    }

    /// Widening read of any unsigned variant.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned8(v) => Some(u64::from(*v)),
            FieldValue::Unsigned16(v) => Some(u64::from(*v)),
            FieldValue::Unsigned32(v) => Some(u64::from(*v)),
            FieldValue::Unsigned64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            FieldValue::Unsigned8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            FieldValue::Unsigned16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::Signed32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            FieldValue::Address(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_seconds(&self) -> Option<u32> {
        match self {
            FieldValue::DateTimeSeconds(v) => Some(*v),
            _ => None,
        }
    }
}

/// An information-element descriptor from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoElement {
    pub name: String,
    pub element_id: u16,
    pub enterprise_id: u32,
    pub data_type: DataType,
    /// Declared wire length; 0xffff marks variable-length elements.
    pub length: u16,
}

impl InfoElement {
    pub fn new(
        name: impl Into<String>,
        element_id: u16,
        enterprise_id: u32,
        data_type: DataType,
        length: u16,
    ) -> Self {
        Self {
            name: name.into(),
            element_id,
            enterprise_id,
            data_type,
            length,
        }
    }
}

/// A descriptor paired with its decoded value. Records inside template sets
/// carry descriptors only, so the value is optional.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfoElementWithValue {
    pub element: InfoElement,
    pub value: Option<FieldValue>,
}

impl InfoElementWithValue {
    pub fn new(element: InfoElement, value: FieldValue) -> Self {
        Self {
            element,
            value: Some(value),
        }
    }

    /// Descriptor without a value, as carried by template records.
    pub fn without_value(element: InfoElement) -> Self {
        Self {
            element,
            value: None,
        }
    }

    /// Whether the element carries no value or the empty value for its type.
    pub fn is_zero(&self) -> bool {
        self.value.as_ref().is_none_or(FieldValue::is_zero)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_zero_values() {
        assert!(FieldValue::String(String::new()).is_zero());
        assert!(!FieldValue::String("pod1".to_string()).is_zero());
        assert!(FieldValue::Unsigned64(0).is_zero());
        assert!(!FieldValue::Unsigned64(500).is_zero());
        assert!(FieldValue::Signed32(0).is_zero());
        assert!(!FieldValue::Signed32(50000).is_zero());
        assert!(FieldValue::Address(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).is_zero());
        assert!(FieldValue::Address(IpAddr::V6(Ipv6Addr::UNSPECIFIED)).is_zero());
        assert!(!FieldValue::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))).is_zero());
    }

    #[test]
    fn test_unsigned_widening() {
        assert_eq!(FieldValue::Unsigned8(6).as_u64(), Some(6));
        assert_eq!(FieldValue::Unsigned16(4739).as_u64(), Some(4739));
        assert_eq!(FieldValue::Unsigned64(1005).as_u64(), Some(1005));
        assert_eq!(FieldValue::String("x".to_string()).as_u64(), None);
    }

    #[test]
    fn test_element_without_value_is_zero() {
        let element = InfoElement::new("sourcePodName", 101, 56506, DataType::String, 0xffff);
        assert!(InfoElementWithValue::without_value(element).is_zero());
    }
}
