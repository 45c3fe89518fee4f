//! Information-element registry.
//!
//! The aggregator resolves element descriptors by (name, enterprise id)
//! before appending anything to a record, the same lookup the upstream
//! decoder performs when it binds templates. Only the elements this
//! pipeline actually exports are registered.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::element::{DataType, InfoElement};
use crate::error::AggregationError;

/// IANA-assigned elements live in the unqualified namespace.
pub const IANA_ENTERPRISE_ID: u32 = 0;
/// Reverse-direction counterparts of IANA elements, RFC 5103.
pub const IANA_REVERSED_ENTERPRISE_ID: u32 = 29305;
/// Private enterprise number of the cluster flow exporters, covering pod,
/// node, service and policy elements.
pub const CLUSTER_ENTERPRISE_ID: u32 = 56506;

const VARIABLE_LENGTH: u16 = 0xffff;

lazy_static! {
    static ref ELEMENTS: HashMap<u32, HashMap<&'static str, InfoElement>> = {
        use DataType::*;

        let defs: &[(&str, u16, u32, DataType, u16)] = &[
            // IANA elements.
            ("octetDeltaCount", 1, IANA_ENTERPRISE_ID, Unsigned64, 8),
            ("packetDeltaCount", 2, IANA_ENTERPRISE_ID, Unsigned64, 8),
            ("protocolIdentifier", 4, IANA_ENTERPRISE_ID, Unsigned8, 1),
            ("sourceTransportPort", 7, IANA_ENTERPRISE_ID, Unsigned16, 2),
            ("sourceIPv4Address", 8, IANA_ENTERPRISE_ID, Ipv4Address, 4),
            ("destinationTransportPort", 11, IANA_ENTERPRISE_ID, Unsigned16, 2),
            ("destinationIPv4Address", 12, IANA_ENTERPRISE_ID, Ipv4Address, 4),
            ("sourceIPv6Address", 27, IANA_ENTERPRISE_ID, Ipv6Address, 16),
            ("destinationIPv6Address", 28, IANA_ENTERPRISE_ID, Ipv6Address, 16),
            ("octetTotalCount", 85, IANA_ENTERPRISE_ID, Unsigned64, 8),
            ("packetTotalCount", 86, IANA_ENTERPRISE_ID, Unsigned64, 8),
            ("flowEndReason", 136, IANA_ENTERPRISE_ID, Unsigned8, 1),
            ("originalObservationDomainId", 149, IANA_ENTERPRISE_ID, Unsigned32, 4),
            ("flowStartSeconds", 150, IANA_ENTERPRISE_ID, DateTimeSeconds, 4),
            ("flowEndSeconds", 151, IANA_ENTERPRISE_ID, DateTimeSeconds, 4),
            ("originalExporterIPv4Address", 403, IANA_ENTERPRISE_ID, Ipv4Address, 4),
            ("originalExporterIPv6Address", 404, IANA_ENTERPRISE_ID, Ipv6Address, 16),
            // Reverse-direction counters, same element ids in the reversed
            // namespace.
            ("reverseOctetDeltaCount", 1, IANA_REVERSED_ENTERPRISE_ID, Unsigned64, 8),
            ("reversePacketDeltaCount", 2, IANA_REVERSED_ENTERPRISE_ID, Unsigned64, 8),
            ("reverseOctetTotalCount", 85, IANA_REVERSED_ENTERPRISE_ID, Unsigned64, 8),
            ("reversePacketTotalCount", 86, IANA_REVERSED_ENTERPRISE_ID, Unsigned64, 8),
            // Cluster exporter elements.
            ("sourcePodNamespace", 100, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("sourcePodName", 101, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("destinationPodNamespace", 102, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("destinationPodName", 103, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("sourceNodeName", 104, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("destinationNodeName", 105, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("destinationClusterIPv4", 106, CLUSTER_ENTERPRISE_ID, Ipv4Address, 4),
            ("destinationServicePort", 107, CLUSTER_ENTERPRISE_ID, Unsigned16, 2),
            ("destinationClusterIPv6", 108, CLUSTER_ENTERPRISE_ID, Ipv6Address, 16),
            ("destinationServicePortName", 109, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("ingressNetworkPolicyRulePriority", 116, CLUSTER_ENTERPRISE_ID, Signed32, 4),
            // Per-side statistics mirrors.
            ("packetTotalCountFromSourceNode", 120, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("packetDeltaCountFromSourceNode", 121, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reversePacketTotalCountFromSourceNode", 122, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reversePacketDeltaCountFromSourceNode", 123, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("octetTotalCountFromSourceNode", 124, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("octetDeltaCountFromSourceNode", 125, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reverseOctetTotalCountFromSourceNode", 126, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reverseOctetDeltaCountFromSourceNode", 127, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("packetTotalCountFromDestinationNode", 128, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("packetDeltaCountFromDestinationNode", 129, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reversePacketTotalCountFromDestinationNode", 130, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reversePacketDeltaCountFromDestinationNode", 131, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("octetTotalCountFromDestinationNode", 132, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("octetDeltaCountFromDestinationNode", 133, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reverseOctetTotalCountFromDestinationNode", 134, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("reverseOctetDeltaCountFromDestinationNode", 135, CLUSTER_ENTERPRISE_ID, Unsigned64, 8),
            ("tcpState", 136, CLUSTER_ENTERPRISE_ID, String, VARIABLE_LENGTH),
            ("flowType", 137, CLUSTER_ENTERPRISE_ID, Unsigned8, 1),
            ("ingressNetworkPolicyRuleAction", 139, CLUSTER_ENTERPRISE_ID, Unsigned8, 1),
            ("egressNetworkPolicyRuleAction", 140, CLUSTER_ENTERPRISE_ID, Unsigned8, 1),
        ];

        let mut by_enterprise: HashMap<u32, HashMap<&'static str, InfoElement>> = HashMap::new();
        for &(name, id, enterprise, data_type, length) in defs {
            by_enterprise
                .entry(enterprise)
                .or_default()
                .insert(name, InfoElement::new(name, id, enterprise, data_type, length));
        }
        by_enterprise
    };
}

/// Resolve an element descriptor by name within an enterprise namespace.
pub fn get_info_element(name: &str, enterprise_id: u32) -> Result<InfoElement, AggregationError> {
    ELEMENTS
        .get(&enterprise_id)
        .and_then(|elements| elements.get(name))
        .cloned()
        .ok_or_else(|| AggregationError::UnknownInfoElement {
            name: name.to_string(),
            enterprise_id,
        })
}

/// Observation topology of a flow record relative to the exporting nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Both endpoints on one node; a single record carries both sides.
    IntraNode,
    /// Endpoints on two nodes; a half-record is expected from each.
    InterNode,
    /// The flow leaves the cluster; only the source side ever reports.
    ToExternal,
}

impl FlowType {
    pub fn to_u8(self) -> u8 {
        match self {
            FlowType::IntraNode => 1,
            FlowType::InterNode => 2,
            FlowType::ToExternal => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FlowType::IntraNode),
            2 => Some(FlowType::InterNode),
            3 => Some(FlowType::ToExternal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::IntraNode => "intra-node",
            FlowType::InterNode => "inter-node",
            FlowType::ToExternal => "to-external",
        }
    }
}

/// Network-policy rule action attached to a flow by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    NoAction,
    Allow,
    Drop,
    Reject,
}

impl RuleAction {
    pub fn to_u8(self) -> u8 {
        match self {
            RuleAction::NoAction => 0,
            RuleAction::Allow => 1,
            RuleAction::Drop => 2,
            RuleAction::Reject => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RuleAction::NoAction),
            1 => Some(RuleAction::Allow),
            2 => Some(RuleAction::Drop),
            3 => Some(RuleAction::Reject),
            _ => None,
        }
    }

    /// Whether the action blocked traffic. A denied flow never produces a
    /// record from the far side.
    pub fn is_deny(self) -> bool {
        matches!(self, RuleAction::Drop | RuleAction::Reject)
    }
}

/// Flow End Reason based on RFC 5102 IPFIX Information Model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEndReason {
    /// 0x01: the flow was terminated because it was considered to be idle
    IdleTimeout,
    /// 0x02: the flow was terminated for reporting purposes while it was still active
    ActiveTimeout,
    /// 0x03: signals indicating the end of the flow were detected (e.g., TCP FIN)
    EndOfFlowDetected,
    /// 0x04: the flow was terminated because of some external event
    ForcedEnd,
    /// 0x05: the flow was terminated because of lack of resources
    LackOfResources,
}

impl FlowEndReason {
    pub fn to_u8(self) -> u8 {
        match self {
            FlowEndReason::IdleTimeout => 0x01,
            FlowEndReason::ActiveTimeout => 0x02,
            FlowEndReason::EndOfFlowDetected => 0x03,
            FlowEndReason::ForcedEnd => 0x04,
            FlowEndReason::LackOfResources => 0x05,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FlowEndReason::IdleTimeout),
            0x02 => Some(FlowEndReason::ActiveTimeout),
            0x03 => Some(FlowEndReason::EndOfFlowDetected),
            0x04 => Some(FlowEndReason::ForcedEnd),
            0x05 => Some(FlowEndReason::LackOfResources),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowEndReason::IdleTimeout => "idle timeout",
            FlowEndReason::ActiveTimeout => "active timeout",
            FlowEndReason::EndOfFlowDetected => "end of flow detected",
            FlowEndReason::ForcedEnd => "forced end",
            FlowEndReason::LackOfResources => "lack of resources",
        }
    }
}
