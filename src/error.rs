use thiserror::Error;

use crate::aggregation::FlowKey;

/// Error type for the aggregation engine.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// The aggregation process was constructed with unusable input.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A data record is missing a required element or carries an
    /// undecodable value. The offending message is dropped; aggregation
    /// continues with the next one.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The flow key is not present in the aggregation map.
    #[error("flow key not found in aggregation map: {0}")]
    NotFound(FlowKey),

    /// The consumer callback failed while draining expired records. The
    /// record that triggered it stays in the map and the queue.
    #[error("flow record callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lookup of an element descriptor the registry does not know.
    #[error("unknown information element {name:?} (enterprise {enterprise_id})")]
    UnknownInfoElement { name: String, enterprise_id: u32 },
}

/// Type alias for Result with AggregationError.
pub type Result<T> = std::result::Result<T, AggregationError>;
