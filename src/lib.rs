//! Intermediate aggregation engine for IPFIX flow telemetry.
//!
//! Per-node exporters each see half of a bidirectional conversation. This
//! crate receives their decoded messages, correlates the source-side and
//! destination-side half-records under one canonical flow key, merges
//! counters and metadata into a single aggregated record, and expires
//! completed records to a consumer callback on dual active/inactive timers.
//!
//! The on-the-wire decoder, transport sockets, configuration loading and
//! log subscriber setup belong to the embedding daemon; this crate consumes
//! decoded [`message::Message`]s and exposes the aggregation process.

pub mod aggregation;
pub mod element;
pub mod error;
pub mod message;
pub mod registry;

pub use aggregation::{
    AggregationElements, AggregationFlowRecord, AggregationInput, AggregationProcess, FlowKey,
    MAX_RETRIES, MIN_EXPIRY_TIME_MILLIS,
};
pub use error::AggregationError;
