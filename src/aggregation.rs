use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::element::{FieldValue, InfoElementWithValue};
use crate::error::{AggregationError, Result};
use crate::message::{Message, Record, SetType};
use crate::registry::{
    self, FlowType, RuleAction, CLUSTER_ENTERPRISE_ID, IANA_ENTERPRISE_ID,
    IANA_REVERSED_ENTERPRISE_ID,
};

mod flow_key;
mod queue;

pub use flow_key::FlowKey;

use flow_key::flow_key_from_record;
use queue::{ExpirePriorityQueue, ItemToExpire};

/// Number of sweep passes a not-yet-ready record survives before it is
/// dropped without being handed to the consumer. Process-wide so tests can
/// tighten it.
pub static MAX_RETRIES: AtomicU32 = AtomicU32::new(2);

/// Grace in milliseconds added to the reported expiry so consumers do not
/// spin on a root that is just about to become due. Process-wide so tests
/// can zero it.
pub static MIN_EXPIRY_TIME_MILLIS: AtomicU64 = AtomicU64::new(100);

/// Per-worker input queue depth before the distributor falls forward to the
/// next worker.
const WORKER_CHANNEL_CAPACITY: usize = 512;

/// The four aligned element-name lists steering the merge of second and
/// subsequent records for a flow key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationElements {
    /// Last-writer-wins elements, e.g. flowEndSeconds, flowEndReason.
    pub non_stats_elements: Vec<String>,
    /// Counter elements merged by name convention: totals keep the maximum,
    /// deltas accumulate.
    pub stats_elements: Vec<String>,
    /// Per-side mirrors of `stats_elements`, written from source-side
    /// records. Positionally aligned.
    pub aggregated_source_stats_elements: Vec<String>,
    /// Per-side mirrors of `stats_elements`, written from destination-side
    /// records. Positionally aligned.
    pub aggregated_destination_stats_elements: Vec<String>,
}

impl AggregationElements {
    fn validate(&self) -> Result<()> {
        if self.aggregated_source_stats_elements.len() != self.stats_elements.len()
            || self.aggregated_destination_stats_elements.len() != self.stats_elements.len()
        {
            return Err(AggregationError::InvalidConfiguration(
                "per-side stats element lists must align with stats_elements".to_string(),
            ));
        }
        Ok(())
    }
}

/// Construction input for [`AggregationProcess`].
pub struct AggregationInput {
    /// Channel of decoded messages. Required; construction fails without it.
    pub message_rx: Option<mpsc::Receiver<Message>>,
    /// Number of ingress workers draining the channel.
    pub worker_num: usize,
    /// Element names treated as fillable correlation fields: a merge writes
    /// them only while the existing value is empty.
    pub correlate_fields: Vec<String>,
    /// Optional merge configuration for statistics and progression fields.
    pub aggregate_elements: Option<AggregationElements>,
    /// Upper bound on how long a flow may keep aggregating, pinned at first
    /// observation.
    pub active_expiry_timeout: Duration,
    /// Idle bound, refreshed on every record for the key.
    pub inactive_expiry_timeout: Duration,
}

/// One aggregated flow: the merged record plus its emission state.
#[derive(Debug, Clone)]
pub struct AggregationFlowRecord {
    pub record: Record,
    /// True once all required half-records for the key have been merged.
    /// Monotonic until the record is deleted.
    pub ready_to_send: bool,
    wait_for_ready_retries: u32,
}

#[derive(Default)]
struct AggregationState {
    flow_key_record_map: FxHashMap<FlowKey, AggregationFlowRecord>,
    expire_priority_queue: ExpirePriorityQueue,
}

/// Intermediate aggregation process.
///
/// ### Concurrency model
///
/// Multiple workers drain one shared message channel through a distributor
/// and call [`AggregationProcess::aggregate_msg_by_flow_key`]. One mutex
/// guards the flow-key map and the expiry queue together; the two are
/// always mutated as a unit, and the caller-driven sweeper contends on the
/// same lock. Per-record work under the lock is tiny.
///
/// Within one flow key, merges apply in the order records left the input
/// channel; across keys there is no ordering guarantee.
pub struct AggregationProcess {
    worker_num: usize,
    correlate_fields: Vec<String>,
    aggregate_elements: Option<AggregationElements>,
    active_expiry_timeout: Duration,
    inactive_expiry_timeout: Duration,
    message_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    stop_tx: watch::Sender<bool>,
    state: Mutex<AggregationState>,
}

impl AggregationProcess {
    pub fn new(input: AggregationInput) -> Result<Self> {
        let message_rx = input.message_rx.ok_or_else(|| {
            AggregationError::InvalidConfiguration(
                "a message channel is required".to_string(),
            )
        })?;
        if input.worker_num == 0 {
            return Err(AggregationError::InvalidConfiguration(
                "worker_num must be positive".to_string(),
            ));
        }
        if let Some(aggregate_elements) = &input.aggregate_elements {
            aggregate_elements.validate()?;
        }

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            worker_num: input.worker_num,
            correlate_fields: input.correlate_fields,
            aggregate_elements: input.aggregate_elements,
            active_expiry_timeout: input.active_expiry_timeout,
            inactive_expiry_timeout: input.inactive_expiry_timeout,
            message_rx: tokio::sync::Mutex::new(Some(message_rx)),
            stop_tx,
            state: Mutex::new(AggregationState::default()),
        })
    }

    pub fn worker_num(&self) -> usize {
        self.worker_num
    }

    /// Number of flow keys currently held in the map.
    pub fn num_flows(&self) -> usize {
        self.state().flow_key_record_map.len()
    }

    /// Number of pending expiry items. Stays in lockstep with
    /// [`AggregationProcess::num_flows`].
    pub fn expire_queue_len(&self) -> usize {
        self.state().expire_priority_queue.len()
    }

    /// Snapshot of the aggregated record for a key, if present.
    pub fn get_aggregation_record(&self, flow_key: &FlowKey) -> Option<AggregationFlowRecord> {
        self.state().flow_key_record_map.get(flow_key).cloned()
    }

    /// Run the ingress workers until the input channel closes or
    /// [`AggregationProcess::stop`] is called. Blocks the caller for the
    /// lifetime of the pool; in-flight records are finished before return.
    pub async fn start(self: std::sync::Arc<Self>) {
        let Some(mut message_rx) = self.message_rx.lock().await.take() else {
            warn!("aggregation process was already started once");
            return;
        };

        let worker_count = self.worker_num;
        let mut worker_txs = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            worker_txs.push(worker_tx);
            let process = std::sync::Arc::clone(&self);
            workers.push(tokio::spawn(worker_loop(worker_id, process, worker_rx)));
        }

        let mut stop_rx = self.stop_tx.subscribe();
        if !*stop_rx.borrow() {
            let mut next_worker = 0;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    maybe_message = message_rx.recv() => {
                        let Some(message) = maybe_message else { break };
                        let mut message = Some(message);
                        // Try the preferred worker first, fall forward past
                        // busy ones.
                        for attempt in 0..worker_count {
                            let target = (next_worker + attempt) % worker_count;
                            let Some(msg) = message.take() else { break };
                            match worker_txs[target].try_send(msg) {
                                Ok(()) => {
                                    next_worker = (target + 1) % worker_count;
                                }
                                Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => {
                                    message = Some(msg);
                                }
                            }
                        }
                        if let Some(msg) = message.take() {
                            // Every worker is at capacity; wait on the
                            // preferred one.
                            if worker_txs[next_worker].send(msg).await.is_ok() {
                                next_worker = (next_worker + 1) % worker_count;
                            }
                        }
                    }
                }
            }
        }

        drop(worker_txs);
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Signal the worker pool to exit. [`AggregationProcess::start`] returns
    /// once every worker has drained its queue.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Aggregate every data record of a message into the flow-key map.
    ///
    /// Records are annotated with the identity of their original exporter
    /// first; messages carrying a template set are then dropped silently
    /// (templates are consumed upstream by the decoder).
    pub fn aggregate_msg_by_flow_key(&self, mut message: Message) -> Result<()> {
        add_original_exporter_info(&mut message)?;
        if message.set.set_type == SetType::Template {
            debug!(
                exporter = %message.export_address,
                "ignoring message with template set"
            );
            return Ok(());
        }
        for record in message.set.records {
            let flow_key = flow_key_from_record(&record)?;
            self.add_or_update_record_in_map(&flow_key, record)?;
        }
        Ok(())
    }

    /// Earliest time the consumer should come back and sweep.
    pub fn get_expiry_from_expire_priority_queue(&self) -> Duration {
        let state = self.state();
        let now = Instant::now();
        if let Some(root) = state.expire_priority_queue.peek() {
            let min_expiry =
                Duration::from_millis(MIN_EXPIRY_TIME_MILLIS.load(Ordering::Relaxed));
            return match root.min_expire_time().checked_duration_since(now) {
                Some(remaining) => remaining + min_expiry,
                // The root is already due; report at most the grace period.
                None => min_expiry.saturating_sub(now - root.min_expire_time()),
            };
        }
        self.active_expiry_timeout
    }

    /// Hand every due flow record to `callback` and drop it from the map
    /// and queue on success.
    ///
    /// A due record that is not yet ready is put back with refreshed
    /// deadlines and ends the scan, unless it has exhausted its retries, in
    /// which case it is dropped without a callback. A callback error is
    /// propagated and leaves the record in place.
    pub fn for_all_expired_flow_records_do<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(
            &FlowKey,
            &AggregationFlowRecord,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        if self.active_expiry_timeout.is_zero() && self.inactive_expiry_timeout.is_zero() {
            // Expiry is disabled; nothing may be emitted or dropped.
            return Ok(());
        }

        let mut guard = self.state();
        let state = &mut *guard;
        let now = Instant::now();
        let max_retries = MAX_RETRIES.load(Ordering::Relaxed);

        while let Some(root) = state.expire_priority_queue.peek() {
            if root.min_expire_time() > now {
                break;
            }
            let flow_key = root.flow_key.clone();
            let Some(aggregation_record) = state.flow_key_record_map.get_mut(&flow_key) else {
                // Map and queue move in lockstep; an item without a map
                // entry has nothing to expire.
                state.expire_priority_queue.pop();
                continue;
            };

            if !aggregation_record.ready_to_send {
                aggregation_record.wait_for_ready_retries += 1;
                if aggregation_record.wait_for_ready_retries >= max_retries {
                    debug!(%flow_key, "dropping flow record that never became ready");
                    state.flow_key_record_map.remove(&flow_key);
                    state.expire_priority_queue.pop();
                    continue;
                }
                state.expire_priority_queue.update(&flow_key, |item| {
                    item.active_expire_time = now + self.active_expiry_timeout;
                    item.inactive_expire_time = now + self.inactive_expiry_timeout;
                });
                // The refreshed deadline is no earlier than any other
                // pending one, so the remaining items are not due either.
                break;
            }

            callback(&flow_key, aggregation_record).map_err(AggregationError::Callback)?;
            state.flow_key_record_map.remove(&flow_key);
            state.expire_priority_queue.pop();
        }
        Ok(())
    }

    /// Remove a flow from the map and the expiry queue.
    pub fn delete_flow_key_from_map(&self, flow_key: &FlowKey) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.flow_key_record_map.remove(flow_key).is_none() {
            return Err(AggregationError::NotFound(flow_key.clone()));
        }
        state.expire_priority_queue.remove(flow_key);
        Ok(())
    }

    fn add_or_update_record_in_map(&self, flow_key: &FlowKey, record: Record) -> Result<()> {
        // Required on every data record, whatever the merge will do with it.
        record
            .value("flowEndSeconds")
            .and_then(FieldValue::as_seconds)
            .ok_or_else(|| {
                AggregationError::MalformedRecord(
                    "flowEndSeconds missing or undecodable".to_string(),
                )
            })?;
        let flow_type = record
            .value("flowType")
            .and_then(FieldValue::as_u8)
            .and_then(FlowType::from_u8)
            .ok_or_else(|| {
                AggregationError::MalformedRecord("flowType missing or undecodable".to_string())
            })?;

        let now = Instant::now();
        let mut guard = self.state();
        let state = &mut *guard;

        match state.flow_key_record_map.get_mut(flow_key) {
            Some(existing) => {
                let from_source = is_record_from_source(&record);
                let from_destination = is_record_from_destination(&record);
                fill_correlation_fields(&self.correlate_fields, &mut existing.record, &record);
                if let Some(aggregate_elements) = &self.aggregate_elements {
                    merge_aggregation_elements(
                        aggregate_elements,
                        &mut existing.record,
                        &record,
                        from_source,
                        from_destination,
                    )?;
                }
                if !existing.ready_to_send {
                    existing.ready_to_send = is_ready_to_send(&existing.record, flow_type);
                }
                // The active deadline stays pinned to the first observation.
                state.expire_priority_queue.update(flow_key, |item| {
                    item.inactive_expire_time = now + self.inactive_expiry_timeout;
                });
            }
            None => {
                let mut record = record;
                if let Some(aggregate_elements) = &self.aggregate_elements {
                    add_stats_mirror_elements(aggregate_elements, &mut record)?;
                }
                let ready_to_send = is_ready_to_send(&record, flow_type);
                state.flow_key_record_map.insert(
                    flow_key.clone(),
                    AggregationFlowRecord {
                        record,
                        ready_to_send,
                        wait_for_ready_retries: 0,
                    },
                );
                state.expire_priority_queue.push(ItemToExpire {
                    flow_key: flow_key.clone(),
                    active_expire_time: now + self.active_expiry_timeout,
                    inactive_expire_time: now + self.inactive_expiry_timeout,
                });
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn queue_deadlines(&self, flow_key: &FlowKey) -> Option<(Instant, Instant)> {
        self.state().expire_priority_queue.deadlines(flow_key)
    }

    fn state(&self) -> MutexGuard<'_, AggregationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop(
    worker_id: usize,
    process: std::sync::Arc<AggregationProcess>,
    mut message_rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = message_rx.recv().await {
        if let Err(e) = process.aggregate_msg_by_flow_key(message) {
            warn!(worker = worker_id, "failed to aggregate message: {e}");
        }
    }
    debug!(worker = worker_id, "aggregation worker exiting");
}

/// Record which exporter originally produced a message's records: the
/// export address and observation domain id survive here after the decoder
/// has stripped transport framing. Elements already present are left alone;
/// template records get descriptors without values.
fn add_original_exporter_info(message: &mut Message) -> Result<()> {
    let export_address: IpAddr = message.export_address.parse().map_err(|_| {
        AggregationError::MalformedRecord(format!(
            "export address {:?} is not an IP address",
            message.export_address
        ))
    })?;
    let exporter_element_name = match export_address {
        IpAddr::V4(_) => "originalExporterIPv4Address",
        IpAddr::V6(_) => "originalExporterIPv6Address",
    };
    let is_data = message.set.set_type == SetType::Data;

    for record in &mut message.set.records {
        if !record.contains(exporter_element_name) {
            let element = registry::get_info_element(exporter_element_name, IANA_ENTERPRISE_ID)?;
            record.push(if is_data {
                InfoElementWithValue::new(element, FieldValue::Address(export_address))
            } else {
                InfoElementWithValue::without_value(element)
            });
        }
        if !record.contains("originalObservationDomainId") {
            let element =
                registry::get_info_element("originalObservationDomainId", IANA_ENTERPRISE_ID)?;
            record.push(if is_data {
                InfoElementWithValue::new(
                    element,
                    FieldValue::Unsigned32(message.observation_domain_id),
                )
            } else {
                InfoElementWithValue::without_value(element)
            });
        }
    }
    Ok(())
}

/// A source-side half-record names the source pod; the source-node exporter
/// is the only one that can resolve it.
fn is_record_from_source(record: &Record) -> bool {
    !record.str_value("sourcePodName").is_empty()
}

fn is_record_from_destination(record: &Record) -> bool {
    !record.str_value("destinationPodName").is_empty()
}

/// Whether a rule action on either side blocked the flow. A denied flow is
/// terminal with a single half-record: the far side never saw traffic.
fn has_deny_rule_action(record: &Record) -> bool {
    ["egressNetworkPolicyRuleAction", "ingressNetworkPolicyRuleAction"]
        .iter()
        .any(|&name| {
            record
                .value(name)
                .and_then(FieldValue::as_u8)
                .and_then(RuleAction::from_u8)
                .is_some_and(RuleAction::is_deny)
        })
}

fn is_ready_to_send(record: &Record, flow_type: FlowType) -> bool {
    match flow_type {
        FlowType::IntraNode | FlowType::ToExternal => true,
        FlowType::InterNode => {
            is_record_from_source(record) && is_record_from_destination(record)
                || has_deny_rule_action(record)
        }
    }
}

/// Correlation fields fill gaps only: the first exporter to provide a
/// non-empty value wins, so the two half-records complete each other without
/// clobbering anything.
fn fill_correlation_fields(correlate_fields: &[String], existing: &mut Record, incoming: &Record) {
    for name in correlate_fields {
        let Some(incoming_element) = incoming.get(name) else {
            continue;
        };
        if incoming_element.is_zero() {
            continue;
        }
        match existing.get_mut(name) {
            Some(existing_element) if existing_element.is_zero() => {
                existing_element.value = incoming_element.value.clone();
            }
            Some(_) => {}
            None => existing.push(incoming_element.clone()),
        }
    }
}

fn merge_aggregation_elements(
    aggregate_elements: &AggregationElements,
    existing: &mut Record,
    incoming: &Record,
    from_source: bool,
    from_destination: bool,
) -> Result<()> {
    // Progression fields track the latest record.
    for name in &aggregate_elements.non_stats_elements {
        if let Some(incoming_element) = incoming.get(name) {
            match existing.get_mut(name) {
                Some(existing_element) => {
                    existing_element.value = incoming_element.value.clone();
                }
                None => existing.push(incoming_element.clone()),
            }
        }
    }

    for (i, name) in aggregate_elements.stats_elements.iter().enumerate() {
        let latest = incoming.unsigned_value(name).unwrap_or(0);
        let current = existing.unsigned_value(name).unwrap_or(0);
        // Totals are monotonic per exporter, so the maximum is the safe
        // merge; deltas cover disjoint windows and accumulate.
        let merged = if name.contains("Delta") {
            current.saturating_add(latest)
        } else {
            current.max(latest)
        };
        set_unsigned_value(existing, name, merged)?;

        if from_source {
            set_unsigned_value(
                existing,
                &aggregate_elements.aggregated_source_stats_elements[i],
                latest,
            )?;
        }
        if from_destination {
            set_unsigned_value(
                existing,
                &aggregate_elements.aggregated_destination_stats_elements[i],
                latest,
            )?;
        }
    }
    Ok(())
}

/// Seed the per-side mirror elements when a flow is first inserted: the
/// inserting record's side gets its own counters, the unresolved side
/// starts at zero.
fn add_stats_mirror_elements(
    aggregate_elements: &AggregationElements,
    record: &mut Record,
) -> Result<()> {
    let from_source = is_record_from_source(record);
    let from_destination = is_record_from_destination(record);
    for (i, name) in aggregate_elements.stats_elements.iter().enumerate() {
        let value = record.unsigned_value(name).unwrap_or(0);
        let source_value = if from_source { value } else { 0 };
        let destination_value = if from_destination { value } else { 0 };
        set_unsigned_value(
            record,
            &aggregate_elements.aggregated_source_stats_elements[i],
            source_value,
        )?;
        set_unsigned_value(
            record,
            &aggregate_elements.aggregated_destination_stats_elements[i],
            destination_value,
        )?;
    }
    Ok(())
}

fn set_unsigned_value(record: &mut Record, name: &str, value: u64) -> Result<()> {
    match record.get_mut(name) {
        Some(element) => {
            element.value = Some(FieldValue::Unsigned64(value));
        }
        None => {
            let element = registry::get_info_element(name, stats_element_enterprise(name))?;
            record.push(InfoElementWithValue::new(
                element,
                FieldValue::Unsigned64(value),
            ));
        }
    }
    Ok(())
}

/// Namespace resolution for counter elements: per-side mirrors are cluster
/// elements, reverse-direction counters live in the reversed IANA
/// namespace, everything else is plain IANA.
fn stats_element_enterprise(name: &str) -> u32 {
    if name.ends_with("FromSourceNode") || name.ends_with("FromDestinationNode") {
        CLUSTER_ENTERPRISE_ID
    } else if name.starts_with("reverse") {
        IANA_REVERSED_ENTERPRISE_ID
    } else {
        IANA_ENTERPRISE_ID
    }
}
