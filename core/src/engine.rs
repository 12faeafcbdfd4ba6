use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::analytics::{MetricsCollector, NetworkSummary, StepPoint};
use crate::error::{AdapterError, CoordinatorError, Phase};
use crate::event::Event;
use crate::network::NetworkModel;
use crate::seed::node_seed;
use crate::traits::{AdapterState, InitContext, NodeAdapter, NodeId, ShutdownOutcome};

/// Outcome of a run, cumulative over every `run_until` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub steps: u64,
    pub final_time_us: u64,
    pub wall_time_us: u64,
    pub emitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// Addressed to a node that is not registered.
    pub unroutable: u64,
    /// Emitted without a destination; recorded, never routed.
    pub local: u64,
    /// Routed but not yet due when the run ended.
    pub in_flight: u64,
    pub network: NetworkSummary,
    pub history: Vec<StepPoint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emitted_events: Vec<Event>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delivered_events: Vec<Event>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    emitted: u64,
    delivered: u64,
    dropped: u64,
    unroutable: u64,
    local: u64,
}

/// Owner of the global virtual clock.
///
/// Every step advances all adapters, in registration order, to the same
/// target before global time moves. Events produced in a step are routed
/// through the network model and handed to their destination on the first
/// later step whose window ends after their delivery time.
pub struct Coordinator {
    time_us: u64,
    adapters: Vec<Box<dyn NodeAdapter>>,
    index: HashMap<NodeId, usize>,
    /// Per adapter, routed events keyed by `(delivery_time_us, global sequence)`.
    pending: Vec<BTreeMap<(u64, u64), Event>>,
    network: NetworkModel,
    metrics: MetricsCollector,
    next_sequence: u64,
    steps: u64,
    counters: Counters,
    wall_time_us: u64,
    initialized: bool,
    shut_down: bool,
    record_events: bool,
    emitted_log: Vec<Event>,
    delivered_log: Vec<Event>,
}

impl Coordinator {
    pub fn new(network: NetworkModel) -> Self {
        Self {
            time_us: 0,
            adapters: Vec::new(),
            index: HashMap::new(),
            pending: Vec::new(),
            network,
            metrics: MetricsCollector::default(),
            next_sequence: 0,
            steps: 0,
            counters: Counters::default(),
            wall_time_us: 0,
            initialized: false,
            shut_down: false,
            record_events: false,
            emitted_log: Vec::new(),
            delivered_log: Vec::new(),
        }
    }

    /// Keeps every emitted and delivered event for the run report.
    pub fn with_event_recording(mut self, enabled: bool) -> Self {
        self.record_events = enabled;
        self
    }

    pub fn register_adapter(&mut self, adapter: Box<dyn NodeAdapter>) -> Result<(), CoordinatorError> {
        if self.shut_down {
            return Err(CoordinatorError::ShutDown);
        }
        if self.initialized {
            return Err(CoordinatorError::Config(format!(
                "cannot register {} after initialization",
                adapter.node_id()
            )));
        }
        let node_id = adapter.node_id().to_string();
        if self.index.contains_key(&node_id) {
            return Err(CoordinatorError::DuplicateNode(node_id));
        }
        debug!(node_id = %node_id, kind = %adapter.kind(), "adapter registered");
        self.index.insert(node_id, self.adapters.len());
        self.adapters.push(adapter);
        self.pending.push(BTreeMap::new());
        Ok(())
    }

    /// Initializes every adapter with its own seed derived from `global_seed`.
    /// On the first failure all adapters are shut down.
    pub fn initialize_all(&mut self, global_seed: u64) -> Result<(), CoordinatorError> {
        if self.shut_down {
            return Err(CoordinatorError::ShutDown);
        }
        if self.initialized {
            return Err(CoordinatorError::Config("adapters are already initialized".into()));
        }
        let mut failure = None;
        for adapter in self.adapters.iter_mut() {
            let ctx = InitContext {
                global_seed,
                seed: node_seed(global_seed, adapter.node_id()),
            };
            if let Err(e) = adapter.initialize(&ctx) {
                failure = Some((adapter.node_id().to_string(), e));
                break;
            }
        }
        if let Some((node_id, source)) = failure {
            return Err(self.abort(node_id, Phase::Initialize, source));
        }
        self.initialized = true;
        info!(adapters = self.adapters.len(), global_seed, "all adapters initialized");
        Ok(())
    }

    /// Steps global time in `quantum_us` increments until `duration_us`.
    pub fn run_until(&mut self, duration_us: u64, quantum_us: u64) -> Result<RunReport, CoordinatorError> {
        if quantum_us == 0 {
            return Err(CoordinatorError::InvalidQuantum);
        }
        if self.shut_down {
            return Err(CoordinatorError::ShutDown);
        }
        if !self.initialized {
            return Err(CoordinatorError::NotInitialized);
        }
        info!(from_us = self.time_us, duration_us, quantum_us, "run started");
        let started = Instant::now();
        let wall_before = self.wall_time_us;
        while self.time_us < duration_us {
            let target = self.time_us.saturating_add(quantum_us).min(duration_us);
            self.step(target)?;
        }
        self.wall_time_us = wall_before + started.elapsed().as_micros() as u64;
        let report = self.report();
        info!(
            steps = report.steps,
            time_us = report.final_time_us,
            emitted = report.emitted,
            delivered = report.delivered,
            dropped = report.dropped,
            "run finished"
        );
        Ok(report)
    }

    fn step(&mut self, target: u64) -> Result<(), CoordinatorError> {
        let step_started = Instant::now();
        let mut batch = Vec::new();
        let mut delivered_now = 0u32;
        let mut failure = None;

        for (i, adapter) in self.adapters.iter_mut().enumerate() {
            let later = self.pending[i].split_off(&(target, 0));
            let due: Vec<Event> = std::mem::replace(&mut self.pending[i], later).into_values().collect();
            delivered_now += due.len() as u32;
            if self.record_events {
                self.delivered_log.extend(due.iter().cloned());
            }
            match adapter.advance_to(target, due) {
                Ok(_) if adapter.current_time_us() > target => {
                    failure = Some((
                        adapter.node_id().to_string(),
                        AdapterError::protocol(format!(
                            "reported time {}us beyond step target {target}us",
                            adapter.current_time_us()
                        )),
                    ));
                    break;
                }
                Ok(out) => batch.extend(out),
                Err(e) => {
                    failure = Some((adapter.node_id().to_string(), e));
                    break;
                }
            }
        }
        if let Some((node_id, source)) = failure {
            return Err(self.abort(node_id, Phase::Advance, source));
        }

        let emitted_now = batch.len() as u32;
        self.counters.emitted += u64::from(emitted_now);
        self.counters.delivered += u64::from(delivered_now);
        if self.record_events {
            self.emitted_log.extend(batch.iter().cloned());
        }

        let mut routable = Vec::with_capacity(batch.len());
        for event in batch {
            match event.destination.as_deref() {
                None => self.counters.local += 1,
                Some(dst) if !self.index.contains_key(dst) => {
                    warn!(source = %event.source, destination = dst, time_us = event.timestamp_us, "event for unknown node");
                    self.counters.unroutable += 1;
                }
                Some(_) => routable.push(event),
            }
        }
        let outcome = self.network.route(routable);
        let dropped_now = outcome.dropped.len() as u32;
        self.counters.dropped += u64::from(dropped_now);
        for event in outcome.delivered {
            let Some(&slot) = event.destination.as_ref().and_then(|d| self.index.get(d)) else {
                continue;
            };
            self.pending[slot].insert((event.timestamp_us, self.next_sequence), event);
            self.next_sequence += 1;
        }

        self.steps += 1;
        self.metrics.update(
            self.steps,
            target,
            emitted_now,
            delivered_now,
            dropped_now,
            step_started.elapsed().as_micros() as u64,
        );
        debug!(
            step = self.steps,
            from_us = self.time_us,
            target_us = target,
            emitted = emitted_now,
            delivered = delivered_now,
            dropped = dropped_now,
            "step complete"
        );
        self.time_us = target;
        Ok(())
    }

    fn abort(&mut self, node_id: NodeId, phase: Phase, source: AdapterError) -> CoordinatorError {
        let err = CoordinatorError::Adapter {
            node_id,
            phase,
            time_us: self.time_us,
            kind: source.kind(),
            source,
        };
        error!("{err}, shutting down all adapters");
        self.shutdown_all();
        err
    }

    /// Shuts adapters down in reverse registration order. A panicking adapter
    /// is logged and skipped. Safe to call repeatedly.
    pub fn shutdown_all(&mut self) -> Vec<(NodeId, ShutdownOutcome)> {
        let first = !self.shut_down;
        self.shut_down = true;
        let in_flight = self.in_flight();
        if first && in_flight > 0 {
            info!(in_flight, time_us = self.time_us, "events still in flight at shutdown");
        }

        let mut outcomes = Vec::with_capacity(self.adapters.len());
        for adapter in self.adapters.iter_mut().rev() {
            let node_id = adapter.node_id().to_string();
            match catch_unwind(AssertUnwindSafe(|| adapter.shutdown())) {
                Ok(outcome) => {
                    match outcome {
                        ShutdownOutcome::Forced => warn!(node_id = %node_id, "adapter shutdown was forced"),
                        ShutdownOutcome::Graceful => debug!(node_id = %node_id, "adapter shut down"),
                        ShutdownOutcome::AlreadyShutDown => {}
                    }
                    outcomes.push((node_id, outcome));
                }
                Err(_) => {
                    error!(node_id = %node_id, "adapter panicked during shutdown");
                    outcomes.push((node_id, ShutdownOutcome::Forced));
                }
            }
        }
        outcomes
    }

    fn in_flight(&self) -> u64 {
        self.pending.iter().map(|p| p.len() as u64).sum()
    }

    fn report(&self) -> RunReport {
        RunReport {
            steps: self.steps,
            final_time_us: self.time_us,
            wall_time_us: self.wall_time_us,
            emitted: self.counters.emitted,
            delivered: self.counters.delivered,
            dropped: self.counters.dropped,
            unroutable: self.counters.unroutable,
            local: self.counters.local,
            in_flight: self.in_flight(),
            network: self.network.metrics().summary(),
            history: self.metrics.history.iter().copied().collect(),
            emitted_events: self.emitted_log.clone(),
            delivered_events: self.delivered_log.clone(),
        }
    }

    pub fn current_time_us(&self) -> u64 {
        self.time_us
    }

    pub fn network(&self) -> &NetworkModel {
        &self.network
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn adapter_states(&self) -> Vec<(NodeId, AdapterState)> {
        self.adapters
            .iter()
            .map(|a| (a.node_id().to_string(), a.state()))
            .collect()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shutdown_all();
        }
    }
}
