use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Behavior;
use crate::buffer::TimeWindow;
use crate::error::AdapterError;
use crate::event::Event;
use crate::traits::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeriodicConfig {
    pub period_us: u64,
    pub start_us: u64,
    pub event_type: String,
    pub destination: Option<NodeId>,
    pub size_bytes: u32,
    /// Emitted readings are `mean ± spread`, uniformly distributed.
    pub mean: f64,
    pub spread: f64,
    /// Stop after this many emissions.
    pub limit: Option<u64>,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            period_us: 1_000_000,
            start_us: 0,
            event_type: "SAMPLE".to_string(),
            destination: None,
            size_bytes: 64,
            mean: 20.0,
            spread: 2.0,
            limit: None,
        }
    }
}

/// Sensor-style source: one reading every `period_us`, starting at `start_us`.
pub struct PeriodicEmitter {
    pub config: PeriodicConfig,
    node_id: NodeId,
    rng: ChaCha8Rng,
    emitted: u64,
    received: u64,
}

impl PeriodicEmitter {
    pub fn new(config: PeriodicConfig) -> Result<Self, AdapterError> {
        if config.period_us == 0 {
            return Err(AdapterError::config("periodic: period_us must be positive"));
        }
        if config.spread.is_nan() || config.spread < 0.0 {
            return Err(AdapterError::config("periodic: spread must be non-negative"));
        }
        // The sampled range is 2 * spread wide and must stay finite.
        let widest = config.mean.abs() + config.spread;
        if !config.mean.is_finite() || !(2.0 * config.spread).is_finite() || !widest.is_finite() {
            return Err(AdapterError::config(format!(
                "periodic: mean {} with spread {} is out of range",
                config.mean, config.spread
            )));
        }
        Ok(Self {
            config,
            node_id: NodeId::new(),
            rng: ChaCha8Rng::seed_from_u64(0),
            emitted: 0,
            received: 0,
        })
    }

    fn next_emission_us(&self) -> Option<u64> {
        if self.config.limit.is_some_and(|limit| self.emitted >= limit) {
            return None;
        }
        self.emitted
            .checked_mul(self.config.period_us)
            .and_then(|offset| offset.checked_add(self.config.start_us))
    }

    fn reading(&mut self) -> f64 {
        if self.config.spread == 0.0 {
            return self.config.mean;
        }
        self.config.mean + self.rng.gen_range(-self.config.spread..=self.config.spread)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl Behavior for PeriodicEmitter {
    fn kind(&self) -> &'static str {
        "periodic"
    }

    fn init(&mut self, node_id: &str, seed: u64) -> Result<(), AdapterError> {
        self.node_id = node_id.to_string();
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.emitted = 0;
        self.received = 0;
        Ok(())
    }

    fn advance(&mut self, window: TimeWindow, inbound: Vec<Event>) -> Vec<Event> {
        self.received += inbound.len() as u64;
        let mut out = Vec::new();
        while let Some(at) = self.next_emission_us() {
            if at >= window.to_us {
                break;
            }
            let value = self.reading();
            let seq = self.emitted;
            self.emitted += 1;
            // Emissions due before this window were missed while the node
            // was not advanced; skip them instead of reporting late.
            if at < window.from_us {
                continue;
            }
            let mut event = Event::new(at, self.config.event_type.clone(), self.node_id.clone())
                .with_payload(json!({ "seq": seq, "value": value }))
                .with_size(self.config.size_bytes);
            if let Some(destination) = &self.config.destination {
                event = event.to(destination.clone());
            }
            out.push(event);
        }
        out
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}
