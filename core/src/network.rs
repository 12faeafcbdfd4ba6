use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::analytics::NetworkMetrics;
use crate::error::CoordinatorError;
use crate::event::Event;
use crate::seed::link_seed;
use crate::traits::NodeId;
use crate::US_PER_SECOND;

#[derive(Serialize, Deserialize, Clone, Debug, Copy, PartialEq)]
#[serde(default)]
pub struct EdgeConfig {
    pub latency_us: u64,            // Base one-way latency
    pub jitter_us: u64,             // Amplitude of random variation
    pub packet_loss_rate: f64,      // Probability of packet drop (0.0 - 1.0)
    pub bandwidth_bps: Option<u64>, // Serialization rate, unlimited when absent
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            latency_us: 10_000,
            jitter_us: 0,
            packet_loss_rate: 0.0,
            bandwidth_bps: None,
        }
    }
}

impl EdgeConfig {
    /// Zero delay, no loss.
    pub fn ideal() -> Self {
        Self {
            latency_us: 0,
            jitter_us: 0,
            packet_loss_rate: 0.0,
            bandwidth_bps: None,
        }
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if !(0.0..=1.0).contains(&self.packet_loss_rate) {
            return Err(CoordinatorError::Config(format!(
                "packet_loss_rate {} is outside [0, 1]",
                self.packet_loss_rate
            )));
        }
        if self.bandwidth_bps == Some(0) {
            return Err(CoordinatorError::Config("bandwidth_bps must be positive".into()));
        }
        Ok(())
    }

    fn serialization_delay_us(&self, size_bytes: u32) -> u64 {
        match self.bandwidth_bps {
            Some(bps) if bps > 0 => {
                let bits = u128::from(size_bytes) * 8 * u128::from(US_PER_SECOND);
                u64::try_from(bits / u128::from(bps)).unwrap_or(u64::MAX)
            }
            _ => 0,
        }
    }
}

/// A physical link between two nodes.
/// It contains configuration for both directions.
/// Stored by canonical key (min_id, max_id).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Link {
    pub min_to_max: EdgeConfig,
    pub max_to_min: EdgeConfig,
}

impl Link {
    pub fn symmetric(edge: EdgeConfig) -> Self {
        Self {
            min_to_max: edge,
            max_to_min: edge,
        }
    }

    pub fn get_config(&self, from: &str, to: &str) -> &EdgeConfig {
        if from < to {
            &self.min_to_max
        } else {
            &self.max_to_min
        }
    }

    pub fn get_config_mut(&mut self, from: &str, to: &str) -> &mut EdgeConfig {
        if from < to {
            &mut self.min_to_max
        } else {
            &mut self.max_to_min
        }
    }
}

pub fn canonical_key(a: &str, b: &str) -> (NodeId, NodeId) {
    if a < b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One directed link entry in a scenario file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LinkConfig {
    pub src: NodeId,
    pub dst: NodeId,
    #[serde(default)]
    pub edge: EdgeConfig,
    /// Apply the same edge to `dst -> src` as well.
    #[serde(default)]
    pub symmetric: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkConfig {
    /// Zero delay, no loss.
    #[default]
    Direct,
    Latency {
        #[serde(default)]
        default_edge: EdgeConfig,
        #[serde(default)]
        links: Vec<LinkConfig>,
    },
}

/// Routing record attached to an event by the network model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NetworkMetadata {
    pub latency_us: u64,
    pub jitter_us: u64,
    pub sent_time_us: u64,
    pub delivery_time_us: u64,
    pub loss_rate: f64,
    /// Index of this event among all events routed over its directed link.
    pub sequence: u64,
    pub dropped: bool,
}

#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub delivered: Vec<Event>,
    pub dropped: Vec<Event>,
}

#[derive(Debug)]
enum Mode {
    Direct,
    Latency {
        default_edge: EdgeConfig,
        links: BTreeMap<(NodeId, NodeId), Link>,
    },
}

#[derive(Debug)]
struct LinkStream {
    rng: ChaCha8Rng,
    next_sequence: u64,
}

/// Turns produced events into delayed, possibly dropped deliveries.
///
/// Randomness is drawn from one ChaCha stream per directed link, seeded from
/// `(seed, source, destination)`, so a given seed and input order always
/// yield the same routing decisions.
#[derive(Debug)]
pub struct NetworkModel {
    mode: Mode,
    seed: u64,
    streams: BTreeMap<(NodeId, NodeId), LinkStream>,
    metrics: NetworkMetrics,
}

impl NetworkModel {
    pub fn direct() -> Self {
        Self {
            mode: Mode::Direct,
            seed: 0,
            streams: BTreeMap::new(),
            metrics: NetworkMetrics::default(),
        }
    }

    pub fn latency(default_edge: EdgeConfig, seed: u64) -> Result<Self, CoordinatorError> {
        default_edge.validate()?;
        Ok(Self {
            mode: Mode::Latency {
                default_edge,
                links: BTreeMap::new(),
            },
            seed,
            streams: BTreeMap::new(),
            metrics: NetworkMetrics::default(),
        })
    }

    pub fn from_config(config: &NetworkConfig, seed: u64) -> Result<Self, CoordinatorError> {
        match config {
            NetworkConfig::Direct => Ok(Self::direct()),
            NetworkConfig::Latency {
                default_edge,
                links,
            } => {
                let mut model = Self::latency(*default_edge, seed)?;
                for link in links {
                    model.set_edge(&link.src, &link.dst, link.edge)?;
                    if link.symmetric {
                        model.set_edge(&link.dst, &link.src, link.edge)?;
                    }
                }
                Ok(model)
            }
        }
    }

    pub fn connect_node(&mut self, a: &str, b: &str, link: Link) -> Result<(), CoordinatorError> {
        link.min_to_max.validate()?;
        link.max_to_min.validate()?;
        match &mut self.mode {
            Mode::Direct => Err(CoordinatorError::Config(
                "direct network model has no configurable links".into(),
            )),
            Mode::Latency { links, .. } => {
                links.insert(canonical_key(a, b), link);
                Ok(())
            }
        }
    }

    /// Sets one direction of a link, leaving the other at its current value.
    pub fn set_edge(&mut self, from: &str, to: &str, edge: EdgeConfig) -> Result<(), CoordinatorError> {
        edge.validate()?;
        match &mut self.mode {
            Mode::Direct => Err(CoordinatorError::Config(
                "direct network model has no configurable links".into(),
            )),
            Mode::Latency {
                default_edge,
                links,
            } => {
                let default_edge = *default_edge;
                let link = links
                    .entry(canonical_key(from, to))
                    .or_insert_with(|| Link::symmetric(default_edge));
                *link.get_config_mut(from, to) = edge;
                Ok(())
            }
        }
    }

    pub fn edge(&self, from: &str, to: &str) -> EdgeConfig {
        match &self.mode {
            Mode::Direct => EdgeConfig::ideal(),
            Mode::Latency {
                default_edge,
                links,
            } => links
                .get(&canonical_key(from, to))
                .map(|link| *link.get_config(from, to))
                .unwrap_or(*default_edge),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.mode, Mode::Direct)
    }

    /// Routes a batch in input order. Delivered events carry their delivery
    /// time as `timestamp_us`; dropped events keep their send time.
    pub fn route(&mut self, batch: Vec<Event>) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        for event in batch {
            let destination = event.destination.clone().unwrap_or_default();
            let edge = self.edge(&event.source, &destination);
            let seed = self.seed;
            let stream = self
                .streams
                .entry((event.source.clone(), destination.clone()))
                .or_insert_with(|| LinkStream {
                    rng: ChaCha8Rng::seed_from_u64(link_seed(seed, &event.source, &destination)),
                    next_sequence: 0,
                });
            let sequence = stream.next_sequence;
            stream.next_sequence += 1;

            let dropped = edge.packet_loss_rate > 0.0 && stream.rng.gen::<f64>() < edge.packet_loss_rate;
            let jitter_us = if edge.jitter_us > 0 {
                stream.rng.gen_range(0..=edge.jitter_us)
            } else {
                0
            };
            let latency_us = edge
                .latency_us
                .saturating_add(jitter_us)
                .saturating_add(edge.serialization_delay_us(event.size_bytes));
            let metadata = NetworkMetadata {
                latency_us,
                jitter_us,
                sent_time_us: event.timestamp_us,
                delivery_time_us: event.timestamp_us.saturating_add(latency_us),
                loss_rate: edge.packet_loss_rate,
                sequence,
                dropped,
            };

            self.metrics.record_sent();
            if dropped {
                trace!(source = %event.source, destination = %destination, sequence, "packet dropped");
                self.metrics.record_dropped();
                outcome.dropped.push(event.into_dropped(metadata));
            } else {
                self.metrics.record_delivered(latency_us);
                outcome.delivered.push(event.into_routed(metadata));
            }
        }
        outcome
    }

    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    /// Clears metrics and rewinds every link stream to its seeded start.
    pub fn reset(&mut self) {
        self.streams.clear();
        self.metrics.reset();
    }
}
