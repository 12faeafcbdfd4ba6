use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Behavior;
use crate::buffer::TimeWindow;
use crate::error::AdapterError;
use crate::event::Event;
use crate::traits::NodeId;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Where received events are forwarded. Without one the relay is a sink.
    pub destination: Option<NodeId>,
    pub processing_delay_us: u64,
    /// Replaces the forwarded event's type when set.
    pub event_type: Option<String>,
}

/// Gateway-style node: forwards each received event after a fixed
/// processing delay.
pub struct Relay {
    pub config: RelayConfig,
    node_id: NodeId,
    pending: BTreeMap<(u64, u64), Event>,
    next_seq: u64,
    received: u64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            config,
            node_id: NodeId::new(),
            pending: BTreeMap::new(),
            next_seq: 0,
            received: 0,
        })
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Behavior for Relay {
    fn kind(&self) -> &'static str {
        "relay"
    }

    fn init(&mut self, node_id: &str, _seed: u64) -> Result<(), AdapterError> {
        self.node_id = node_id.to_string();
        self.pending.clear();
        self.received = 0;
        Ok(())
    }

    fn advance(&mut self, window: TimeWindow, inbound: Vec<Event>) -> Vec<Event> {
        self.received += inbound.len() as u64;
        if let Some(destination) = &self.config.destination {
            for event in inbound {
                // Inbound input is processed no earlier than the window it arrives in.
                let at = event
                    .timestamp_us
                    .max(window.from_us)
                    .saturating_add(self.config.processing_delay_us);
                let event_type = self
                    .config
                    .event_type
                    .clone()
                    .unwrap_or_else(|| event.event_type.clone());
                let forwarded = Event::new(at, event_type, self.node_id.clone())
                    .to(destination.clone())
                    .with_payload(json!({ "from": event.source, "data": event.payload }))
                    .with_size(event.size_bytes);
                self.pending.insert((at, self.next_seq), forwarded);
                self.next_seq += 1;
            }
        }

        let later = self.pending.split_off(&(window.to_us, 0));
        std::mem::replace(&mut self.pending, later).into_values().collect()
    }

    fn shutdown(&mut self) {
        self.pending.clear();
    }

    fn encode_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}
