use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::network::NetworkMetadata;
use crate::traits::NodeId;

/// Canonical timestamped message exchanged between adapters and the coordinator.
///
/// `network_metadata` is private: it is skipped when deserializing worker
/// output and can only be written by the network model while routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_us: u64,
    pub event_type: String,
    #[serde(default)]
    pub source: NodeId,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub destination: Option<NodeId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub size_bytes: u32,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    network_metadata: Option<NetworkMetadata>,
}

impl Event {
    pub fn new(timestamp_us: u64, event_type: impl Into<String>, source: impl Into<NodeId>) -> Self {
        Self {
            timestamp_us,
            event_type: event_type.into(),
            source: source.into(),
            destination: None,
            payload: Value::Null,
            size_bytes: 0,
            network_metadata: None,
        }
    }

    pub fn to(mut self, destination: impl Into<NodeId>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_size(mut self, size_bytes: u32) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn network_metadata(&self) -> Option<&NetworkMetadata> {
        self.network_metadata.as_ref()
    }

    /// Rewrites the event as it looks after the network carried it.
    pub(crate) fn into_routed(mut self, metadata: NetworkMetadata) -> Self {
        self.timestamp_us = metadata.delivery_time_us;
        self.network_metadata = Some(metadata);
        self
    }

    pub(crate) fn into_dropped(mut self, metadata: NetworkMetadata) -> Self {
        self.network_metadata = Some(metadata);
        self
    }
}

// Workers written against older schemas send "" for "no destination".
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<NodeId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
