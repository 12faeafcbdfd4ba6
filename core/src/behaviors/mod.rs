//! Built-in component models, hosted either in-process or inside the
//! reference worker binary.

use serde_json::Value;

use crate::buffer::TimeWindow;
use crate::error::AdapterError;
use crate::event::Event;

pub mod periodic;
pub mod relay;

/// A component model advanced window by window.
///
/// `advance` receives the events delivered to this node for the window and
/// returns what the node emitted inside it, in emission order.
pub trait Behavior: Send {
    fn kind(&self) -> &'static str;

    fn init(&mut self, node_id: &str, seed: u64) -> Result<(), AdapterError>;

    fn advance(&mut self, window: TimeWindow, inbound: Vec<Event>) -> Vec<Event>;

    fn shutdown(&mut self) {}

    fn encode_config(&self) -> Value {
        Value::Null
    }
}

macro_rules! register_behaviors {
    ($($kind:expr => $type:ty),* $(,)?) => {
        /// Builds a behavior from its registered name and JSON config. A null
        /// config selects the defaults.
        pub fn create_behavior(kind: &str, data: Value) -> Result<Box<dyn Behavior>, AdapterError> {
            match kind {
                $(
                    $kind => {
                        let config = if data.is_null() {
                            Default::default()
                        } else {
                            serde_json::from_value(data).map_err(|e| {
                                AdapterError::config(format!("{} config: {e}", $kind))
                            })?
                        };
                        Ok(Box::new(<$type>::new(config)?))
                    }
                )*
                other => Err(AdapterError::config(format!(
                    "unknown behavior {other:?}, expected one of {:?}",
                    behavior_kinds()
                ))),
            }
        }

        pub fn behavior_kinds() -> Vec<&'static str> {
            vec![$($kind),*]
        }
    };
}

register_behaviors!(
    "periodic" => periodic::PeriodicEmitter,
    "relay" => relay::Relay,
);
