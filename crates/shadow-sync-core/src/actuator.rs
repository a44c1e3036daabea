//! Boundary between the sync engine and physical state.

use serde_json::{Map, Value};

/// Applies desired state to the device and reports what was actually set.
pub trait Actuator: Send {
    /// Apply a delta and return the resulting local state.
    fn apply(&mut self, desired: &Value) -> Value;
}

/// Actuator that takes every desired field as-is.
#[derive(Debug, Clone, Default)]
pub struct MirrorActuator {
    state: Map<String, Value>,
}

impl MirrorActuator {
    /// Create an actuator with empty local state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current local state.
    #[must_use]
    pub fn state(&self) -> Value {
        Value::Object(self.state.clone())
    }
}

impl Actuator for MirrorActuator {
    fn apply(&mut self, desired: &Value) -> Value {
        // Report only the fields this delta touched
        let mut applied = Map::new();
        if let Value::Object(fields) = desired {
            for (key, value) in fields {
                self.state.insert(key.clone(), value.clone());
                applied.insert(key.clone(), value.clone());
            }
        }
        Value::Object(applied)
    }
}
