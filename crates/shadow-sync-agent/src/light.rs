//! Light actuator driven by the `powerOn` shadow field.

use serde_json::{json, Value};
use shadow_sync_core::Actuator;

/// A single on/off light.
#[derive(Debug, Clone, Default)]
pub struct Light {
    power_on: bool,
    toggles: u64,
}

impl Light {
    /// Create a light that starts switched off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported form of the light state.
    fn report(&self) -> Value {
        json!({"powerOn": u8::from(self.power_on)})
    }
}

impl Actuator for Light {
    fn apply(&mut self, desired: &Value) -> Value {
        match desired.get("powerOn").and_then(power_level) {
            Some(power_on) if power_on != self.power_on => {
                self.power_on = power_on;
                self.toggles += 1;
                tracing::info!(power_on, toggles = self.toggles, "Light toggled");
            }
            Some(_) => tracing::debug!("Light already in desired state"),
            None => tracing::debug!(%desired, "Delta carries no usable powerOn field"),
        }
        self.report()
    }
}

/// Accepts `0`/`1` as well as JSON booleans.
fn power_level(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(on) => Some(*on),
        Value::Number(level) => level.as_u64().map(|level| level != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_toggles_light() {
        let mut light = Light::new();

        assert_eq!(light.apply(&json!({"powerOn": 1})), json!({"powerOn": 1}));
        assert_eq!(light.toggles, 1);
        assert_eq!(light.apply(&json!({"powerOn": 1})), json!({"powerOn": 1}));
        assert_eq!(light.toggles, 1);
        assert_eq!(light.apply(&json!({"powerOn": false})), json!({"powerOn": 0}));
        assert_eq!(light.toggles, 2);
    }

    #[test]
    fn unrelated_delta_reports_current_state() {
        let mut light = Light::new();

        assert_eq!(light.apply(&json!({"color": "red"})), json!({"powerOn": 0}));
        assert_eq!(light.apply(&json!({"powerOn": "on"})), json!({"powerOn": 0}));
        assert_eq!(light.toggles, 0);
    }
}
