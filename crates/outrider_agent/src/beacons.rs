//! Sensors ("beacons"): named collectors evaluated each loop tick,
//! whose emitted events are forwarded to the controller.

use outrider_registry::{FuncOutput, InvokeCtx};
use serde_json::{json, Map, Value};
use tracing::{error, warn};

pub struct Beacons {
    config: Map<String, Value>,
}

impl Beacons {
    pub fn new(config: Map<String, Value>) -> Self {
        Self { config }
    }

    pub fn list(&self) -> &Map<String, Value> {
        &self.config
    }

    fn globally_enabled(&self) -> bool {
        self.config
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn add(&mut self, name: &str, data: Value) {
        self.config.insert(name.to_string(), data);
    }

    pub fn modify(&mut self, name: &str, data: Value) {
        self.config.insert(name.to_string(), data);
    }

    pub fn delete(&mut self, name: &str) {
        self.config.remove(name);
    }

    pub fn enable_all(&mut self) {
        self.config.insert("enabled".to_string(), Value::Bool(true));
    }

    pub fn disable_all(&mut self) {
        self.config.insert("enabled".to_string(), Value::Bool(false));
    }

    pub fn enable(&mut self, name: &str) {
        self.set_flag(name, true);
    }

    pub fn disable(&mut self, name: &str) {
        self.set_flag(name, false);
    }

    fn set_flag(&mut self, name: &str, enabled: bool) {
        match self.config.get_mut(name) {
            Some(Value::Object(entry)) => {
                entry.insert("enabled".to_string(), Value::Bool(enabled));
            }
            Some(_) | None => warn!("Cannot toggle unknown sensor {:?}", name),
        }
    }

    /// Run every enabled sensor once; collect whatever events they
    /// emitted. A failing sensor is logged and skipped.
    pub fn process(&self, ctx: &InvokeCtx) -> Vec<Value> {
        let mut events = Vec::new();
        if !self.globally_enabled() {
            return events;
        }
        for (name, config) in &self.config {
            if name == "enabled" {
                continue;
            }
            if config.get("enabled").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            let sensor_fun = format!("{name}.beacon");
            let Some(function) = ctx.registry.lookup_sensor(&sensor_fun) else {
                warn!("Sensor {:?} is not in the registry, skipping", name);
                continue;
            };
            match function.invoke(ctx, &[config.clone()], &Map::new()) {
                Ok(FuncOutput::Value(Value::Array(emitted))) => {
                    for event in emitted {
                        // stamp the sensor name so receivers can route
                        let mut event = event;
                        if let Some(obj) = event.as_object_mut() {
                            obj.entry("beacon".to_string())
                                .or_insert_with(|| json!(name));
                        }
                        events.push(event);
                    }
                }
                Ok(_) => warn!("Sensor {:?} emitted a non-list value, ignoring", name),
                Err(err) => error!("The sensor {:?} errored: {}", name, err),
            }
        }
        events
    }
}
