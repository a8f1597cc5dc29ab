//! Agent configuration: YAML file plus CLI overrides, wire-level key
//! names, validated into per-controller binding configs.

use outrider_protocol::error::AgentError;
use outrider_protocol::{defaults, paths};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn default_master() -> Value {
    // conventional controller hostname, resolvable via site DNS
    Value::String("controller".to_string())
}

fn default_master_type() -> String {
    "str".to_string()
}

fn default_uri_format() -> String {
    "default".to_string()
}

fn default_file_client() -> String {
    "remote".to_string()
}

fn default_ipc_mode() -> String {
    "ipc".to_string()
}

fn default_true() -> bool {
    true
}

fn default_master_port() -> u16 {
    defaults::MASTER_PORT
}

fn default_loop_interval() -> u64 {
    defaults::LOOP_INTERVAL_SECS
}

fn default_auth_timeout() -> u64 {
    defaults::AUTH_TIMEOUT_SECS
}

fn default_auth_tries() -> u32 {
    defaults::AUTH_TRIES
}

fn default_acceptance_wait() -> u64 {
    defaults::ACCEPTANCE_WAIT_TIME_SECS
}

fn default_return_retry_timer() -> u64 {
    defaults::RETURN_RETRY_TIMER_SECS
}

fn default_return_retry_timer_max() -> u64 {
    defaults::RETURN_RETRY_TIMER_MAX_SECS
}

fn default_mine_interval() -> u64 {
    defaults::MINE_INTERVAL_MINUTES
}

fn default_forward_timeout() -> f64 {
    defaults::SYNDIC_EVENT_FORWARD_TIMEOUT_SECS
}

fn default_jid_hwm() -> usize {
    defaults::SYNDIC_JID_FORWARD_CACHE_HWM
}

fn default_master_job_cache() -> String {
    defaults::MASTER_JOB_CACHE.to_string()
}

fn default_tcp_pub_port() -> Value {
    Value::from(defaults::TCP_PUB_PORT)
}

fn default_tcp_pull_port() -> Value {
    Value::from(defaults::TCP_PULL_PORT)
}

/// The agent's static (or reloaded) configuration. Field names are
/// the wire-level configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identity. Defaults to the host name.
    pub id: String,

    // -- connection --------------------------------------------------
    /// Controller address, or ordered list under failover/multi-master.
    pub master: Value,
    /// Selection mode: str | failover | func.
    pub master_type: String,
    pub master_port: u16,
    /// `ip_only` disables host:port splitting of the master value.
    pub master_uri_format: String,
    pub master_shuffle: bool,
    pub master_alive_interval: u64,
    pub acceptance_wait_time: u64,
    pub acceptance_wait_time_max: u64,
    pub auth_timeout: u64,
    pub auth_tries: u32,
    /// Seconds between DNS retries; 0 falls back to 127.0.0.1.
    pub retry_dns: u64,
    pub ipv6: bool,
    /// Identity of the controller this agent relays for, echoed on
    /// relayed returns for loop prevention.
    pub master_id: Option<String>,

    // -- runtime -----------------------------------------------------
    pub cachedir: Option<PathBuf>,
    pub configdir: Option<PathBuf>,
    pub user: Option<String>,
    /// Worker isolation mode; this host substitutes blocking-pool
    /// threads either way.
    pub multiprocessing: bool,
    pub loop_interval: u64,
    /// Minutes between keep-alive pings to the controller; 0 disables.
    pub ping_interval: u64,
    /// Accepted for compatibility; inert on a statically linked
    /// registry.
    pub modules_max_memory: i64,
    pub file_client: String,
    pub use_master_when_local: bool,

    // -- scheduler ---------------------------------------------------
    pub schedule: Map<String, Value>,
    /// Minutes between attribute-tree refreshes; 0 disables.
    pub grains_refresh_every: u64,
    pub mine_enabled: bool,
    /// Minutes between mine pushes.
    pub mine_interval: u64,
    pub mine_functions: Map<String, Value>,
    pub return_retry_timer: u64,
    pub return_retry_timer_max: u64,
    pub schedule_returner: Option<Value>,
    /// One of highstate | sls | top; runs once at first connect.
    pub startup_states: Option<String>,
    pub sls_list: Vec<String>,
    pub top_file: Option<String>,

    // -- relay -------------------------------------------------------
    /// sync | cluster; present means this agent aggregates and relays.
    pub syndic_mode: Option<String>,
    pub syndic_event_forward_timeout: f64,
    pub syndic_jid_forward_cache_hwm: usize,
    pub master_job_cache: String,

    // -- transport ---------------------------------------------------
    pub ipc_mode: String,
    /// Int, or list under multi-controller.
    pub tcp_pub_port: Value,
    pub tcp_pull_port: Value,

    // -- trees and sensors -------------------------------------------
    /// Static attribute overrides merged over collected grains.
    pub grains: Map<String, Value>,
    /// Seed configuration-tree, replaced by controller fetches.
    pub pillar: Map<String, Value>,
    pub beacons: Map<String, Value>,
    pub range_server: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            master: default_master(),
            master_type: default_master_type(),
            master_port: default_master_port(),
            master_uri_format: default_uri_format(),
            master_shuffle: false,
            master_alive_interval: 0,
            acceptance_wait_time: default_acceptance_wait(),
            acceptance_wait_time_max: defaults::ACCEPTANCE_WAIT_TIME_MAX_SECS,
            auth_timeout: default_auth_timeout(),
            auth_tries: default_auth_tries(),
            retry_dns: 30,
            ipv6: false,
            master_id: None,
            cachedir: None,
            configdir: None,
            user: None,
            multiprocessing: true,
            loop_interval: default_loop_interval(),
            ping_interval: 0,
            modules_max_memory: -1,
            file_client: default_file_client(),
            use_master_when_local: false,
            schedule: Map::new(),
            grains_refresh_every: 0,
            mine_enabled: default_true(),
            mine_interval: default_mine_interval(),
            mine_functions: Map::new(),
            return_retry_timer: default_return_retry_timer(),
            return_retry_timer_max: default_return_retry_timer_max(),
            schedule_returner: None,
            startup_states: None,
            sls_list: Vec::new(),
            top_file: None,
            syndic_mode: None,
            syndic_event_forward_timeout: default_forward_timeout(),
            syndic_jid_forward_cache_hwm: default_jid_hwm(),
            master_job_cache: default_master_job_cache(),
            ipc_mode: default_ipc_mode(),
            tcp_pub_port: default_tcp_pub_port(),
            tcp_pull_port: default_tcp_pull_port(),
            grains: Map::new(),
            pillar: Map::new(),
            beacons: Map::new(),
            range_server: None,
        }
    }
}

impl AgentConfig {
    /// Load from a YAML file; a missing path yields pure defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let value: serde_yaml::Value = serde_yaml::from_str(&raw)
                    .map_err(|err| AgentError::ConfigFatal(format!("{}: {err}", path.display())))?;
                let value: Value = serde_json::to_value(value)
                    .map_err(|err| AgentError::ConfigFatal(format!("{}: {err}", path.display())))?;
                serde_json::from_value(value)
                    .map_err(|err| AgentError::ConfigFatal(format!("{}: {err}", path.display())))?
            }
            None => Self::default(),
        };
        config.fill_defaults();
        Ok(config)
    }

    /// Fill the host-derived fields left empty by the file.
    pub fn fill_defaults(&mut self) {
        if self.id.is_empty() {
            self.id = hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "outrider".to_string());
        }
        if self.cachedir.is_none() {
            self.cachedir = Some(paths::default_cache_dir());
        }
        if self.configdir.is_none() {
            self.configdir = Some(paths::default_config_dir());
        }
    }

    pub fn cachedir(&self) -> PathBuf {
        self.cachedir.clone().unwrap_or_else(paths::default_cache_dir)
    }

    pub fn configdir(&self) -> PathBuf {
        self.configdir.clone().unwrap_or_else(paths::default_config_dir)
    }

    pub fn publish_port(&self) -> u16 {
        self.master_port.saturating_sub(1)
    }

    /// The configured masters as a list, regardless of form.
    pub fn master_list(&self) -> Vec<String> {
        match &self.master {
            Value::String(one) => vec![one.clone()],
            Value::Array(many) => many
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_multi_master(&self) -> bool {
        self.master.is_array() && self.master_type != "failover"
    }

    /// Validate the selection mode and multi-controller port layout.
    /// Violations are fatal.
    pub fn validate(&mut self) -> Result<(), AgentError> {
        match self.master_type.as_str() {
            "str" => {}
            "func" => {
                let Some(spec) = self.master.as_str() else {
                    return Err(AgentError::ConfigFatal(
                        "master_type 'func' requires master to name a module.function".into(),
                    ));
                };
                if spec.split('.').count() != 2 {
                    return Err(AgentError::ConfigFatal(format!(
                        "failed to parse master resolver function {spec:?}"
                    )));
                }
            }
            "failover" => {
                match &self.master {
                    Value::Array(_) => {}
                    // a single string was intended as a one-entry list
                    Value::String(one) => {
                        warn!("master_type is 'failover' but master is a string; converting");
                        self.master = Value::Array(vec![Value::String(one.clone())]);
                    }
                    other => {
                        return Err(AgentError::ConfigFatal(format!(
                            "master_type set to 'failover' but master is not a list: {other}"
                        )));
                    }
                }
                // failover replaces DNS retry
                if self.retry_dns != 0 {
                    warn!(
                        "master_type 'failover' requires retry_dns 0; \
                         setting retry_dns to 0 to fail over on DNS errors"
                    );
                    self.retry_dns = 0;
                }
            }
            other => {
                return Err(AgentError::ConfigFatal(format!(
                    "invalid keyword {other:?} for master_type"
                )));
            }
        }

        if self.is_multi_master() && self.ipc_mode == "tcp" {
            let masters = self.master_list().len();
            for (key, value, default) in [
                ("tcp_pub_port", &self.tcp_pub_port, defaults::TCP_PUB_PORT),
                ("tcp_pull_port", &self.tcp_pull_port, defaults::TCP_PULL_PORT),
            ] {
                match value {
                    Value::Array(ports) if ports.len() == masters => {}
                    Value::Array(_) => {
                        return Err(AgentError::ConfigFatal(format!(
                            "{key} list must carry one port per controller"
                        )));
                    }
                    Value::Number(n) if n.as_u64() == Some(default as u64) => {}
                    _ => {
                        return Err(AgentError::ConfigFatal(format!(
                            "for multi-controller, {key} must be a list of ports or the \
                             default {default}"
                        )));
                    }
                }
            }
        }

        if self.modules_max_memory > 0 {
            info!(
                "modules_max_memory is set but the registry is statically linked; \
                 nothing to cap"
            );
        }

        Ok(())
    }

    /// One config per controller binding. Derived local ports are
    /// either the explicit list entries or `base + 2·index`.
    pub fn per_master(&self) -> Result<Vec<AgentConfig>, AgentError> {
        if !self.is_multi_master() {
            return Ok(vec![self.clone()]);
        }
        let masters = self.master_list();
        let mut bindings = Vec::with_capacity(masters.len());
        for (index, master) in masters.into_iter().enumerate() {
            let mut binding = self.clone();
            binding.master = Value::String(master);
            binding.tcp_pub_port = derive_port(&self.tcp_pub_port, index)?;
            binding.tcp_pull_port = derive_port(&self.tcp_pull_port, index)?;
            bindings.push(binding);
        }
        Ok(bindings)
    }

    /// The full configuration as a shared map.
    pub fn to_opts(&self) -> Value {
        let mut opts = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = opts.as_object_mut() {
            map.insert(
                "cachedir".to_string(),
                Value::String(self.cachedir().display().to_string()),
            );
            map.insert(
                "configdir".to_string(),
                Value::String(self.configdir().display().to_string()),
            );
        }
        opts
    }
}

fn derive_port(spec: &Value, index: usize) -> Result<Value, AgentError> {
    match spec {
        Value::Array(ports) => ports
            .get(index)
            .cloned()
            .ok_or_else(|| AgentError::ConfigFatal("port list shorter than master list".into())),
        Value::Number(base) => {
            let base = base
                .as_u64()
                .ok_or_else(|| AgentError::ConfigFatal("invalid port number".into()))?;
            Ok(Value::from(base + (index as u64) * 2))
        }
        other => Err(AgentError::ConfigFatal(format!(
            "invalid port specification: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn config_from_yaml(yaml: &str) -> AgentConfig {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        AgentConfig::load(Some(file.path())).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let config = AgentConfig::load(None).unwrap();
        assert!(!config.id.is_empty());
        assert_eq!(config.master_port, defaults::MASTER_PORT);
        assert_eq!(config.publish_port(), defaults::MASTER_PORT - 1);
        assert!(config.cachedir.is_some());
        assert_eq!(config.master_type, "str");
    }

    #[test]
    fn yaml_roundtrip() {
        let config = config_from_yaml(
            "id: web-01\nmaster: controller.example.com\nmaster_port: 4606\n\
             schedule:\n  ping:\n    function: test.ping\n    seconds: 2\n",
        );
        assert_eq!(config.id, "web-01");
        assert_eq!(config.master, json!("controller.example.com"));
        assert_eq!(config.master_port, 4606);
        assert!(config.schedule.contains_key("ping"));
    }

    #[test]
    fn invalid_master_type_is_fatal() {
        let mut config = AgentConfig::load(None).unwrap();
        config.master_type = "banana".to_string();
        assert!(matches!(
            config.validate(),
            Err(AgentError::ConfigFatal(_))
        ));
    }

    #[test]
    fn failover_forces_retry_dns_and_listifies() {
        let mut config = AgentConfig::load(None).unwrap();
        config.master_type = "failover".to_string();
        config.master = json!("only-one");
        config.retry_dns = 30;
        config.validate().unwrap();
        assert_eq!(config.master, json!(["only-one"]));
        assert_eq!(config.retry_dns, 0);
    }

    #[test]
    fn func_mode_requires_mod_dot_fun() {
        let mut config = AgentConfig::load(None).unwrap();
        config.master_type = "func".to_string();
        config.master = json!("resolver.current_master");
        config.validate().unwrap();

        config.master = json!("noDotHere");
        assert!(config.validate().is_err());
    }

    #[test]
    fn multi_master_port_rules() {
        let mut config = AgentConfig::load(None).unwrap();
        config.master = json!(["a", "b"]);
        config.ipc_mode = "tcp".to_string();
        // defaults are acceptable and derive by base + 2*index
        config.validate().unwrap();
        let bindings = config.per_master().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].master, json!("a"));
        assert_eq!(bindings[0].tcp_pub_port, json!(4510));
        assert_eq!(bindings[1].tcp_pub_port, json!(4512));
        assert_eq!(bindings[1].tcp_pull_port, json!(4513));

        // explicit lists must match in length
        config.tcp_pub_port = json!([5000]);
        assert!(config.validate().is_err());
        config.tcp_pub_port = json!([5000, 5002]);
        config.tcp_pull_port = json!([5001, 5003]);
        config.validate().unwrap();
        let bindings = config.per_master().unwrap();
        assert_eq!(bindings[1].tcp_pub_port, json!(5002));

        // a non-default scalar is fatal
        config.tcp_pub_port = json!(9999);
        assert!(config.validate().is_err());
    }

    #[test]
    fn opts_map_carries_paths() {
        let config = AgentConfig::load(None).unwrap();
        let opts = config.to_opts();
        assert!(opts["cachedir"].is_string());
        assert!(opts["configdir"].is_string());
        assert_eq!(opts["id"], json!(config.id));
    }
}
