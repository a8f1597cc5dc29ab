//! Payload types carried inside protocol messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Encryption tag on the publish payload marking a verified load.
/// Anything else is dropped before targeting.
pub const ENC_VERIFIED: &str = "aes";

/// Outer publish payload: `{enc, load}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubPayload {
    pub enc: String,
    pub load: Value,
}

impl PubPayload {
    pub fn verified(load: Value) -> Self {
        Self {
            enc: ENC_VERIFIED.to_string(),
            load,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.enc == ENC_VERIFIED
    }
}

/// The function field of a publication: one function or an ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunTarget {
    Single(String),
    Multi(Vec<String>),
}

impl FunTarget {
    pub fn is_multi(&self) -> bool {
        matches!(self, FunTarget::Multi(_))
    }
}

/// A decoded, verified inbound command.
///
/// `extra` keeps every field not modeled explicitly so the whole
/// publication can be echoed into `__pub_*` keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub jid: String,
    pub fun: FunTarget,
    pub arg: Vec<Value>,
    pub tgt: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tgt_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Comma-separated return sink names. Empty means controller only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    /// Delivery timeout, decremented when relayed downward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandEnvelope {
    /// Decode a load, enforcing the required fields. A load missing any
    /// of `tgt`, `jid`, `fun`, `arg` is not a command and yields None.
    pub fn decode(load: &Value) -> Option<Self> {
        let obj = load.as_object()?;
        for key in ["tgt", "jid", "fun", "arg"] {
            if !obj.contains_key(key) {
                return None;
            }
        }
        serde_json::from_value(load.clone()).ok()
    }

    /// The full publication as a flat map, for `__pub_*` packing.
    pub fn as_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Comma-split return sink names, deduplicated, order retained.
    pub fn sink_names(&self) -> Vec<String> {
        split_sinks(self.ret.as_deref().unwrap_or(""))
    }
}

/// Comma-split a sink spec, deduplicated, order retained.
pub fn split_sinks(spec: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in spec.split(',') {
        let name = name.trim();
        if !name.is_empty() && !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

/// Result of one job execution, before being wrapped into a return load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub jid: String,
    /// String for single jobs, list echo for multi jobs.
    pub fun: Value,
    #[serde(default)]
    pub fun_args: Vec<Value>,
    /// Return value, or `{fun: value}` map for multi jobs.
    #[serde(rename = "return")]
    pub retval: Value,
    /// Bool for single jobs, `{fun: bool}` map for multi jobs.
    pub success: Value,
    #[serde(default)]
    pub retcode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret_config: Option<String>,
    /// Set when the job came from a schedule entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl JobResult {
    pub fn new(jid: impl Into<String>, fun: Value) -> Self {
        Self {
            jid: jid.into(),
            fun,
            fun_args: Vec::new(),
            retval: Value::Null,
            success: Value::Bool(false),
            retcode: 0,
            out: None,
            metadata: None,
            master_id: None,
            ret_config: None,
            schedule: None,
        }
    }
}

/// A request load headed for the controller: `cmd` plus the flattened
/// result fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnLoad {
    pub cmd: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tok: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ReturnLoad {
    /// Build a `_return` load from a job result.
    pub fn job_return(agent_id: &str, tok: Option<String>, result: &JobResult) -> Self {
        let body = match serde_json::to_value(result) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            cmd: "_return".to_string(),
            id: agent_id.to_string(),
            tok,
            body,
        }
    }

    /// Build a `_syndic_return` load from an aggregated bucket.
    pub fn syndic_return(agent_id: &str, tok: Option<String>, bucket: Map<String, Value>) -> Self {
        Self {
            cmd: "_syndic_return".to_string(),
            id: agent_id.to_string(),
            tok,
            body: bucket,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A `_minion_event` load: a single tagged event or a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLoad {
    pub cmd: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tok: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Value>>,
}

impl EventLoad {
    pub fn single(agent_id: &str, tok: Option<String>, tag: &str, data: Value) -> Self {
        Self {
            cmd: "_minion_event".to_string(),
            id: agent_id.to_string(),
            tok,
            pretag: None,
            tag: Some(tag.to_string()),
            data: Some(data),
            events: None,
        }
    }

    pub fn batch(
        agent_id: &str,
        tok: Option<String>,
        events: Vec<Value>,
        pretag: Option<String>,
    ) -> Self {
        Self {
            cmd: "_minion_event".to_string(),
            id: agent_id.to_string(),
            tok,
            pretag,
            tag: None,
            data: None,
            events: Some(events),
        }
    }
}

/// Sign-in request sent on the DEALER channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInPayload {
    pub cmd: String,
    pub id: String,
}

impl SignInPayload {
    pub fn new(agent_id: &str) -> Self {
        Self {
            cmd: "_sign_in".to_string(),
            id: agent_id.to_string(),
        }
    }
}

/// Sign-in reply: the opaque session token, reattached to every
/// outbound load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInAck {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_requires_all_fields() {
        let full = json!({
            "tgt": "web-*", "jid": "20250101000001000000",
            "fun": "test.ping", "arg": []
        });
        assert!(CommandEnvelope::decode(&full).is_some());

        for missing in ["tgt", "jid", "fun", "arg"] {
            let mut load = full.clone();
            load.as_object_mut().unwrap().remove(missing);
            assert!(CommandEnvelope::decode(&load).is_none(), "{missing}");
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let load = json!({
            "tgt": "G@os:Linux and web-*",
            "tgt_type": "compound",
            "jid": "20250101000001000000",
            "fun": ["test.ping", "test.echo"],
            "arg": [[], ["x"]],
            "ret": "local_cache",
            "user": "ops",
            "metadata": {"origin": "ci"},
            "to": 60,
            "custom_field": 7
        });
        let envelope = CommandEnvelope::decode(&load).unwrap();
        assert!(envelope.fun.is_multi());
        assert_eq!(envelope.sink_names(), vec!["local_cache".to_string()]);
        assert_eq!(envelope.extra.get("custom_field"), Some(&json!(7)));

        let encoded = serde_json::to_value(&envelope).unwrap();
        let decoded = CommandEnvelope::decode(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn sink_names_dedup_order() {
        assert_eq!(
            split_sinks("local_cache, carbon,local_cache , "),
            vec!["local_cache".to_string(), "carbon".to_string()]
        );
        assert!(split_sinks("").is_empty());
    }

    #[test]
    fn return_load_shape() {
        let mut result = JobResult::new("20250101000001000000", json!("test.ping"));
        result.retval = json!(true);
        result.success = json!(true);
        let load = ReturnLoad::job_return("web-01", Some("tok".into()), &result).to_value();
        assert_eq!(load["cmd"], "_return");
        assert_eq!(load["id"], "web-01");
        assert_eq!(load["jid"], "20250101000001000000");
        assert_eq!(load["return"], json!(true));
        assert_eq!(load["success"], json!(true));
        assert_eq!(load["tok"], "tok");
    }

    #[test]
    fn unverified_payload() {
        let payload = PubPayload {
            enc: "clear".to_string(),
            load: json!({}),
        };
        assert!(!payload.is_verified());
        assert!(PubPayload::verified(json!({})).is_verified());
    }
}
