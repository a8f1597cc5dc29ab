//! Relay aggregation: buckets job returns from a lower tier by job
//! id and drains them upward in batches.

use outrider_protocol::jid;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Relay forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Forward all non-return events plus job returns.
    Sync,
    /// Forward only job returns and publishes; drop generic events
    /// and anything that originated from our own upstream.
    Cluster,
}

impl RelayMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sync" => Some(RelayMode::Sync),
            "cluster" => Some(RelayMode::Cluster),
            _ => None,
        }
    }
}

/// One drained job bucket, ready for a `_syndic_return`.
#[derive(Debug)]
pub struct JobBucket {
    pub master_id: Option<String>,
    pub body: Map<String, Value>,
}

pub struct RelayAggregator {
    mode: RelayMode,
    /// Our own upstream identity, for loop prevention.
    master_id: Option<String>,
    /// Aggregation buckets, keyed by event tag.
    jids: HashMap<String, Map<String, Value>>,
    raw_events: Vec<Value>,
    /// Job ids whose load was already fetched and forwarded once.
    jid_forward_cache: BTreeSet<String>,
    hwm: usize,
}

impl RelayAggregator {
    pub fn new(mode: RelayMode, master_id: Option<String>, hwm: usize) -> Self {
        Self {
            mode,
            master_id,
            jids: HashMap::new(),
            raw_events: Vec::new(),
            jid_forward_cache: BTreeSet::new(),
            hwm: hwm.max(1),
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Number of cached job ids (bounded by the high-water mark).
    pub fn cache_len(&self) -> usize {
        self.jid_forward_cache.len()
    }

    /// Feed one lower-tier event into the aggregator. `fetch_load` is
    /// consulted once per new job id to pull the original publication
    /// out of the master job cache.
    pub fn process_event<F>(&mut self, tag: &str, data: &Value, fetch_load: F)
    where
        F: FnOnce(&str) -> Value,
    {
        trace!("Relay got event {}", tag);
        let parts: Vec<&str> = tag.split('/').collect();
        let is_return = parts.len() >= 4
            && parts[1] == "job"
            && jid::is_jid(parts[2])
            && parts[3] == "ret"
            && data.get("return").is_some();

        if is_return {
            let Some(job_jid) = data.get("jid").and_then(Value::as_str) else {
                // not a job return
                return;
            };
            if self.mode == RelayMode::Cluster {
                let event_master = data.get("master_id").and_then(Value::as_str);
                if event_master.is_some() && event_master == self.master_id.as_deref() {
                    debug!("Return received with matching master_id, not forwarding");
                    return;
                }
            }

            let fresh = !self.jids.contains_key(tag);
            let bucket = self.jids.entry(tag.to_string()).or_default();
            if fresh {
                bucket.insert("__fun__".to_string(), data.get("fun").cloned().unwrap_or(Value::Null));
                bucket.insert("__jid__".to_string(), json!(job_jid));
                // Only forward each load once; don't hit the cache for
                // every agent return.
                let load = if self.jid_forward_cache.contains(job_jid) {
                    json!({})
                } else {
                    self.jid_forward_cache.insert(job_jid.to_string());
                    // evict the smallest (oldest) job ids past the mark
                    while self.jid_forward_cache.len() > self.hwm {
                        self.jid_forward_cache.pop_first();
                    }
                    fetch_load(job_jid)
                };
                bucket.insert("__load__".to_string(), load);
            }
            if let Some(master_id) = data.get("master_id") {
                bucket.insert("__master_id__".to_string(), master_id.clone());
            }
            if let (Some(agent), Some(ret)) = (
                data.get("id").and_then(Value::as_str),
                data.get("return"),
            ) {
                bucket.insert(agent.to_string(), ret.clone());
            }
        } else if self.mode == RelayMode::Sync && data.get("retcode").is_none() {
            self.raw_events.push(json!({ "tag": tag, "data": data }));
        }
    }

    /// Drain the buckets and the generic event list for forwarding.
    pub fn drain(&mut self) -> (Vec<Value>, Vec<JobBucket>) {
        let events = std::mem::take(&mut self.raw_events);
        let buckets = std::mem::take(&mut self.jids)
            .into_values()
            .map(|body| JobBucket {
                master_id: body
                    .get("__master_id__")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                body,
            })
            .collect();
        (events, buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_event(jid_suffix: u64, agent: &str, master_id: Option<&str>) -> (String, Value) {
        let job_jid = format!("{:020}", 20250101000001000000u128 + jid_suffix as u128);
        let tag = format!("outrider/job/{job_jid}/ret/{agent}");
        let mut data = json!({
            "jid": job_jid,
            "id": agent,
            "fun": "test.ping",
            "return": true,
            "retcode": 0,
        });
        if let Some(master) = master_id {
            data.as_object_mut()
                .unwrap()
                .insert("master_id".to_string(), json!(master));
        }
        (tag, data)
    }

    #[test]
    fn returns_bucket_by_tag_and_fetch_load_once() {
        let mut relay = RelayAggregator::new(RelayMode::Sync, None, 100);
        let mut fetches = 0;

        let (tag, data) = ret_event(0, "web-01", None);
        relay.process_event(&tag, &data, |_| {
            fetches += 1;
            json!({"fun": "test.ping", "tgt": "*"})
        });
        let (tag2, data2) = ret_event(0, "web-02", None);
        assert_eq!(tag, tag2);
        relay.process_event(&tag2, &data2, |_| {
            fetches += 1;
            json!({})
        });

        assert_eq!(fetches, 1);
        let (_, buckets) = relay.drain();
        assert_eq!(buckets.len(), 1);
        let body = &buckets[0].body;
        assert_eq!(body["web-01"], json!(true));
        assert_eq!(body["web-02"], json!(true));
        assert_eq!(body["__fun__"], json!("test.ping"));
        assert_eq!(body["__load__"]["tgt"], json!("*"));
    }

    #[test]
    fn cluster_drops_own_returns() {
        let mut relay =
            RelayAggregator::new(RelayMode::Cluster, Some("upstream-1".to_string()), 100);

        let (tag, data) = ret_event(1, "web-01", Some("upstream-1"));
        relay.process_event(&tag, &data, |_| json!({}));
        let (tag, data) = ret_event(2, "web-01", Some("other-master"));
        relay.process_event(&tag, &data, |_| json!({}));

        let (_, buckets) = relay.drain();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].master_id.as_deref(), Some("other-master"));
    }

    #[test]
    fn generic_events_only_in_sync_mode() {
        let generic = json!({"some": "event"});

        let mut sync = RelayAggregator::new(RelayMode::Sync, None, 100);
        sync.process_event("custom/tag", &generic, |_| json!({}));
        let (events, _) = sync.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["tag"], json!("custom/tag"));

        let mut cluster = RelayAggregator::new(RelayMode::Cluster, None, 100);
        cluster.process_event("custom/tag", &generic, |_| json!({}));
        let (events, _) = cluster.drain();
        assert!(events.is_empty());

        // events carrying a retcode are returns in disguise; never generic
        let mut sync = RelayAggregator::new(RelayMode::Sync, None, 100);
        sync.process_event("custom/tag", &json!({"retcode": 0}), |_| json!({}));
        let (events, _) = sync.drain();
        assert!(events.is_empty());
    }

    #[test]
    fn jid_cache_respects_hwm_and_evicts_smallest() {
        let mut relay = RelayAggregator::new(RelayMode::Sync, None, 3);
        for suffix in 0..5 {
            let (tag, data) = ret_event(suffix, "web-01", None);
            relay.process_event(&tag, &data, |_| json!({}));
        }
        assert_eq!(relay.cache_len(), 3);
        // the three largest jids survive
        let survivors: Vec<String> = relay.jid_forward_cache.iter().cloned().collect();
        assert_eq!(
            survivors,
            vec![
                format!("{:020}", 20250101000001000002u128),
                format!("{:020}", 20250101000001000003u128),
                format!("{:020}", 20250101000001000004u128),
            ]
        );
    }

    #[test]
    fn drain_resets_state() {
        let mut relay = RelayAggregator::new(RelayMode::Sync, None, 100);
        let (tag, data) = ret_event(0, "web-01", None);
        relay.process_event(&tag, &data, |_| json!({}));
        relay.process_event("x/y", &json!({"k": 1}), |_| json!({}));

        let (events, buckets) = relay.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(buckets.len(), 1);

        let (events, buckets) = relay.drain();
        assert!(events.is_empty() && buckets.is_empty());
    }
}
