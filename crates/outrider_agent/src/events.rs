//! Event multiplexer: single-threaded cooperative handling of local
//! control events. All handlers are non-blocking except the
//! configuration-tree refresh, which suspends on the controller fetch.

use crate::supervisor::{alive_job, Agent};
use crate::{grains, swap_matcher_ctx};
use outrider_matcher::MatcherContext;
use outrider_protocol::defaults;
use outrider_registry::{LocalEvent, OutboundLoad, Registry};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

impl Agent {
    /// Dispatch one local event by its tag prefix.
    pub(crate) async fn handle_event(&mut self, event: LocalEvent) {
        debug!("Handling event {:?}", event.tag);
        let LocalEvent { tag, data } = event;

        if tag.starts_with("module_refresh") {
            self.module_refresh();
        } else if tag.starts_with("pillar_refresh") {
            self.pillar_refresh().await;
        } else if tag.starts_with("manage_schedule") {
            self.manage_schedule(&data);
        } else if tag.starts_with("manage_beacons") {
            self.manage_beacons(&data);
        } else if tag.starts_with("grains_refresh") {
            self.grains_refresh().await;
        } else if tag.starts_with("environ_setenv") {
            environ_setenv(&data);
        } else if tag.starts_with("_minion_mine") {
            self.mine_send(data);
        } else if tag.starts_with("fire_master") {
            let events = data
                .get("events")
                .and_then(Value::as_array)
                .cloned();
            let pretag = data
                .get("pretag")
                .and_then(Value::as_str)
                .map(str::to_string);
            let forwarded_tag = data.get("tag").and_then(Value::as_str).map(str::to_string);
            let body = data.get("data").cloned().unwrap_or(json!({}));
            debug!("Forwarding controller event tag={:?}", forwarded_tag);
            self.send_event(forwarded_tag.as_deref(), body, events, pretag);
        } else if tag.starts_with("__master_disconnected") {
            self.master_disconnected(&data).await;
        } else if tag.starts_with("__master_connected") {
            self.master_connected();
        } else if tag.starts_with("_salt_error") {
            debug!("Forwarding agent error event tag={}", tag);
            self.send_event(Some(&tag), data, None, None);
        } else if tag.starts_with("salt/auth/creds") {
            self.update_creds(&data);
        } else if tag.starts_with(crate::dispatch::SYNDIC_PUB_TAG) {
            // handoff point for the lower-tier publisher, which lives
            // in the controller process
            debug!(
                "Publication ready for the lower tier: jid {:?}",
                data.get("jid")
            );
        } else if self.relay.is_some() {
            // everything else on the bus belongs to the lower tier
            let invoke_ctx = self.invoke_ctx();
            let job_cache = self.config.master_job_cache.clone();
            if let Some(relay) = self.relay.as_mut() {
                relay.process_event(&tag, &data, |jid| {
                    let fun = format!("{job_cache}.get_load");
                    invoke_ctx
                        .registry
                        .lookup_returner(&fun)
                        .and_then(|function| {
                            function
                                .invoke(&invoke_ctx, &[json!(jid)], &serde_json::Map::new())
                                .ok()
                        })
                        .and_then(|output| match output {
                            outrider_registry::FuncOutput::Value(value) => Some(value),
                            _ => None,
                        })
                        .unwrap_or(json!({}))
                });
            }
        }
    }

    /// Reload the function registry (whole-map swap).
    pub(crate) fn module_refresh(&mut self) {
        debug!("Refreshing modules");
        self.registry.swap(Registry::with_builtins());
    }

    /// Rebuild the configuration-tree from the controller, then reload
    /// the registry. A failed fetch is logged, never fatal.
    pub(crate) async fn pillar_refresh(&mut self) {
        debug!("Refreshing pillar");
        let fetched = self.fetch_pillar().await;
        match fetched {
            Some(pillar) => {
                if let Some(map) = self
                    .opts
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_object_mut()
                {
                    map.insert("pillar".to_string(), pillar);
                }
                self.refresh_matcher_ctx();
            }
            None => {
                error!(
                    "Pillar data could not be refreshed. One or more controllers may be down!"
                );
            }
        }
        self.module_refresh();
    }

    async fn fetch_pillar(&self) -> Option<Value> {
        let outbound = self.primary_outbound()?;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let opts = outrider_registry::opts_snapshot(&self.opts);
        let load = json!({
            "cmd": "_pillar",
            "id": self.config.id,
            "grains": opts.get("grains").cloned().unwrap_or(json!({})),
        });
        outbound
            .send(OutboundLoad {
                load,
                timeout_secs: self.config.auth_timeout,
                reply: Some(reply_tx),
            })
            .ok()?;

        let timeout = Duration::from_secs(self.config.auth_timeout.max(1) + 5);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(pillar)) if pillar.is_object() => Some(pillar),
            _ => None,
        }
    }

    /// Re-collect the attribute-tree; when it changed, the
    /// configuration-tree is refreshed too (which also reloads the
    /// registry).
    pub(crate) async fn grains_refresh(&mut self) {
        let fresh = grains::collect(&self.config.id, &self.config.grains);
        if fresh == self.grains_cache {
            return;
        }
        info!("Attribute tree changed; refreshing the configuration tree");
        self.grains_cache = fresh.clone();
        if let Some(map) = self
            .opts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .as_object_mut()
        {
            map.insert("grains".to_string(), fresh);
        }
        self.refresh_matcher_ctx();
        self.pillar_refresh().await;
    }

    /// Swap a fresh matcher context built from the current trees.
    pub(crate) fn refresh_matcher_ctx(&self) {
        let opts = outrider_registry::opts_snapshot(&self.opts);
        swap_matcher_ctx(
            &self.matcher_ctx,
            MatcherContext {
                id: self.config.id.clone(),
                grains: opts.get("grains").cloned().unwrap_or(json!({})),
                pillar: opts.get("pillar").cloned().unwrap_or(json!({})),
                range_server: self.config.range_server.clone(),
            },
        );
    }

    /// The `manage_schedule` surface:
    /// add/modify/delete/enable/disable/run/reload/list/save.
    pub(crate) fn manage_schedule(&mut self, data: &Value) {
        let func = data.get("func").and_then(Value::as_str).unwrap_or("");
        let name = data.get("name").and_then(Value::as_str).unwrap_or("");
        let schedule = data.get("schedule").cloned();
        let persist = data
            .get("persist")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        match func {
            "delete" => self.scheduler.delete_job(name, persist),
            "add" => {
                if let Some(schedule) = schedule {
                    if let Err(err) = self.scheduler.add_job(schedule, persist) {
                        error!("Cannot add schedule entry: {}", err);
                    }
                }
            }
            "modify" => {
                if let Some(schedule) = schedule {
                    self.scheduler.modify_job(name, schedule, persist);
                }
            }
            "enable" => self.scheduler.enable(),
            "disable" => self.scheduler.disable(),
            "enable_job" => self.scheduler.enable_job(name, persist),
            "disable_job" => self.scheduler.disable_job(name, persist),
            "run_job" => self.scheduler.run_job(name),
            "reload" => {
                if let Some(schedule) = schedule {
                    self.scheduler.reload(schedule);
                }
            }
            "list" => self.scheduler.list(),
            "save_schedule" => self.scheduler.save(),
            other => warn!("Unknown schedule management op {:?}", other),
        }
    }

    /// The `manage_beacons` surface.
    pub(crate) fn manage_beacons(&mut self, data: &Value) {
        let func = data.get("func").and_then(Value::as_str).unwrap_or("");
        let name = data.get("name").and_then(Value::as_str).unwrap_or("");
        let beacon_data = data.get("beacon_data").cloned().unwrap_or(json!({}));

        match func {
            "add" => self.beacons.add(name, beacon_data),
            "modify" => self.beacons.modify(name, beacon_data),
            "delete" => self.beacons.delete(name),
            "enable" => self.beacons.enable_all(),
            "disable" => self.beacons.disable_all(),
            "enable_beacon" => self.beacons.enable(name),
            "disable_beacon" => self.beacons.disable(name),
            "list" => {
                let listing = Value::Object(self.beacons.list().clone());
                let _ = self.events_tx.send(LocalEvent::new(
                    "/outrider/agent/beacons_list_complete",
                    json!({"complete": true, "beacons": listing}),
                ));
            }
            other => warn!("Unknown sensor management op {:?}", other),
        }
    }

    /// Push a mine snapshot upward. The load was assembled by
    /// `mine.update`; the request task attaches the token.
    pub(crate) fn mine_send(&mut self, load: Value) {
        let Some(outbound) = self.primary_outbound() else {
            warn!("Unable to send mine data: no controller connected");
            return;
        };
        let _ = outbound.send(OutboundLoad::fire_and_forget(
            load,
            defaults::CHANNEL_SEND_TIMEOUT_SECS,
        ));
    }

    /// Credential-cache update: the multiplexer is the only writer.
    pub(crate) fn update_creds(&mut self, data: &Value) {
        let Some(key) = data.get("key") else {
            return;
        };
        let key = match key {
            Value::Array(parts) => parts
                .iter()
                .map(|part| part.as_str().unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|"),
            Value::String(key) => key.clone(),
            _ => return,
        };
        let creds = data.get("creds").cloned().unwrap_or(json!({}));
        debug!("Updating auth data for {}", key);
        self.creds.insert(key, creds);
    }

    /// Controller lost: flip the liveness probe, and under failover
    /// try the next candidate; on exhaustion ask for a restart.
    pub(crate) async fn master_disconnected(&mut self, data: &Value) {
        let Some(master) = data.get("master").and_then(Value::as_str).map(str::to_string)
        else {
            return;
        };
        let Some(index) = self
            .bindings
            .iter()
            .position(|binding| binding.master.as_deref() == Some(master.as_str()))
        else {
            warn!("Disconnect event for unknown controller {:?}", master);
            return;
        };
        if !self.connected {
            return;
        }
        self.connected = false;
        info!("Connection to controller {} lost", master);

        let interval = self.config.master_alive_interval;
        if interval > 0 {
            let name = self.alive_job_name(&master);
            self.scheduler
                .modify_job(&name, alive_job(&master, interval, false), false);
        }

        if self.bindings[index].manager.cfg.master_type == "failover" {
            info!("Trying to tune in to next controller from the candidate list");
            self.reconnect_failover(index, &master).await;
        }
    }

    async fn reconnect_failover(&mut self, index: usize, failed_master: &str) {
        {
            let binding = &mut self.bindings[index];
            binding.teardown();
            binding.manager.mark_disconnected();
            binding.manager.current_master = Some(failed_master.to_string());
        }
        match self.bindings[index].manager.connect(true).await {
            Ok(connection) => {
                let new_master = connection.master.clone();
                info!(
                    "Re-initialising subsystems for new controller {}",
                    new_master
                );
                self.wire_binding(index, connection);
                self.module_refresh();
                self.connected = true;

                let interval = self.config.master_alive_interval;
                if interval > 0 {
                    let old_name = self.alive_job_name(failed_master);
                    self.scheduler.delete_job(&old_name, false);
                    let name = self.alive_job_name(&new_master);
                    self.scheduler
                        .modify_job(&name, alive_job(&new_master, interval, true), false);
                }
                self.fire_master_start();
                info!("Agent is ready to receive requests!");
            }
            Err(err) => {
                error!("No failover controller could be reached: {}", err);
                self.restart = true;
            }
        }
    }

    /// Controller back: handled once per transition so the log stays
    /// quiet on repeats.
    pub(crate) fn master_connected(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        for binding in &mut self.bindings {
            binding.manager.mark_connected();
        }
        let interval = self.config.master_alive_interval;
        if interval > 0 {
            let masters: Vec<String> = self
                .bindings
                .iter()
                .filter_map(|binding| binding.master.clone())
                .collect();
            for master in masters {
                info!("Connection to controller {} re-established", master);
                let name = self.alive_job_name(&master);
                self.scheduler
                    .modify_job(&name, alive_job(&master, interval, true), false);
            }
        }
    }
}

/// Mutate the process environment from an event payload.
fn environ_setenv(data: &Value) {
    let Some(environ) = data.get("environ").and_then(Value::as_object) else {
        return;
    };
    let false_unsets = data
        .get("false_unsets")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let clear_all = data
        .get("clear_all")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if clear_all {
        for (key, _) in std::env::vars() {
            std::env::remove_var(key);
        }
    }
    for (key, value) in environ {
        match value {
            Value::Bool(false) if false_unsets => std::env::remove_var(key),
            Value::Bool(false) => std::env::set_var(key, ""),
            Value::String(value) => std::env::set_var(key, value),
            other => std::env::set_var(key, other.to_string()),
        }
    }
}
