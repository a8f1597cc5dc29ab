//! Supervisor: owns the event loop, the signal handlers and one
//! connection manager per configured upstream.

use crate::beacons::Beacons;
use crate::config::AgentConfig;
use crate::conn::{self, ActiveConnection, ConnectionManager};
use crate::dispatch::Dispatcher;
use crate::relay::{RelayAggregator, RelayMode};
use crate::{grains, SharedMatcherCtx};
use chrono::Utc;
use outrider_matcher::MatcherContext;
use outrider_protocol::envelope::EventLoad;
use outrider_protocol::error::AgentError;
use outrider_protocol::{defaults, ledger, OpCode};
use outrider_registry::{
    opts_snapshot, EventReceiver, EventSender, FuncOutput, InvokeCtx, LocalEvent, OutboundLoad,
    OutboundSender, Registry, SharedOpts, SharedRegistry,
};
use outrider_schedule::Scheduler;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Forward timeout for relayed events, seconds.
const RELAY_EVENT_TIMEOUT: u64 = 5;

/// How the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Clean shutdown (signal).
    Shutdown,
    /// All controllers lost; the process should start over.
    Restart,
}

/// One controller binding with its live socket tasks.
pub(crate) struct Binding {
    pub manager: ConnectionManager,
    pub master: Option<String>,
    pub outbound: Option<OutboundSender>,
    sub_task: Option<JoinHandle<()>>,
}

impl Binding {
    pub(crate) fn teardown(&mut self) {
        if let Some(task) = self.sub_task.take() {
            task.abort();
        }
        self.outbound = None;
        self.master = None;
    }
}

pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) opts: SharedOpts,
    pub(crate) registry: SharedRegistry,
    pub(crate) scheduler: Scheduler,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) beacons: Beacons,
    pub(crate) relay: Option<RelayAggregator>,
    pub(crate) matcher_ctx: SharedMatcherCtx,
    /// Authentication-credential cache. Writes happen only in the
    /// event multiplexer; everyone else takes snapshots.
    pub(crate) creds: Map<String, Value>,
    pub(crate) grains_cache: Value,
    pub(crate) events_tx: EventSender,
    events_rx: Option<EventReceiver>,
    pub(crate) bindings: Vec<Binding>,
    /// Outbound handle of the primary (first connected) binding;
    /// the scheduler's and relay's returns route through it.
    pub(crate) primary: Arc<RwLock<Option<OutboundSender>>>,
    router_task: Option<JoinHandle<()>>,
    pub(crate) connected: bool,
    pub(crate) restart: bool,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let cachedir = config.cachedir();
        let proc_dir = ledger::ensure_proc_dir(&cachedir, ledger::ProcDirOptions::default())?;

        let grains_value = grains::collect(&config.id, &config.grains);
        let mut opts_value = config.to_opts();
        if let Some(map) = opts_value.as_object_mut() {
            map.insert("grains".to_string(), grains_value.clone());
            map.insert(
                "pillar".to_string(),
                Value::Object(config.pillar.clone()),
            );
        }
        let opts: SharedOpts = Arc::new(RwLock::new(opts_value));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (agg_tx, agg_rx) = mpsc::unbounded_channel();
        let registry = SharedRegistry::new(Registry::with_builtins());

        let matcher_ctx: SharedMatcherCtx = Arc::new(RwLock::new(Arc::new(MatcherContext {
            id: config.id.clone(),
            grains: grains_value.clone(),
            pillar: Value::Object(config.pillar.clone()),
            range_server: config.range_server.clone(),
        })));

        let scheduler = Scheduler::new(
            opts.clone(),
            registry.clone(),
            events_tx.clone(),
            agg_tx.clone(),
        )
        .map_err(|err| AgentError::ConfigFatal(err.to_string()))?;

        let mut dispatcher = Dispatcher::new(
            opts.clone(),
            registry.clone(),
            matcher_ctx.clone(),
            events_tx.clone(),
            proc_dir.clone(),
        );
        if config.syndic_mode.is_some() {
            dispatcher = dispatcher.with_relay_forward();
        }

        let relay = config
            .syndic_mode
            .as_deref()
            .map(|mode| {
                RelayMode::parse(mode).ok_or_else(|| {
                    AgentError::ConfigFatal(format!("invalid syndic_mode {mode:?}"))
                })
            })
            .transpose()?
            .map(|mode| {
                RelayAggregator::new(
                    mode,
                    config.master_id.clone(),
                    config.syndic_jid_forward_cache_hwm,
                )
            });

        let bindings = config
            .per_master()?
            .into_iter()
            .map(|binding_cfg| Binding {
                manager: ConnectionManager::new(binding_cfg),
                master: None,
                outbound: None,
                sub_task: None,
            })
            .collect();

        let primary: Arc<RwLock<Option<OutboundSender>>> = Arc::new(RwLock::new(None));
        let router_task = Some(spawn_router(agg_rx, primary.clone()));

        Ok(Self {
            config,
            opts,
            registry,
            scheduler,
            dispatcher,
            beacons: Beacons::new(Map::new()),
            relay,
            matcher_ctx,
            creds: Map::new(),
            grains_cache: grains_value,
            events_tx,
            events_rx: Some(events_rx),
            bindings,
            primary,
            router_task,
            connected: false,
            restart: false,
        })
    }

    /// A read-side snapshot of the credential cache.
    pub fn creds_snapshot(&self) -> Map<String, Value> {
        self.creds.clone()
    }

    /// Block until every configured controller accepted the
    /// subscription, then service the main loop until shutdown.
    pub async fn run(&mut self) -> Result<RunOutcome, AgentError> {
        self.beacons = Beacons::new(self.config.beacons.clone());

        // Initial connect happens before any other event is serviced.
        self.connect_all().await?;
        self.post_master_init().await;
        info!("Agent is ready to receive requests!");

        let outcome = self.main_loop().await;
        self.shutdown();
        Ok(outcome)
    }

    async fn connect_all(&mut self) -> Result<(), AgentError> {
        for index in 0..self.bindings.len() {
            self.resolve_func_master(index)?;
            let connection = self.bindings[index].manager.connect(false).await?;
            self.wire_binding(index, connection);
        }
        self.connected = true;
        Ok(())
    }

    /// In `func` selection mode the controller address comes from a
    /// registry function; rewrite the binding config before connecting.
    fn resolve_func_master(&mut self, index: usize) -> Result<(), AgentError> {
        let cfg = &self.bindings[index].manager.cfg;
        if cfg.master_type != "func" {
            return Ok(());
        }
        let spec = cfg.master.as_str().unwrap_or_default().to_string();
        let ctx = self.invoke_ctx();
        let resolved = ctx
            .registry
            .lookup(&spec)
            .and_then(|function| function.invoke(&ctx, &[], &Map::new()).ok())
            .and_then(|output| match output {
                FuncOutput::Value(Value::String(master)) => Some(master),
                _ => None,
            });
        match resolved {
            Some(master) => {
                info!("Evaluated controller from module: {}", master);
                let manager = &mut self.bindings[index].manager;
                manager.cfg.master = Value::String(master);
                manager.cfg.master_type = "str".to_string();
                Ok(())
            }
            None => Err(AgentError::ConfigFatal(format!(
                "failed to evaluate master address from module {spec:?}"
            ))),
        }
    }

    /// Install the socket tasks for a fresh connection and update the
    /// shared state that hangs off it.
    pub(crate) fn wire_binding(&mut self, index: usize, connection: ActiveConnection) {
        let master = connection.master.clone();
        info!(
            "Bound to controller {} (publish {})",
            connection.master_uri, connection.publish_uri
        );

        let dispatcher = self.dispatcher.clone();
        let outbound = connection.outbound.clone();
        let events = self.events_tx.clone();
        let sub_master = master.clone();
        let mut sub = connection.sub;
        let sub_task = tokio::spawn(async move {
            loop {
                match conn::recv_publish(&mut sub).await {
                    Ok(frame) if frame.opcode == OpCode::Publish => {
                        match frame.json::<Value>() {
                            Ok(payload) => dispatcher.handle_payload(&payload, &outbound),
                            Err(err) => warn!("Undecodable publish payload: {}", err),
                        }
                    }
                    Ok(frame) => {
                        debug!("Ignoring {:?} on the publish stream", frame.opcode)
                    }
                    Err(err) => {
                        warn!("Publish stream from {} broke: {}", sub_master, err);
                        let _ = events.send(LocalEvent::new(
                            "__master_disconnected",
                            json!({ "master": sub_master }),
                        ));
                        break;
                    }
                }
            }
        });

        let binding = &mut self.bindings[index];
        binding.master = Some(master.clone());
        binding.outbound = Some(connection.outbound.clone());
        binding.sub_task = Some(sub_task);

        if index == 0 {
            let mut primary = self.primary.write().unwrap_or_else(|e| e.into_inner());
            *primary = Some(connection.outbound);
            if let Some(map) = self
                .opts
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .as_object_mut()
            {
                map.insert("master".to_string(), Value::String(master));
            }
        }
    }

    /// Post-connect setup: probe schedule entries, start events,
    /// initial configuration-tree fetch, startup states.
    async fn post_master_init(&mut self) {
        self.pillar_refresh().await;
        self.fire_master_start();

        if self.config.mine_enabled && self.config.mine_interval > 0 {
            let job = json!({
                "__mine_interval": {
                    "function": "mine.update",
                    "minutes": self.config.mine_interval,
                    "jid_include": true,
                    "maxrunning": 2,
                    "return_job": false,
                }
            });
            let _ = self.scheduler.add_job(job, false);
        }

        if self.config.master_alive_interval > 0 {
            for index in 0..self.bindings.len() {
                if let Some(master) = self.bindings[index].master.clone() {
                    let name = self.alive_job_name(&master);
                    self.scheduler.modify_job(
                        &name,
                        alive_job(&master, self.config.master_alive_interval, true),
                        false,
                    );
                }
            }
        }

        if self.config.grains_refresh_every > 0 {
            info!(
                "Enabling the attribute-tree refresher, every {} minute(s)",
                self.config.grains_refresh_every
            );
            let job = json!({
                "__update_grains": {
                    "function": "event.fire",
                    "args": [{}, "grains_refresh"],
                    "minutes": self.config.grains_refresh_every,
                }
            });
            let _ = self.scheduler.add_job(job, false);
        }

        self.startup_states();
    }

    /// If configured, synthesize one local state-run job at startup.
    fn startup_states(&mut self) {
        let Some(mode) = self.config.startup_states.clone() else {
            return;
        };
        let (fun, args): (&str, Vec<Value>) = match mode.as_str() {
            "highstate" => ("state.highstate", Vec::new()),
            "sls" => (
                "state.sls",
                self.config.sls_list.iter().map(|s| json!(s)).collect(),
            ),
            "top" => (
                "state.top",
                self.config.top_file.iter().map(|s| json!(s)).collect(),
            ),
            other => {
                error!("Invalid startup_states {:?}, ignoring", other);
                return;
            }
        };
        if !self.registry.snapshot().contains(fun) {
            info!(
                "startup_states is set but {} is not in the registry; skipping",
                fun
            );
            return;
        }
        let envelope = json!({
            "enc": "aes",
            "load": {
                "tgt": self.config.id,
                "tgt_type": "list",
                "jid": outrider_protocol::jid::gen(),
                "fun": fun,
                "arg": args,
            }
        });
        if let Some(outbound) = self.primary_outbound() {
            self.dispatcher.handle_payload(&envelope, &outbound);
        }
    }

    pub(crate) fn alive_job_name(&self, master: &str) -> String {
        if self.bindings.len() == 1 {
            "__master_alive".to_string()
        } else {
            format!("__master_alive_{master}")
        }
    }

    pub(crate) fn primary_outbound(&self) -> Option<OutboundSender> {
        self.primary
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Build an invocation context from the current shared state.
    pub(crate) fn invoke_ctx(&self) -> InvokeCtx {
        let opts = opts_snapshot(&self.opts);
        InvokeCtx {
            id: self.config.id.clone(),
            grains: opts.get("grains").cloned().unwrap_or(json!({})),
            pillar: opts.get("pillar").cloned().unwrap_or(json!({})),
            cachedir: PathBuf::from(
                opts.get("cachedir").and_then(Value::as_str).unwrap_or("."),
            ),
            events: self.events_tx.clone(),
            registry: self.registry.snapshot(),
            opts,
        }
    }

    /// Announce this agent to the controller, twice: the flat start
    /// tag and the namespaced one.
    pub(crate) fn fire_master_start(&self) {
        let text = format!(
            "Agent {} started at {}",
            self.config.id,
            Utc::now().to_rfc2822()
        );
        self.send_event(Some("minion_start"), json!(text), None, None);
        self.send_event(
            Some(&format!("minion/{}/start", self.config.id)),
            json!(text),
            None,
            None,
        );
    }

    /// Forward an event (or batch) to the controller, best effort.
    pub(crate) fn send_event(
        &self,
        tag: Option<&str>,
        data: Value,
        events: Option<Vec<Value>>,
        pretag: Option<String>,
    ) {
        let load = match (events, tag) {
            (Some(events), _) => EventLoad::batch(&self.config.id, None, events, pretag),
            (None, Some(tag)) => EventLoad::single(&self.config.id, None, tag, data),
            (None, None) => return,
        };
        let Some(outbound) = self.primary_outbound() else {
            warn!("No connected controller; dropping event");
            return;
        };
        let value = serde_json::to_value(&load).unwrap_or(Value::Null);
        let _ = outbound.send(OutboundLoad::fire_and_forget(
            value,
            defaults::CHANNEL_SEND_TIMEOUT_SECS,
        ));
    }

    async fn main_loop(&mut self) -> RunOutcome {
        let mut events_rx = self.events_rx.take().expect("run() called twice");
        let loop_interval = self.config.loop_interval.max(1);
        let mut tick = tokio::time::interval(Duration::from_secs(loop_interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let ping_enabled = self.config.ping_interval > 0;
        let mut ping = tokio::time::interval(Duration::from_secs(
            self.config.ping_interval.max(1) * 60,
        ));

        let relay_enabled = self.relay.is_some();
        let mut relay_flush = tokio::time::interval(Duration::from_secs_f64(
            self.config.syndic_event_forward_timeout.max(0.1),
        ));

        let mut sigterm = shutdown_signal();

        loop {
            tokio::select! {
                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    let now = Utc::now().timestamp();
                    self.scheduler.eval(now);
                    self.process_beacons();
                    // the scheduler may ask for a faster tick, never below 1s
                    if let Some(hint) = self.scheduler.loop_interval_hint() {
                        let hint = hint.clamp(1, loop_interval);
                        if hint < loop_interval {
                            tick = tokio::time::interval(Duration::from_secs(hint));
                            tick.set_missed_tick_behavior(
                                tokio::time::MissedTickBehavior::Delay,
                            );
                        }
                    }
                }
                _ = ping.tick(), if ping_enabled => {
                    self.send_event(Some("minion_ping"), json!("ping"), None, None);
                }
                _ = relay_flush.tick(), if relay_enabled => {
                    self.flush_relay();
                }
                _ = &mut sigterm => {
                    info!("Caught shutdown signal, exiting cleanly");
                    break;
                }
            }
            if self.restart {
                return RunOutcome::Restart;
            }
        }
        RunOutcome::Shutdown
    }

    fn process_beacons(&mut self) {
        let ctx = self.invoke_ctx();
        let emitted = self.beacons.process(&ctx);
        if !emitted.is_empty() {
            self.send_event(None, Value::Null, Some(emitted), None);
        }
    }

    /// Drain the relay buckets: one event batch plus one
    /// `_syndic_return` per job, routed to the originating upstream
    /// where it is known.
    pub(crate) fn flush_relay(&mut self) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        let (events, buckets) = relay.drain();
        if events.is_empty() && buckets.is_empty() {
            return;
        }
        debug!("Forwarding {} events, {} job buckets", events.len(), buckets.len());

        if !events.is_empty() {
            let pretag = Some(format!("syndic/{}", self.config.id));
            self.send_event(None, Value::Null, Some(events), pretag);
        }

        for bucket in buckets {
            let load = outrider_protocol::envelope::ReturnLoad::syndic_return(
                &self.config.id,
                None,
                bucket.body.clone(),
            );
            let outbound = bucket
                .master_id
                .as_deref()
                .and_then(|master| {
                    self.bindings
                        .iter()
                        .find(|binding| binding.master.as_deref() == Some(master))
                        .and_then(|binding| binding.outbound.clone())
                })
                .or_else(|| self.primary_outbound());
            match outbound {
                Some(outbound) => {
                    let _ = outbound.send(OutboundLoad::fire_and_forget(
                        load.to_value(),
                        RELAY_EVENT_TIMEOUT,
                    ));
                }
                None => warn!("No upstream for relayed job bucket; dropping"),
            }
        }
    }

    fn shutdown(&mut self) {
        for binding in &mut self.bindings {
            binding.teardown();
        }
        if let Some(task) = self.router_task.take() {
            task.abort();
        }
    }
}

/// Route aggregated returns (scheduler, relay) to the primary
/// binding's request channel.
fn spawn_router(
    mut rx: mpsc::UnboundedReceiver<OutboundLoad>,
    primary: Arc<RwLock<Option<OutboundSender>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(load) = rx.recv().await {
            let target = primary.read().unwrap_or_else(|e| e.into_inner()).clone();
            match target {
                Some(outbound) => {
                    let _ = outbound.send(load);
                }
                None => warn!("No connected controller; dropping outbound load"),
            }
        }
    })
}

/// Build the schedule entry for the controller liveness probe.
pub(crate) fn alive_job(master: &str, interval: u64, connected: bool) -> Value {
    json!({
        "function": "status.master",
        "seconds": interval,
        "jid_include": true,
        "maxrunning": 1,
        "return_job": false,
        "kwargs": { "master": master, "connected": connected },
    })
}

#[cfg(unix)]
fn shutdown_signal() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("signal handler installation");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayMode;

    fn agent(mutate: impl FnOnce(&mut AgentConfig)) -> (Agent, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::load(None).unwrap();
        config.id = "relay-01".to_string();
        config.cachedir = Some(dir.path().join("cache"));
        config.configdir = Some(dir.path().join("etc"));
        mutate(&mut config);
        config.validate().unwrap();
        (Agent::new(config).unwrap(), dir)
    }

    #[tokio::test]
    async fn manage_schedule_events_drive_the_scheduler() {
        let (mut agent, _dir) = agent(|_| {});
        agent
            .handle_event(LocalEvent::new(
                "manage_schedule",
                json!({
                    "func": "add",
                    "schedule": {"ping": {"function": "test.ping", "seconds": 5}},
                    "persist": false,
                }),
            ))
            .await;
        assert!(agent.scheduler.entries().contains_key("ping"));

        agent
            .handle_event(LocalEvent::new(
                "manage_schedule",
                json!({"func": "disable_job", "name": "ping", "persist": false}),
            ))
            .await;
        assert_eq!(
            agent.scheduler.entries()["ping"]["enabled"],
            Value::Bool(false)
        );

        agent
            .handle_event(LocalEvent::new(
                "manage_schedule",
                json!({"func": "delete", "name": "ping", "persist": false}),
            ))
            .await;
        assert!(!agent.scheduler.entries().contains_key("ping"));
    }

    #[tokio::test]
    async fn manage_beacons_events_drive_the_sensors() {
        let (mut agent, _dir) = agent(|_| {});
        agent
            .handle_event(LocalEvent::new(
                "manage_beacons",
                json!({"func": "add", "name": "loadavg", "beacon_data": {"1m": 0.5}}),
            ))
            .await;
        assert!(agent.beacons.list().contains_key("loadavg"));

        agent
            .handle_event(LocalEvent::new(
                "manage_beacons",
                json!({"func": "disable_beacon", "name": "loadavg"}),
            ))
            .await;
        assert_eq!(agent.beacons.list()["loadavg"]["enabled"], json!(false));
    }

    #[tokio::test]
    async fn creds_cache_is_multiplexer_owned() {
        let (mut agent, _dir) = agent(|_| {});
        agent
            .handle_event(LocalEvent::new(
                "salt/auth/creds",
                json!({
                    "key": ["relay-01", "tcp://10.0.0.1:4506"],
                    "creds": {"aes": "opaque"},
                }),
            ))
            .await;
        let snapshot = agent.creds_snapshot();
        assert_eq!(
            snapshot["relay-01|tcp://10.0.0.1:4506"],
            json!({"aes": "opaque"})
        );
    }

    #[tokio::test]
    async fn relay_consumes_lower_tier_returns() {
        let (mut agent, _dir) = agent(|config| {
            config.syndic_mode = Some("sync".to_string());
        });
        assert_eq!(agent.relay.as_ref().unwrap().mode(), RelayMode::Sync);

        agent
            .handle_event(LocalEvent::new(
                "outrider/job/20250101000001000000/ret/web-01",
                json!({
                    "jid": "20250101000001000000",
                    "id": "web-01",
                    "fun": "test.ping",
                    "return": true,
                    "retcode": 0,
                }),
            ))
            .await;

        let (_, buckets) = agent.relay.as_mut().unwrap().drain();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].body["web-01"], json!(true));
    }

    #[tokio::test]
    async fn module_refresh_swaps_registry() {
        let (mut agent, _dir) = agent(|_| {});
        agent.registry.swap(Registry::new());
        assert!(!agent.registry.snapshot().contains("test.ping"));
        agent
            .handle_event(LocalEvent::new("module_refresh", json!({})))
            .await;
        assert!(agent.registry.snapshot().contains("test.ping"));
    }

    #[test]
    fn invalid_syndic_mode_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::load(None).unwrap();
        config.cachedir = Some(dir.path().join("cache"));
        config.configdir = Some(dir.path().join("etc"));
        config.syndic_mode = Some("bogus".to_string());
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::ConfigFatal(_))
        ));
    }
}
