//! Job dispatcher: turns verified command envelopes into worker
//! executions and routes results back to the controller and the
//! configured return sinks.

use crate::SharedMatcherCtx;
use outrider_matcher::Matcher;
use outrider_protocol::envelope::{
    CommandEnvelope, FunTarget, JobResult, PubPayload, ReturnLoad,
};
use outrider_protocol::{defaults, ledger};
use outrider_registry::{
    args as regargs, opts_snapshot, EventSender, ExecError, FuncOutput, InvokeCtx, OutboundLoad,
    OutboundSender, Registry, SharedOpts, SharedRegistry,
};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The reserved function name that swaps the registry instead of
/// executing.
const RELOAD_MODULES: &str = "sys.reload_modules";

/// Local-bus tag carrying publications re-forwarded to the lower
/// tier when this agent acts as a relay.
pub const SYNDIC_PUB_TAG: &str = "outrider/syndic/pub";

#[derive(Clone)]
pub struct Dispatcher {
    opts: SharedOpts,
    registry: SharedRegistry,
    matcher_ctx: SharedMatcherCtx,
    events: EventSender,
    proc_dir: PathBuf,
    /// Relay mode: forward publications downward instead of
    /// executing them.
    relay_forward: bool,
}

/// Everything a job worker needs, captured at spawn time.
struct JobDeps {
    ctx: InvokeCtx,
    proc_dir: PathBuf,
    outbound: OutboundSender,
    return_retry_timer: u64,
    return_retry_timer_max: u64,
}

impl JobDeps {
    fn return_timeout(&self) -> u64 {
        if self.return_retry_timer_max > self.return_retry_timer {
            rand::thread_rng().gen_range(self.return_retry_timer..=self.return_retry_timer_max)
        } else {
            self.return_retry_timer.max(1)
        }
    }
}

impl Dispatcher {
    pub fn new(
        opts: SharedOpts,
        registry: SharedRegistry,
        matcher_ctx: SharedMatcherCtx,
        events: EventSender,
        proc_dir: PathBuf,
    ) -> Self {
        Self {
            opts,
            registry,
            matcher_ctx,
            events,
            proc_dir,
            relay_forward: false,
        }
    }

    /// Switch the dispatcher into relay mode: verified publications
    /// are re-forwarded to the lower tier instead of executed here.
    pub fn with_relay_forward(mut self) -> Self {
        self.relay_forward = true;
        self
    }

    /// Entry point for one publish payload. Unverified payloads do
    /// nothing at all; verified ones are targeted and, on a match,
    /// executed in a worker.
    pub fn handle_payload(&self, payload: &Value, outbound: &OutboundSender) {
        let Ok(payload) = serde_json::from_value::<PubPayload>(payload.clone()) else {
            debug!("Dropping malformed publish payload");
            return;
        };
        if !payload.is_verified() {
            // Not verified: nothing runs, nothing is written.
            return;
        }
        let Some(envelope) = CommandEnvelope::decode(&payload.load) else {
            debug!("Publish load missing required fields, dropping");
            return;
        };
        if self.relay_forward {
            self.forward_publication(envelope);
            return;
        }
        if !self.target_match(&envelope) {
            return;
        }
        self.dispatch(envelope, outbound);
    }

    /// Relay path: pass the publication down one tier with the
    /// delivery timeout decremented, unless it originated from our own
    /// upstream (loop prevention).
    fn forward_publication(&self, mut envelope: CommandEnvelope) {
        let opts = opts_snapshot(&self.opts);
        let own_master_id = opts.get("master_id").and_then(Value::as_str);
        if envelope.master_id.is_some() && envelope.master_id.as_deref() == own_master_id {
            debug!("Publication originated here, not forwarding");
            return;
        }
        if envelope.tgt_type.is_none() {
            envelope.tgt_type = Some("glob".to_string());
        }
        let timeout = envelope
            .to
            .unwrap_or(defaults::CHANNEL_SEND_TIMEOUT_SECS as i64);
        envelope.to = Some(timeout - 1);
        let load = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        let _ = self
            .events
            .send(outrider_registry::LocalEvent::new(SYNDIC_PUB_TAG, load));
    }

    /// Decide whether the envelope applies to this agent.
    pub fn target_match(&self, envelope: &CommandEnvelope) -> bool {
        let ctx = self
            .matcher_ctx
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let matcher = Matcher::new(ctx);
        matcher.targeted(
            &envelope.tgt,
            envelope.tgt_type.as_deref(),
            envelope.delimiter.as_deref(),
        )
    }

    /// Spawn the worker for an accepted envelope.
    pub fn dispatch(&self, envelope: CommandEnvelope, outbound: &OutboundSender) {
        match &envelope.user {
            Some(user) => info!(
                "User {} Executing command {:?} with jid {}",
                user, envelope.fun, envelope.jid
            ),
            None => info!("Executing command {:?} with jid {}", envelope.fun, envelope.jid),
        }
        debug!("Command details {:?}", envelope);

        let is_reload =
            matches!(&envelope.fun, FunTarget::Single(fun) if fun == RELOAD_MODULES);
        if is_reload {
            // Reserved name: swap the registry, acknowledge, and do
            // not execute anything.
            info!("Refreshing function registry");
            self.registry.swap(Registry::with_builtins());
            let deps = self.job_deps(outbound.clone());
            tokio::task::spawn_blocking(move || {
                let mut result = JobResult::new(envelope.jid.clone(), json!(RELOAD_MODULES));
                result.retval = json!(true);
                result.success = json!(true);
                finish_job(&envelope, result, &deps);
            });
            return;
        }

        let deps = self.job_deps(outbound.clone());
        match envelope.fun.clone() {
            FunTarget::Single(_) => {
                tokio::task::spawn_blocking(move || worker_single(envelope, deps));
            }
            FunTarget::Multi(_) => {
                tokio::task::spawn_blocking(move || worker_multi(envelope, deps));
            }
        }
    }

    fn job_deps(&self, outbound: OutboundSender) -> JobDeps {
        let opts = opts_snapshot(&self.opts);
        let ctx = InvokeCtx {
            id: opts
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            grains: opts.get("grains").cloned().unwrap_or(json!({})),
            pillar: opts.get("pillar").cloned().unwrap_or(json!({})),
            cachedir: PathBuf::from(opts.get("cachedir").and_then(Value::as_str).unwrap_or(".")),
            events: self.events.clone(),
            registry: self.registry.snapshot(),
            opts: opts.clone(),
        };
        JobDeps {
            ctx,
            proc_dir: self.proc_dir.clone(),
            outbound,
            return_retry_timer: opts
                .get("return_retry_timer")
                .and_then(Value::as_u64)
                .unwrap_or(defaults::RETURN_RETRY_TIMER_SECS),
            return_retry_timer_max: opts
                .get("return_retry_timer_max")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        }
    }
}

fn write_record(envelope: &CommandEnvelope, deps: &JobDeps) {
    let record = ledger::JobRecord {
        jid: envelope.jid.clone(),
        pid: std::process::id(),
        fun: serde_json::to_value(&envelope.fun).unwrap_or(Value::Null),
        schedule: None,
        start: chrono::Utc::now().timestamp() as f64,
        envelope: serde_json::to_value(envelope).unwrap_or(Value::Null),
    };
    info!("Starting a new job with PID {}", record.pid);
    if let Err(err) = ledger::write(&deps.proc_dir, &record) {
        error!("Failed to write job record for {}: {}", envelope.jid, err);
    }
}

/// Invoke one registry function with the envelope's arguments, with
/// lazy sequences iterated into progress events.
fn call_function(
    fun: &str,
    args: &[Value],
    envelope: &CommandEnvelope,
    deps: &JobDeps,
) -> Result<(Value, Option<&'static str>), ExecError> {
    let registry = &deps.ctx.registry;
    let function = registry
        .lookup(fun)
        .ok_or_else(|| ExecError::Missing(fun.to_string()))?;

    let pub_data = envelope.as_map();
    let (positional, kwargs) =
        regargs::load_args_and_kwargs(&function.spec, args, Some(&pub_data))?;
    regargs::check_arity(&function.spec, fun, &positional)?;

    let invoke = || function.invoke(&deps.ctx, &positional, &kwargs);
    let output = std::panic::catch_unwind(std::panic::AssertUnwindSafe(invoke))
        .map_err(|_| ExecError::Internal(format!("panic while running {fun}")))??;

    let value = match output {
        FuncOutput::Value(value) => value,
        FuncOutput::Stream(stream) => {
            // Iterate the lazy sequence, reporting each element as an
            // intermediate job event, and fold it into one final
            // return: maps merge, everything else appends.
            let mut acc: Option<Value> = None;
            for (index, element) in stream.enumerate() {
                let tag = format!(
                    "job/{}/prog/{}/{}",
                    envelope.jid, deps.ctx.id, index
                );
                deps.ctx.fire_event(
                    "fire_master",
                    json!({ "data": { "return": element.clone() }, "tag": tag }),
                );
                acc = Some(match (acc, element) {
                    (None, Value::Object(first)) => Value::Object(first),
                    (Some(Value::Object(mut into)), Value::Object(from)) => {
                        into.extend(from);
                        Value::Object(into)
                    }
                    (None, other) => Value::Array(vec![other]),
                    (Some(Value::Array(mut list)), other) => {
                        list.push(other);
                        Value::Array(list)
                    }
                    (Some(prev), other) => Value::Array(vec![prev, other]),
                });
            }
            acc.unwrap_or(Value::Array(Vec::new()))
        }
    };
    Ok((value, function.spec.out))
}

/// Single-function worker: one JobRecord, one invocation, one result.
fn worker_single(envelope: CommandEnvelope, deps: JobDeps) {
    let FunTarget::Single(fun) = envelope.fun.clone() else {
        return;
    };
    write_record(&envelope, &deps);

    let mut result = JobResult::new(envelope.jid.clone(), json!(fun));
    result.fun_args = envelope.arg.clone();

    match call_function(&fun, &envelope.arg, &envelope, &deps) {
        Ok((value, out)) => {
            result.retval = value;
            result.success = json!(true);
            result.retcode = 0;
            result.out = out.map(str::to_string);
        }
        Err(err) => {
            warn!("Job {} ({}) failed: {}", envelope.jid, fun, err);
            let (retval, out, retcode) = err.as_return(&fun);
            result.retval = retval;
            result.out = out;
            result.retcode = retcode;
            result.success = json!(false);
        }
    }

    finish_job(&envelope, result, &deps);
}

/// Multi-function worker: iterates (fun[i], arg[i]) pairs into one
/// accumulated result.
fn worker_multi(envelope: CommandEnvelope, deps: JobDeps) {
    let FunTarget::Multi(funs) = envelope.fun.clone() else {
        return;
    };
    write_record(&envelope, &deps);

    let mut returns = Map::new();
    let mut successes = Map::new();
    for (index, fun) in funs.iter().enumerate() {
        let args: Vec<Value> = match envelope.arg.get(index) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        match call_function(fun, &args, &envelope, &deps) {
            Ok((value, _)) => {
                returns.insert(fun.clone(), value);
                successes.insert(fun.clone(), json!(true));
            }
            Err(err) => {
                warn!("Job {} ({}) failed: {}", envelope.jid, fun, err);
                let (retval, _, _) = err.as_return(fun);
                returns.insert(fun.clone(), retval);
                successes.insert(fun.clone(), json!(false));
            }
        }
    }

    let mut result = JobResult::new(envelope.jid.clone(), json!(funs));
    result.fun_args = envelope.arg.clone();
    result.retval = Value::Object(returns);
    result.success = Value::Object(successes);

    finish_job(&envelope, result, &deps);
}

/// Common tail: metadata echo, controller return, sinks, record
/// cleanup.
fn finish_job(envelope: &CommandEnvelope, mut result: JobResult, deps: &JobDeps) {
    match &envelope.metadata {
        Some(Value::Object(_)) => result.metadata = envelope.metadata.clone(),
        Some(_) => warn!("The metadata parameter must be a map. Ignoring."),
        None => {}
    }
    result.master_id = envelope.master_id.clone();

    info!("Returning information for job: {}", envelope.jid);
    let load = ReturnLoad::job_return(&deps.ctx.id, None, &result);
    if deps
        .outbound
        .send(OutboundLoad::fire_and_forget(
            load.to_value(),
            deps.return_timeout(),
        ))
        .is_err()
    {
        warn!("Return channel closed; dropping return for {}", envelope.jid);
    }

    let sinks = envelope.sink_names();
    if !sinks.is_empty() {
        result.ret_config = envelope.ret_config.clone();
        let mut ret_value = serde_json::to_value(&result).unwrap_or(Value::Null);
        if let Some(obj) = ret_value.as_object_mut() {
            obj.insert("id".to_string(), json!(deps.ctx.id));
        }
        for sink in &sinks {
            let sink_fun = format!("{sink}.returner");
            match deps.ctx.registry.lookup_returner(&sink_fun) {
                Some(function) => {
                    if let Err(err) =
                        function.invoke(&deps.ctx, &[ret_value.clone()], &Map::new())
                    {
                        error!("The return failed for job {} {}", envelope.jid, err);
                    }
                }
                None => warn!("Return sink {} is not available. Ignoring.", sink),
            }
        }
    }

    ledger::delete(&deps.proc_dir, &envelope.jid);
}

/// Test and embedding helper: a dispatcher over fresh shared state.
pub fn standalone(
    opts_value: Value,
    events: EventSender,
) -> anyhow::Result<(Dispatcher, SharedOpts, SharedRegistry)> {
    use outrider_matcher::MatcherContext;
    use std::sync::RwLock;

    let cachedir = PathBuf::from(
        opts_value
            .get("cachedir")
            .and_then(Value::as_str)
            .unwrap_or("."),
    );
    let proc_dir = ledger::ensure_proc_dir(&cachedir, ledger::ProcDirOptions::default())?;
    let opts: SharedOpts = Arc::new(RwLock::new(opts_value.clone()));
    let registry = SharedRegistry::new(Registry::with_builtins());
    let ctx = MatcherContext {
        id: opts_value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        grains: opts_value.get("grains").cloned().unwrap_or(json!({})),
        pillar: opts_value.get("pillar").cloned().unwrap_or(json!({})),
        range_server: None,
    };
    let matcher_ctx: SharedMatcherCtx = Arc::new(RwLock::new(Arc::new(ctx)));
    let dispatcher = Dispatcher::new(
        opts.clone(),
        registry.clone(),
        matcher_ctx,
        events,
        proc_dir,
    );
    Ok((dispatcher, opts, registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrider_registry::OutboundReceiver;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Rig {
        dispatcher: Dispatcher,
        outbound: OutboundSender,
        outbound_rx: OutboundReceiver,
        events_rx: outrider_registry::EventReceiver,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let opts = json!({
            "id": "web-01",
            "cachedir": dir.path().to_str().unwrap(),
            "grains": {"os": "Linux", "ipv4": ["10.0.4.7"], "ipv6": []},
            "pillar": {},
            "return_retry_timer": 1,
        });
        let (dispatcher, _, _) = standalone(opts, events_tx).unwrap();
        Rig {
            dispatcher,
            outbound,
            outbound_rx,
            events_rx,
            _dir: dir,
        }
    }

    fn publish(tgt: &str, tgt_type: &str, fun: Value, arg: Value, jid: &str) -> Value {
        json!({
            "enc": "aes",
            "load": {
                "tgt": tgt,
                "tgt_type": tgt_type,
                "fun": fun,
                "arg": arg,
                "jid": jid,
            }
        })
    }

    async fn next_return(rx: &mut OutboundReceiver) -> Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("return expected")
            .expect("channel open")
            .load
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn glob_match_runs_and_returns() {
        let mut rig = rig();
        let payload = publish(
            "web-*",
            "glob",
            json!("test.ping"),
            json!([]),
            "20250101000001000000",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let load = next_return(&mut rig.outbound_rx).await;
        assert_eq!(load["cmd"], "_return");
        assert_eq!(load["id"], "web-01");
        assert_eq!(load["jid"], "20250101000001000000");
        assert_eq!(load["fun"], "test.ping");
        assert_eq!(load["return"], json!(true));
        assert_eq!(load["success"], json!(true));
        assert_eq!(load["retcode"], json!(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unverified_payload_is_inert() {
        let mut rig = rig();
        let mut payload = publish(
            "web-*",
            "glob",
            json!("test.ping"),
            json!([]),
            "20250101000001000001",
        );
        payload["enc"] = json!("clear");
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rig.outbound_rx.try_recv().is_err());
        // no job record was ever written
        assert!(ledger::scan(&rig.dispatcher.proc_dir).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compound_reject_spawns_nothing() {
        let mut rig = rig();
        let payload = publish(
            "G@os:Windows and web-*",
            "compound",
            json!("test.ping"),
            json!([]),
            "20250101000001000002",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rig.outbound_rx.try_recv().is_err());
        assert!(ledger::scan(&rig.dispatcher.proc_dir).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_required_field_drops_silently() {
        let mut rig = rig();
        let mut payload = publish(
            "web-*",
            "glob",
            json!("test.ping"),
            json!([]),
            "20250101000001000003",
        );
        payload["load"].as_object_mut().unwrap().remove("arg");
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rig.outbound_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn multi_job_accumulates_per_function() {
        let mut rig = rig();
        let payload = publish(
            "web-*",
            "glob",
            json!(["test.ping", "test.echo"]),
            json!([[], ["x"]]),
            "20250101000001000004",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let load = next_return(&mut rig.outbound_rx).await;
        assert_eq!(load["return"]["test.ping"], json!(true));
        assert_eq!(load["return"]["test.echo"], json!("x"));
        assert_eq!(load["success"]["test.ping"], json!(true));
        assert_eq!(load["success"]["test.echo"], json!(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_function_returns_254() {
        let mut rig = rig();
        let payload = publish(
            "web-*",
            "glob",
            json!("no.such_function"),
            json!([]),
            "20250101000001000005",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let load = next_return(&mut rig.outbound_rx).await;
        assert_eq!(load["success"], json!(false));
        assert_eq!(load["retcode"], json!(254));
        assert_eq!(load["out"], json!("nested"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lazy_sequence_emits_progress_and_folds() {
        let mut rig = rig();
        let payload = publish(
            "web-*",
            "glob",
            json!("test.range"),
            json!([3]),
            "20250101000001000006",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let load = next_return(&mut rig.outbound_rx).await;
        assert_eq!(load["return"], json!([0, 1, 2]));

        let mut progress_tags = Vec::new();
        while let Ok(event) = rig.events_rx.try_recv() {
            if event.tag == "fire_master" {
                progress_tags.push(event.data["tag"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(
            progress_tags,
            vec![
                "job/20250101000001000006/prog/web-01/0",
                "job/20250101000001000006/prog/web-01/1",
                "job/20250101000001000006/prog/web-01/2",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sinks_are_best_effort() {
        let mut rig = rig();
        let mut payload = publish(
            "web-*",
            "glob",
            json!("test.ping"),
            json!([]),
            "20250101000001000007",
        );
        payload["load"]
            .as_object_mut()
            .unwrap()
            .insert("ret".to_string(), json!("no_such_sink,local_cache"));
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let _ = next_return(&mut rig.outbound_rx).await;
        // the bad sink was skipped, the good one wrote the cache file
        let cached = rig
            ._dir
            .path()
            .join("jobs/20250101000001000007/return-web-01.json");
        assert!(cached.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reload_modules_swaps_the_registry() {
        let rig = rig();
        // poison the current generation, then ask for a reload
        rig.dispatcher.registry.swap(Registry::new());
        assert!(!rig.dispatcher.registry.snapshot().contains("test.ping"));

        let payload = publish(
            "web-*",
            "glob",
            json!("sys.reload_modules"),
            json!([]),
            "20250101000001000008",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);
        assert!(rig.dispatcher.registry.snapshot().contains("test.ping"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn relay_mode_forwards_instead_of_executing() {
        let mut rig = rig();
        rig.dispatcher = rig.dispatcher.clone().with_relay_forward();

        let mut payload = publish(
            "db-*", // would not match this agent; relays don't target
            "glob",
            json!("test.ping"),
            json!([]),
            "20250101000001000010",
        );
        payload["load"]
            .as_object_mut()
            .unwrap()
            .insert("to".to_string(), json!(30));
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let forwarded = rig.events_rx.try_recv().unwrap();
        assert_eq!(forwarded.tag, SYNDIC_PUB_TAG);
        assert_eq!(forwarded.data["to"], json!(29));
        assert_eq!(forwarded.data["tgt_type"], json!("glob"));
        // nothing executed locally
        assert!(rig.outbound_rx.try_recv().is_err());

        // a publication stamped with our own upstream id is dropped
        rig.dispatcher
            .opts
            .write()
            .unwrap()
            .as_object_mut()
            .unwrap()
            .insert("master_id".to_string(), json!("upstream-1"));
        payload["load"]
            .as_object_mut()
            .unwrap()
            .insert("master_id".to_string(), json!("upstream-1"));
        rig.dispatcher.handle_payload(&payload, &rig.outbound);
        assert!(rig.events_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kwarg_strings_reach_the_function() {
        let mut rig = rig();
        let payload = publish(
            "web-*",
            "glob",
            json!("test.echo"),
            json!(["text=hello"]),
            "20250101000001000009",
        );
        rig.dispatcher.handle_payload(&payload, &rig.outbound);

        let load = next_return(&mut rig.outbound_rx).await;
        assert_eq!(load["return"], json!("hello"));
        assert_eq!(load["success"], json!(true));
    }
}
