//! The scheduler: evaluates schedule entries at a tick cadence and
//! spawns the same worker path inbound jobs take.
//!
//! Entries live as a raw JSON map (what the configuration carried and
//! what gets persisted); each tick parses a typed view, computes the
//! trigger arithmetic, gates on range/splay/maxrunning and spawns a
//! blocking-pool worker. The scheduler is constructed over the
//! registry and the outbound channels; it never reaches back into the
//! agent.

pub mod entry;

use chrono::Utc;
use entry::{RangeSpec, ScheduleEntry, SplaySpec, DEFAULT_ONCE_FMT};
use outrider_protocol::envelope::{split_sinks, JobResult, ReturnLoad};
use outrider_protocol::{defaults, jid, ledger};
use outrider_registry::{
    args as regargs, opts_snapshot, EventSender, ExecError, FuncOutput, InvokeCtx, LocalEvent,
    OutboundLoad, OutboundSender, SharedOpts, SharedRegistry,
};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Tag prefix for schedule management completion events.
const EVENT_PREFIX: &str = "/outrider/agent/schedule_";

/// `when`-trigger bookkeeping, keyed by entry name.
#[derive(Debug, Clone, Copy)]
struct WhenState {
    when: i64,
    when_run: bool,
}

/// Why an entry did not run this tick.
#[derive(Debug, PartialEq)]
pub enum Decision {
    Run,
    Skip,
}

pub struct Scheduler {
    opts: SharedOpts,
    registry: SharedRegistry,
    events: EventSender,
    returns: OutboundSender,
    /// Raw schedule map; also holds the global `enabled` flag the way
    /// the configuration does.
    entries: Map<String, Value>,
    /// Last-run timestamps.
    intervals: HashMap<String, i64>,
    when_state: HashMap<String, WhenState>,
    /// Effective interval after a splay was applied.
    splay_seconds: HashMap<String, i64>,
    proc_dir: PathBuf,
    configdir: PathBuf,
    /// Smallest seconds-until-next seen during the last eval; the
    /// outer loop may shorten its tick to this (floor 1s).
    min_due: i64,
}

impl Scheduler {
    pub fn new(
        opts: SharedOpts,
        registry: SharedRegistry,
        events: EventSender,
        returns: OutboundSender,
    ) -> anyhow::Result<Self> {
        let snapshot = opts_snapshot(&opts);
        let entries = match snapshot.get("schedule") {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => anyhow::bail!("schedule must be a mapping, not {other}"),
            None => Map::new(),
        };
        let cachedir = PathBuf::from(
            snapshot
                .get("cachedir")
                .and_then(Value::as_str)
                .unwrap_or("."),
        );
        let configdir = PathBuf::from(
            snapshot
                .get("configdir")
                .and_then(Value::as_str)
                .unwrap_or("."),
        );
        let proc_dir = ledger::ensure_proc_dir(&cachedir, ledger::ProcDirOptions::default())?;
        ledger::clean_proc_dir(&proc_dir);

        Ok(Self {
            opts,
            registry,
            events,
            returns,
            entries,
            intervals: HashMap::new(),
            when_state: HashMap::new(),
            splay_seconds: HashMap::new(),
            proc_dir,
            configdir,
            min_due: i64::MAX,
        })
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    pub fn proc_dir(&self) -> &PathBuf {
        &self.proc_dir
    }

    /// Smallest next-due interval computed by the last eval, for the
    /// outer loop's tick feedback. Never below one second.
    pub fn loop_interval_hint(&self) -> Option<u64> {
        (self.min_due != i64::MAX).then(|| self.min_due.max(1) as u64)
    }

    fn globally_enabled(&self) -> bool {
        self.entries
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Evaluate and execute the schedule for one tick.
    pub fn eval(&mut self, now: i64) {
        self.min_due = i64::MAX;
        if !self.globally_enabled() {
            return;
        }
        let names: Vec<String> = self
            .entries
            .keys()
            .filter(|name| name.as_str() != "enabled")
            .cloned()
            .collect();
        for name in names {
            let Some(raw) = self.entries.get(&name).cloned() else {
                continue;
            };
            if raw.is_null() {
                continue;
            }
            if !raw.is_object() {
                error!("Scheduled job {:?} should have a map value", name);
                continue;
            }
            if self.decide(&name, &raw, now) == Decision::Run {
                info!("Running scheduled job: {}", name);
                self.spawn(&name, &raw, now);
                self.intervals.insert(name, now);
            }
        }
    }

    /// Trigger arithmetic for one entry. Pure over the scheduler's
    /// bookkeeping; spawning happens in the caller.
    fn decide(&mut self, name: &str, raw: &Value, now: i64) -> Decision {
        let Some(entry) = ScheduleEntry::parse(name, raw) else {
            error!("Scheduled job {:?} could not be parsed", name);
            return Decision::Skip;
        };

        let Some(function) = entry.function.as_deref() else {
            info!("Invalid function: none in scheduled job {}", name);
            return Decision::Skip;
        };
        if !self.registry.snapshot().contains(function) {
            info!("Invalid function: {} in scheduled job {}", function, name);
            return Decision::Skip;
        }
        if !entry.enabled {
            return Decision::Skip;
        }

        if let Some(until) = entry.until.as_deref() {
            match entry::parse_datetime(until, now) {
                Some(until) if now >= until => {
                    debug!("Until time has passed, skipping job: {}", name);
                    return Decision::Skip;
                }
                Some(_) => {}
                None => {
                    error!("Invalid until date string in job {}, skipping", name);
                    return Decision::Skip;
                }
            }
        }
        if let Some(after) = entry.after.as_deref() {
            match entry::parse_datetime(after, now) {
                Some(after) if now < after => {
                    debug!("After time has not passed, skipping job: {}", name);
                    return Decision::Skip;
                }
                Some(_) => {}
                None => {
                    error!("Invalid after date string in job {}, skipping", name);
                    return Decision::Skip;
                }
            }
        }

        if let Err(err) = ScheduleEntry::validate_trigger(raw) {
            error!("Scheduled job {}: {}. Ignoring.", name, err);
            return Decision::Skip;
        }

        // seconds until (or since) the trigger point, per trigger kind
        let seconds;
        let is_when = entry.when.is_some();
        let is_cron = entry.cron.is_some();

        if entry.has_interval() {
            seconds = self
                .splay_seconds
                .get(name)
                .copied()
                .unwrap_or_else(|| entry.interval_seconds());
        } else if let Some(once) = entry.once.as_deref() {
            let fmt = entry.once_fmt.as_deref().unwrap_or(DEFAULT_ONCE_FMT);
            let Some(once_epoch) = entry::parse_with_format(once, fmt) else {
                error!("Date string could not be parsed: {}, {}", once, fmt);
                return Decision::Skip;
            };
            if now != once_epoch {
                return Decision::Skip;
            }
            seconds = 1;
        } else if is_when {
            match self.eval_when(name, &entry, now) {
                Some(value) => seconds = value,
                None => return Decision::Skip,
            }
        } else if let Some(cron_expr) = entry.cron.as_deref() {
            let Some(next) = entry::cron_next(cron_expr, now) else {
                error!("Invalid cron string in job {}. Ignoring.", name);
                return Decision::Skip;
            };
            seconds = next;
        } else {
            return Decision::Skip;
        }

        // Feedback for the outer loop. Not tracked for `when` entries.
        if !is_when && seconds < self.min_due {
            self.min_due = seconds;
        }

        let mut run = if is_when {
            let state = self.when_state.get_mut(name);
            match state {
                Some(state) if seconds == 0 && state.when_run => {
                    state.when_run = false;
                    true
                }
                _ => false,
            }
        } else if is_cron {
            seconds == 1
        } else if let Some(last_run) = self.intervals.get(name) {
            now - last_run >= seconds
        } else if entry.run_on_start {
            true
        } else {
            self.intervals.insert(name.to_string(), now);
            false
        };

        if run {
            if let Some(range_raw) = &entry.range {
                let Some(range) = RangeSpec::parse(range_raw) else {
                    error!("Invalid range in job {}, must be a map. Ignoring job.", name);
                    return Decision::Skip;
                };
                match range.permits(now) {
                    Ok(permitted) => run = permitted,
                    Err(err) => {
                        error!("schedule: {} in job {}. Ignoring job.", err, name);
                        return Decision::Skip;
                    }
                }
            }
        }

        if !run {
            return Decision::Skip;
        }

        if let Some(splay_raw) = &entry.splay {
            if is_when || is_cron {
                error!(
                    "Unable to use \"splay\" with \"when\" or \"cron\" options. Ignoring."
                );
            } else {
                match SplaySpec::parse(splay_raw) {
                    Ok(window) => {
                        let splay = rand::thread_rng().gen_range(window.start..=window.end);
                        debug!("schedule: adding splay of {} seconds to next run", splay);
                        self.splay_seconds
                            .insert(name.to_string(), entry.interval_seconds() + splay);
                    }
                    Err(err) => error!("schedule: {}. Ignoring splay.", err),
                }
            }
        }

        Decision::Run
    }

    /// Resolve the `when` trigger: one date-time or the soonest future
    /// entry of a list, optionally through the `whens` tables in the
    /// configuration- or attribute-tree. Returns seconds-until-fire.
    fn eval_when(&mut self, name: &str, entry: &ScheduleEntry, now: i64) -> Option<i64> {
        let opts = opts_snapshot(&self.opts);
        let lookup = |raw: &str| -> Option<i64> {
            let resolved = ["pillar", "grains"].iter().find_map(|tree| {
                opts.get(tree)
                    .and_then(|t| t.get("whens"))
                    .and_then(|whens| whens.get(raw))
                    .and_then(Value::as_str)
            });
            entry::parse_datetime(resolved.unwrap_or(raw), now)
        };

        let when = match entry.when.as_ref()? {
            Value::String(raw) => {
                let Some(when) = lookup(raw) else {
                    error!("Invalid date string in job {}. Ignoring.", name);
                    return None;
                };
                when
            }
            Value::Array(items) => {
                let mut future: Vec<i64> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(lookup)
                    .filter(|when| *when >= now)
                    .collect();
                future.sort_unstable();
                *future.first()?
            }
            _ => {
                error!("Invalid when value in job {}. Ignoring.", name);
                return None;
            }
        };

        let seconds = when - now;
        if seconds < 0 {
            return None;
        }

        match self.when_state.get_mut(name) {
            None => {
                self.when_state
                    .insert(name.to_string(), WhenState { when, when_run: true });
            }
            Some(state) if when > state.when => {
                // progressed to the next listed time
                state.when = when;
                state.when_run = true;
            }
            Some(_) => {}
        }

        Some(seconds)
    }

    /// Spawn a worker for an entry, enforcing the concurrency cap.
    fn spawn(&self, name: &str, raw: &Value, _now: i64) {
        let Some(entry) = ScheduleEntry::parse(name, raw) else {
            return;
        };
        if entry.jid_include {
            let cap = entry.maxrunning.unwrap_or(1) as usize;
            let running = ledger::count_running(&self.proc_dir, name);
            if running >= cap {
                info!(
                    "schedule: job {} was not started, {} already running (maxrunning {})",
                    name, running, cap
                );
                return;
            }
        }

        let deps = self.worker_deps();
        tokio::task::spawn_blocking(move || handle_func(entry, deps));
    }

    fn worker_deps(&self) -> WorkerDeps {
        let opts = opts_snapshot(&self.opts);
        let registry = self.registry.snapshot();
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
            registry,
            opts: opts.clone(),
        };
        let retry_timer = opts
            .get("return_retry_timer")
            .and_then(Value::as_u64)
            .unwrap_or(defaults::RETURN_RETRY_TIMER_SECS);
        let retry_timer_max = opts
            .get("return_retry_timer_max")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        WorkerDeps {
            ctx,
            proc_dir: self.proc_dir.clone(),
            returns: self.returns.clone(),
            return_retry_timer: retry_timer,
            return_retry_timer_max: retry_timer_max,
            schedule_returner: opts.get("schedule_returner").cloned(),
        }
    }

    // ------------------------------------------------------------------
    // Management operations (the `manage_schedule` event surface)
    // ------------------------------------------------------------------

    /// Add a new entry. The data is a single-key map, the same shape
    /// the configuration file carries.
    pub fn add_job(&mut self, data: Value, persist: bool) -> anyhow::Result<()> {
        let Value::Object(map) = data else {
            anyhow::bail!("scheduled jobs have to be of map type");
        };
        if map.len() != 1 {
            anyhow::bail!("you can only schedule one new job at a time");
        }
        let (name, value) = map.into_iter().next().expect("len checked");
        if self.entries.contains_key(&name) {
            info!("Updating job settings for scheduled job: {}", name);
        } else {
            info!("Added new job {} to scheduler", name);
        }
        self.entries.insert(name, value);
        self.fire_complete("add_complete");
        if persist {
            self.persist();
        }
        Ok(())
    }

    /// Replace an entry wholesale.
    pub fn modify_job(&mut self, name: &str, schedule: Value, persist: bool) {
        self.entries.insert(name.to_string(), schedule);
        self.intervals.remove(name);
        self.when_state.remove(name);
        self.splay_seconds.remove(name);
        self.fire_complete("modify_complete");
        if persist {
            self.persist();
        }
    }

    pub fn delete_job(&mut self, name: &str, persist: bool) {
        self.entries.remove(name);
        self.intervals.remove(name);
        self.when_state.remove(name);
        self.splay_seconds.remove(name);
        self.fire_complete("delete_complete");
        if persist {
            self.persist();
        }
    }

    pub fn enable_job(&mut self, name: &str, persist: bool) {
        self.set_enabled_flag(name, true);
        info!("Enabling job {} in scheduler", name);
        self.fire_complete("enabled_job_complete");
        if persist {
            self.persist();
        }
    }

    pub fn disable_job(&mut self, name: &str, persist: bool) {
        self.set_enabled_flag(name, false);
        info!("Disabling job {} in scheduler", name);
        self.fire_complete("disabled_job_complete");
        if persist {
            self.persist();
        }
    }

    fn set_enabled_flag(&mut self, name: &str, enabled: bool) {
        if let Some(Value::Object(entry)) = self.entries.get_mut(name) {
            entry.insert("enabled".to_string(), Value::Bool(enabled));
        }
    }

    /// Enable the scheduler as a whole.
    pub fn enable(&mut self) {
        self.entries.insert("enabled".to_string(), Value::Bool(true));
        self.fire_complete("enabled_complete");
    }

    /// Disable the scheduler as a whole.
    pub fn disable(&mut self) {
        self.entries.insert("enabled".to_string(), Value::Bool(false));
        self.fire_complete("disabled_complete");
    }

    /// Run one entry immediately, bypassing its trigger.
    pub fn run_job(&mut self, name: &str) {
        let Some(raw) = self.entries.get(name).cloned() else {
            info!("Cannot run job {}: not in schedule", name);
            return;
        };
        let function = ScheduleEntry::parse(name, &raw).and_then(|entry| entry.function);
        match function {
            Some(function) if self.registry.snapshot().contains(&function) => {
                info!("Running job: {}", name);
                self.spawn(name, &raw, 0);
            }
            other => {
                info!("Invalid function: {:?} in scheduled job {}", other, name);
            }
        }
    }

    /// Replace the whole schedule (the `reload` management op).
    pub fn reload(&mut self, schedule: Value) {
        self.intervals.clear();
        self.when_state.clear();
        self.splay_seconds.clear();
        let map = schedule
            .get("schedule")
            .cloned()
            .unwrap_or(schedule);
        if let Value::Object(map) = map {
            for (name, value) in map {
                self.entries.insert(name, value);
            }
        }
        self.fire_complete("reload_complete");
    }

    /// Post the current schedule on the local bus.
    pub fn list(&self) {
        self.fire_complete("list_complete");
    }

    pub fn save(&self) {
        self.persist();
        let _ = self.events.send(LocalEvent::new(
            format!("{EVENT_PREFIX}saved"),
            json!({"complete": true}),
        ));
    }

    /// Persist the schedule into `<configdir>/minion.d/_schedule.conf`.
    pub fn persist(&self) {
        let path = outrider_protocol::paths::schedule_fragment(&self.configdir);
        debug!("Persisting schedule to {}", path.display());
        let doc = json!({ "schedule": Value::Object(self.entries.clone()) });
        let write = || -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_yaml::to_string(&doc)?)?;
            Ok(())
        };
        if let Err(err) = write() {
            error!("Failed to persist the updated schedule: {}", err);
        }
    }

    fn fire_complete(&self, suffix: &str) {
        let _ = self.events.send(LocalEvent::new(
            format!("{EVENT_PREFIX}{suffix}"),
            json!({
                "complete": true,
                "schedule": Value::Object(self.entries.clone()),
            }),
        ));
    }
}

/// Everything the worker needs, captured at spawn.
pub struct WorkerDeps {
    pub ctx: InvokeCtx,
    pub proc_dir: PathBuf,
    pub returns: OutboundSender,
    pub return_retry_timer: u64,
    pub return_retry_timer_max: u64,
    pub schedule_returner: Option<Value>,
}

impl WorkerDeps {
    /// Randomized return timeout within the configured retry window.
    fn return_timeout(&self) -> u64 {
        if self.return_retry_timer_max > self.return_retry_timer {
            rand::thread_rng().gen_range(self.return_retry_timer..=self.return_retry_timer_max)
        } else {
            self.return_retry_timer
        }
    }
}

/// Execute one scheduled entry: write the job record, invoke the
/// function, run the sinks, send the `_return` envelope, delete the
/// record. Runs on the blocking pool.
pub fn handle_func(entry: ScheduleEntry, deps: WorkerDeps) {
    let jid = jid::gen();
    let now = Utc::now();

    let mut result = JobResult::new(jid.clone(), json!(entry.function));
    result.schedule = Some(entry.name.clone());
    result.fun_args = entry.args.clone();
    if !entry.kwargs.is_empty() {
        result.fun_args.push(Value::Object(entry.kwargs.clone()));
    }
    if let Some(Value::Object(mut metadata)) = entry.metadata.clone() {
        metadata.insert("_TS".to_string(), json!(now.format("%Y-%m-%d %H:%M:%S").to_string()));
        metadata.insert("_TT".to_string(), json!(now.format("%Y %B %d %a %H %m").to_string()));
        result.metadata = Some(Value::Object(metadata));
    } else if entry.metadata.is_some() {
        warn!("schedule: the metadata parameter must be a map. Ignoring.");
    }

    // The ledger write doubles as the concurrency token, so re-check
    // the cap from the worker before adding ourselves.
    if entry.jid_include {
        let cap = entry.maxrunning.unwrap_or(1) as usize;
        let running = ledger::count_running(&deps.proc_dir, &entry.name);
        if running >= cap {
            info!(
                "schedule: job {} was not started, {} already running (maxrunning {})",
                entry.name, running, cap
            );
            return;
        }
        let record = ledger::JobRecord {
            jid: jid.clone(),
            pid: std::process::id(),
            fun: json!(entry.function),
            schedule: Some(entry.name.clone()),
            start: now.timestamp() as f64,
            envelope: json!({
                "fun": entry.function,
                "arg": entry.args,
                "kwargs": entry.kwargs,
            }),
        };
        if let Err(err) = ledger::write(&deps.proc_dir, &record) {
            error!("Failed to write job record for {}: {}", jid, err);
        }
    }

    let function_name = entry.function.clone().unwrap_or_default();
    let invoke = || -> Result<Value, ExecError> {
        let function = deps
            .ctx
            .registry
            .lookup(&function_name)
            .ok_or_else(|| ExecError::Missing(function_name.clone()))?;

        let mut kwargs = entry.kwargs.clone();
        if function.spec.accepts_kwargs {
            let pub_data = match serde_json::to_value(&result) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            for (key, value) in pub_data {
                kwargs.insert(format!("{}{key}", regargs::PUB_PREFIX), value);
            }
        }

        match function.invoke(&deps.ctx, &entry.args, &kwargs)? {
            FuncOutput::Value(value) => Ok(value),
            FuncOutput::Stream(stream) => Ok(Value::Array(stream.collect())),
        }
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(invoke));
    match outcome {
        Ok(Ok(value)) => {
            result.retval = value;
            result.success = json!(true);
            result.retcode = 0;
        }
        Ok(Err(err)) => {
            error!("Unhandled error running {}: {}", function_name, err);
            let (retval, out, _) = err.as_return(&function_name);
            result.retval = retval;
            result.out = out;
            result.success = json!(false);
            result.retcode = 254;
        }
        Err(_) => {
            error!("Unhandled panic running {}", function_name);
            result.retval = json!(format!("Unhandled exception running {function_name}"));
            result.success = json!(false);
            result.retcode = 254;
        }
    }

    // Return sinks: the entry's own plus the global schedule_returner,
    // deduplicated with order retained. Failures never block the rest.
    let mut sinks: Vec<String> = Vec::new();
    let mut add_sink = |name: &str| {
        if !name.is_empty() && !sinks.iter().any(|s| s == name) {
            sinks.push(name.to_string());
        }
    };
    for source in [entry.returner.as_ref(), deps.schedule_returner.as_ref()] {
        match source {
            Some(Value::String(spec)) => split_sinks(spec).iter().for_each(|s| add_sink(s)),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .for_each(&mut add_sink),
            _ => {}
        }
    }
    if !sinks.is_empty() {
        let mut ret_value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(_) => Value::Null,
        };
        if let Some(obj) = ret_value.as_object_mut() {
            obj.insert("id".to_string(), json!(deps.ctx.id));
        }
        for sink in &sinks {
            let sink_fun = format!("{sink}.returner");
            match deps.ctx.registry.lookup_returner(&sink_fun) {
                Some(function) => {
                    if let Err(err) = function.invoke(&deps.ctx, &[ret_value.clone()], &Map::new())
                    {
                        error!("The return failed for job {} {}", jid, err);
                    }
                }
                None => {
                    info!("Job {} using invalid returner: {}. Ignoring.", function_name, sink);
                }
            }
        }
    }

    if entry.return_job {
        // The controller files scheduled returns under a fresh jid of
        // its own; the marker value requests that.
        let mut to_master = result.clone();
        to_master.jid = "req".to_string();
        let load = ReturnLoad::job_return(&deps.ctx.id, None, &to_master);
        if deps
            .returns
            .send(OutboundLoad::fire_and_forget(
                load.to_value(),
                deps.return_timeout(),
            ))
            .is_err()
        {
            warn!("Return channel closed; dropping scheduled return for {}", jid);
        }
    }

    if entry.jid_include {
        ledger::delete(&deps.proc_dir, &jid);
    }
}
