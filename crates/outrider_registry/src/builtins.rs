//! Builtin execution modules, return sinks and sensors.

use crate::{ExecError, FuncOutput, FuncSpec, InvokeCtx, Registry};
use serde_json::{json, Map, Value};
use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect timeout for the controller reachability probe.
const MASTER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

macro_rules! handler {
    ($body:expr) => {
        Arc::new($body as fn(&InvokeCtx, &[Value], &Map<String, Value>) -> crate::FuncResult)
            as crate::Handler
    };
}

pub fn install(registry: &mut Registry) {
    install_test(registry);
    install_event(registry);
    install_status(registry);
    install_mine(registry);
    install_grains(registry);
    install_local_cache(registry);
    install_sensors(registry);
}

/// Fetch an argument by position or keyword name.
fn arg<'a>(
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
    idx: usize,
    name: &str,
) -> Option<&'a Value> {
    args.get(idx).or_else(|| kwargs.get(name))
}

fn install_test(registry: &mut Registry) {
    registry.register(
        "test.ping",
        FuncSpec {
            params: &[],
            accepts_kwargs: false,
            doc: "Return true; proves the agent is responding.",
            out: None,
        },
        handler!(|_ctx, _args, _kwargs| Ok(FuncOutput::Value(json!(true)))),
    );

    registry.register(
        "test.echo",
        FuncSpec {
            params: &["text"],
            accepts_kwargs: false,
            doc: "Return the first argument unchanged.",
            out: None,
        },
        handler!(|_ctx, args: &[Value], kwargs: &Map<String, Value>| {
            let value = arg(args, kwargs, 0, "text").cloned().unwrap_or(Value::Null);
            Ok(FuncOutput::Value(value))
        }),
    );

    registry.register(
        "test.sleep",
        FuncSpec {
            params: &["length"],
            accepts_kwargs: false,
            doc: "Sleep for the given number of seconds, then return true.",
            out: None,
        },
        handler!(|_ctx, args: &[Value], kwargs: &Map<String, Value>| {
            let length = arg(args, kwargs, 0, "length")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    ExecError::InvalidInvocation("test.sleep requires a numeric length".into())
                })?;
            std::thread::sleep(Duration::from_secs_f64(length.max(0.0)));
            Ok(FuncOutput::Value(json!(true)))
        }),
    );

    registry.register(
        "test.version",
        FuncSpec {
            params: &[],
            accepts_kwargs: false,
            doc: "Return the agent version string.",
            out: None,
        },
        handler!(|_ctx, _args, _kwargs| {
            Ok(FuncOutput::Value(json!(env!("CARGO_PKG_VERSION"))))
        }),
    );

    registry.register(
        "test.range",
        FuncSpec {
            params: &["count"],
            accepts_kwargs: false,
            doc: "Yield the integers 0..count as a lazy sequence.",
            out: None,
        },
        handler!(|_ctx, args: &[Value], kwargs: &Map<String, Value>| {
            let count = arg(args, kwargs, 0, "count")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    ExecError::InvalidInvocation("test.range requires a non-negative count".into())
                })?;
            Ok(FuncOutput::Stream(Box::new((0..count).map(|n| json!(n)))))
        }),
    );
}

fn install_event(registry: &mut Registry) {
    registry.register(
        "event.fire",
        FuncSpec {
            params: &["data", "tag"],
            accepts_kwargs: false,
            doc: "Post an event on the agent's local bus.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, args: &[Value], kwargs: &Map<String, Value>| {
            let data = arg(args, kwargs, 0, "data").cloned().unwrap_or(json!({}));
            let tag = arg(args, kwargs, 1, "tag")
                .and_then(Value::as_str)
                .ok_or_else(|| ExecError::InvalidInvocation("event.fire requires a tag".into()))?;
            ctx.fire_event(tag, data);
            Ok(FuncOutput::Value(json!(true)))
        }),
    );
}

fn install_status(registry: &mut Registry) {
    registry.register(
        "status.master",
        FuncSpec {
            params: &["master", "connected"],
            accepts_kwargs: true,
            doc: "Probe controller reachability and post up/down events on a change.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, args: &[Value], kwargs: &Map<String, Value>| {
            let master = arg(args, kwargs, 0, "master")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    ctx.opt("master")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .ok_or_else(|| {
                    ExecError::InvalidInvocation("status.master requires a master address".into())
                })?;
            let expect_connected = arg(args, kwargs, 1, "connected")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let port = ctx
                .opt("master_port")
                .and_then(Value::as_u64)
                .unwrap_or(outrider_protocol::defaults::MASTER_PORT as u64)
                as u16;

            let reachable = probe_master(&master, port);
            debug!("status.master: {}:{} reachable={}", master, port, reachable);

            if reachable && !expect_connected {
                ctx.fire_event("__master_connected", json!({ "master": master }));
            } else if !reachable && expect_connected {
                ctx.fire_event("__master_disconnected", json!({ "master": master }));
            }
            Ok(FuncOutput::Value(json!(reachable)))
        }),
    );
}

fn probe_master(host: &str, port: u16) -> bool {
    let candidates = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(err) => {
            warn!("status.master: cannot resolve {}: {}", host, err);
            return false;
        }
    };
    for addr in candidates {
        if TcpStream::connect_timeout(&addr, MASTER_PROBE_TIMEOUT).is_ok() {
            return true;
        }
    }
    false
}

fn install_mine(registry: &mut Registry) {
    registry.register(
        "mine.update",
        FuncSpec {
            params: &[],
            accepts_kwargs: true,
            doc: "Run the configured mine functions and push the snapshot upward.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, _args: &[Value], _kwargs: &Map<String, Value>| {
            let functions = match ctx.opt("mine_functions") {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(ExecError::InvalidInvocation(
                        "mine_functions must be a mapping of function -> args".into(),
                    ))
                }
                None => Map::new(),
            };

            let mut data = Map::new();
            for (fun, fun_args) in &functions {
                let Some(function) = ctx.registry.lookup(fun) else {
                    warn!("mine.update: function {} not in registry, skipping", fun);
                    continue;
                };
                let call_args: Vec<Value> = match fun_args {
                    Value::Array(items) => items.clone(),
                    Value::Null => Vec::new(),
                    other => vec![other.clone()],
                };
                match function.invoke(ctx, &call_args, &Map::new()) {
                    Ok(FuncOutput::Value(value)) => {
                        data.insert(fun.clone(), value);
                    }
                    Ok(FuncOutput::Stream(stream)) => {
                        data.insert(fun.clone(), Value::Array(stream.collect()));
                    }
                    Err(err) => {
                        warn!("mine.update: function {} failed: {}", fun, err);
                    }
                }
            }

            ctx.fire_event(
                "_minion_mine",
                json!({ "cmd": "_mine", "id": ctx.id, "data": data }),
            );
            Ok(FuncOutput::Value(json!(true)))
        }),
    );
}

fn install_grains(registry: &mut Registry) {
    registry.register(
        "grains.items",
        FuncSpec {
            params: &[],
            accepts_kwargs: false,
            doc: "Return the agent's attribute tree.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, _args, _kwargs| Ok(FuncOutput::Value(ctx.grains.clone()))),
    );
}

/// The default `master_job_cache`: job loads and returns under
/// `<cachedir>/jobs/<jid>/`.
fn install_local_cache(registry: &mut Registry) {
    fn jobs_dir(ctx: &InvokeCtx, jid: &str) -> PathBuf {
        ctx.cachedir.join("jobs").join(jid)
    }

    registry.register_returner(
        "local_cache.returner",
        FuncSpec {
            params: &["ret"],
            accepts_kwargs: false,
            doc: "Store a job result in the local job cache.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, args: &[Value], _kwargs| {
            let ret = args.first().cloned().unwrap_or(Value::Null);
            let jid = ret
                .get("jid")
                .and_then(Value::as_str)
                .ok_or_else(|| ExecError::InvalidInvocation("result has no jid".into()))?;
            let agent = ret.get("id").and_then(Value::as_str).unwrap_or(&ctx.id);
            let dir = jobs_dir(ctx, jid);
            fs::create_dir_all(&dir)
                .map_err(|err| ExecError::CommandExecution(err.to_string()))?;
            let path = dir.join(format!("return-{agent}.json"));
            let data = serde_json::to_vec(&ret)
                .map_err(|err| ExecError::Internal(err.to_string()))?;
            fs::write(&path, data).map_err(|err| ExecError::CommandExecution(err.to_string()))?;
            info!("Cached return for job {} at {}", jid, path.display());
            Ok(FuncOutput::Value(json!(true)))
        }),
    );

    registry.register_returner(
        "local_cache.save_load",
        FuncSpec {
            params: &["jid", "load"],
            accepts_kwargs: false,
            doc: "Store the original publication for a job id.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, args: &[Value], kwargs: &Map<String, Value>| {
            let jid = arg(args, kwargs, 0, "jid")
                .and_then(Value::as_str)
                .ok_or_else(|| ExecError::InvalidInvocation("save_load requires a jid".into()))?;
            let load = arg(args, kwargs, 1, "load").cloned().unwrap_or(json!({}));
            let dir = jobs_dir(ctx, jid);
            fs::create_dir_all(&dir)
                .map_err(|err| ExecError::CommandExecution(err.to_string()))?;
            let data = serde_json::to_vec(&load)
                .map_err(|err| ExecError::Internal(err.to_string()))?;
            fs::write(dir.join("load.json"), data)
                .map_err(|err| ExecError::CommandExecution(err.to_string()))?;
            Ok(FuncOutput::Value(json!(true)))
        }),
    );

    registry.register_returner(
        "local_cache.get_load",
        FuncSpec {
            params: &["jid"],
            accepts_kwargs: false,
            doc: "Fetch the original publication for a job id.",
            out: None,
        },
        handler!(|ctx: &InvokeCtx, args: &[Value], kwargs: &Map<String, Value>| {
            let jid = arg(args, kwargs, 0, "jid")
                .and_then(Value::as_str)
                .ok_or_else(|| ExecError::InvalidInvocation("get_load requires a jid".into()))?;
            let path = jobs_dir(ctx, jid).join("load.json");
            let load = fs::read(&path)
                .ok()
                .and_then(|data| serde_json::from_slice(&data).ok())
                .unwrap_or(json!({}));
            Ok(FuncOutput::Value(load))
        }),
    );
}

fn install_sensors(registry: &mut Registry) {
    registry.register_sensor(
        "loadavg.beacon",
        FuncSpec {
            params: &["config"],
            accepts_kwargs: false,
            doc: "Emit an event when the 1-minute load average crosses a threshold.",
            out: None,
        },
        handler!(|_ctx, args: &[Value], kwargs: &Map<String, Value>| {
            let config = arg(args, kwargs, 0, "config").cloned().unwrap_or(json!({}));
            let threshold = config.get("1m").and_then(Value::as_f64).unwrap_or(0.0);
            let mut events = Vec::new();
            if let Some(one_minute) = read_loadavg() {
                if one_minute >= threshold {
                    events.push(json!({
                        "tag": "loadavg",
                        "data": { "1m": one_minute },
                    }));
                }
            }
            Ok(FuncOutput::Value(Value::Array(events)))
        }),
    );
}

#[cfg(target_os = "linux")]
fn read_loadavg() -> Option<f64> {
    let raw = fs::read_to_string("/proc/loadavg").ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn read_loadavg() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventReceiver, SharedRegistry};
    use tokio::sync::mpsc;

    fn ctx_with(cachedir: PathBuf, opts: Value) -> (InvokeCtx, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SharedRegistry::new(Registry::with_builtins());
        (
            InvokeCtx {
                id: "web-01".to_string(),
                grains: json!({"os": "Linux"}),
                pillar: json!({}),
                opts,
                cachedir,
                events: tx,
                registry: registry.snapshot(),
            },
            rx,
        )
    }

    #[test]
    fn echo_returns_first_argument() {
        let (ctx, _rx) = ctx_with(std::env::temp_dir(), json!({}));
        let function = ctx.registry.lookup("test.echo").unwrap();
        match function.invoke(&ctx, &[json!("x")], &Map::new()).unwrap() {
            FuncOutput::Value(value) => assert_eq!(value, json!("x")),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn range_is_lazy() {
        let (ctx, _rx) = ctx_with(std::env::temp_dir(), json!({}));
        let function = ctx.registry.lookup("test.range").unwrap();
        match function.invoke(&ctx, &[json!(3)], &Map::new()).unwrap() {
            FuncOutput::Stream(stream) => {
                assert_eq!(stream.collect::<Vec<_>>(), vec![json!(0), json!(1), json!(2)])
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn event_fire_reaches_the_bus() {
        let (ctx, mut rx) = ctx_with(std::env::temp_dir(), json!({}));
        let function = ctx.registry.lookup("event.fire").unwrap();
        function
            .invoke(&ctx, &[json!({"k": 1}), json!("custom/tag")], &Map::new())
            .unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.tag, "custom/tag");
        assert_eq!(event.data, json!({"k": 1}));
    }

    #[test]
    fn local_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = ctx_with(dir.path().to_path_buf(), json!({}));

        let save = ctx.registry.lookup_returner("local_cache.save_load").unwrap();
        save.invoke(
            &ctx,
            &[json!("20250101000001000000"), json!({"fun": "test.ping"})],
            &Map::new(),
        )
        .unwrap();

        let get = ctx.registry.lookup_returner("local_cache.get_load").unwrap();
        match get
            .invoke(&ctx, &[json!("20250101000001000000")], &Map::new())
            .unwrap()
        {
            FuncOutput::Value(load) => assert_eq!(load, json!({"fun": "test.ping"})),
            other => panic!("unexpected output: {other:?}"),
        }

        let ret = ctx.registry.lookup_returner("local_cache.returner").unwrap();
        ret.invoke(
            &ctx,
            &[json!({"jid": "20250101000001000000", "id": "web-01", "return": true})],
            &Map::new(),
        )
        .unwrap();
        assert!(dir
            .path()
            .join("jobs/20250101000001000000/return-web-01.json")
            .exists());
    }

    #[test]
    fn mine_update_collects_and_fires() {
        let (ctx, mut rx) = ctx_with(
            std::env::temp_dir(),
            json!({"mine_functions": {"test.ping": []}}),
        );
        let function = ctx.registry.lookup("mine.update").unwrap();
        function.invoke(&ctx, &[], &Map::new()).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.tag, "_minion_mine");
        assert_eq!(event.data["data"]["test.ping"], json!(true));
        assert_eq!(event.data["cmd"], json!("_mine"));
    }
}
