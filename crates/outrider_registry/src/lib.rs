//! The typed function registry: lookup by name returning an invocable
//! with an introspectable argument spec, and whole-map swap on refresh.
//!
//! Three namespaces share the registry: execution functions
//! (`module.function`), return sinks (`<name>.returner` and friends),
//! and sensor collectors (`<name>.beacon`). Workers capture an `Arc`
//! snapshot; a refresh swaps the map underneath without touching
//! in-flight jobs.

pub mod args;
pub mod builtins;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// A local control event on the agent's internal bus: a prefix-tagged
/// string plus payload.
#[derive(Debug, Clone)]
pub struct LocalEvent {
    pub tag: String,
    pub data: Value,
}

impl LocalEvent {
    pub fn new(tag: impl Into<String>, data: Value) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<LocalEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LocalEvent>;

/// A load bound for the controller over the request channel. The
/// connection task applies the timeout; on expiry the send is logged
/// and dropped.
#[derive(Debug)]
pub struct OutboundLoad {
    pub load: Value,
    pub timeout_secs: u64,
    /// When set, the controller's reply payload is delivered here
    /// (used by the configuration-tree fetch). Fire-and-forget sends
    /// leave it empty.
    pub reply: Option<tokio::sync::oneshot::Sender<Value>>,
}

impl OutboundLoad {
    pub fn fire_and_forget(load: Value, timeout_secs: u64) -> Self {
        Self {
            load,
            timeout_secs,
            reply: None,
        }
    }
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundLoad>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundLoad>;

/// The full agent configuration map, shared across components the way
/// the trees are: whole-value reads, in-place key updates under the
/// lock.
pub type SharedOpts = Arc<RwLock<Value>>;

/// Read a snapshot of the shared configuration.
pub fn opts_snapshot(opts: &SharedOpts) -> Value {
    opts.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Everything a function invocation may reach: identity, tree
/// snapshots, the raw configuration map, the cache directory, the
/// local event bus, and the registry generation the worker captured
/// (so functions like `mine.update` can call their siblings).
#[derive(Debug, Clone)]
pub struct InvokeCtx {
    pub id: String,
    pub grains: Value,
    pub pillar: Value,
    /// The full agent configuration as a map.
    pub opts: Value,
    pub cachedir: PathBuf,
    pub events: EventSender,
    pub registry: Arc<Registry>,
}

impl InvokeCtx {
    pub fn opt(&self, key: &str) -> Option<&Value> {
        self.opts.get(key)
    }

    pub fn fire_event(&self, tag: impl Into<String>, data: Value) {
        let _ = self.events.send(LocalEvent::new(tag, data));
    }
}

/// Execution failures, per the platform error taxonomy.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A binary the function requires is absent.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The function ran and reported failure.
    #[error("{0}")]
    CommandExecution(String),

    /// Argument shape mismatch detected before the call.
    #[error("{0}")]
    InvalidInvocation(String),

    /// Raw arity mismatch at call time.
    #[error("passed invalid arguments: {message}")]
    WrongArity { message: String, doc: String },

    /// The function name is not in the registry.
    #[error("'{0}' is not available")]
    Missing(String),

    /// Catch-all for anything a function body raised.
    #[error("the function caused an exception: {0}")]
    Internal(String),
}

impl ExecError {
    /// Render into the (return-string, out-hint, retcode) triple a
    /// failed JobResult carries.
    pub fn as_return(&self, fun: &str) -> (Value, Option<String>, i32) {
        let nested = Some("nested".to_string());
        match self {
            ExecError::CommandNotFound(msg) => (
                Value::String(format!("Command required for '{fun}' not found: {msg}")),
                nested,
                0,
            ),
            ExecError::CommandExecution(msg) => {
                (Value::String(format!("ERROR: {msg}")), nested, 0)
            }
            ExecError::InvalidInvocation(msg) => (
                Value::String(format!("ERROR executing '{fun}': {msg}")),
                nested,
                0,
            ),
            ExecError::WrongArity { message, doc } => (
                Value::String(format!("Passed invalid arguments to {fun}: {message}\n{doc}")),
                nested,
                0,
            ),
            ExecError::Missing(name) => (
                Value::String(format!("'{name}' is not available.")),
                nested,
                254,
            ),
            ExecError::Internal(msg) => (
                Value::String(format!("The agent function caused an exception: {msg}")),
                nested,
                254,
            ),
        }
    }
}

/// What a function invocation produces: a plain value, or a lazy
/// sequence the worker iterates, emitting progress events per element.
pub enum FuncOutput {
    Value(Value),
    Stream(Box<dyn Iterator<Item = Value> + Send>),
}

impl From<Value> for FuncOutput {
    fn from(value: Value) -> Self {
        FuncOutput::Value(value)
    }
}

impl fmt::Debug for FuncOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuncOutput::Value(value) => f.debug_tuple("Value").field(value).finish(),
            FuncOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub type FuncResult = Result<FuncOutput, ExecError>;
pub type Handler =
    Arc<dyn Fn(&InvokeCtx, &[Value], &Map<String, Value>) -> FuncResult + Send + Sync>;

/// Introspectable argument specification.
#[derive(Debug, Clone, Default)]
pub struct FuncSpec {
    /// Declared positional parameter names, in order.
    pub params: &'static [&'static str],
    /// Whether the function accepts arbitrary keyword arguments
    /// (and therefore the `__pub_*` publication passthrough).
    pub accepts_kwargs: bool,
    /// One-line docstring, included in arity-error messages.
    pub doc: &'static str,
    /// Output-format hint echoed into results.
    pub out: Option<&'static str>,
}

/// A registered invocable.
#[derive(Clone)]
pub struct Function {
    pub spec: FuncSpec,
    handler: Handler,
}

impl Function {
    pub fn new(spec: FuncSpec, handler: Handler) -> Self {
        Self { spec, handler }
    }

    pub fn invoke(&self, ctx: &InvokeCtx, args: &[Value], kwargs: &Map<String, Value>) -> FuncResult {
        (self.handler)(ctx, args, kwargs)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("spec", &self.spec).finish()
    }
}

/// One generation of the registry. Immutable once built; refresh
/// builds a new generation and swaps it in whole.
#[derive(Debug, Default)]
pub struct Registry {
    functions: HashMap<String, Function>,
    returners: HashMap<String, Function>,
    sensors: HashMap<String, Function>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard generation: builtin modules, sinks and sensors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::install(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, spec: FuncSpec, handler: Handler) {
        self.functions.insert(name.to_string(), Function::new(spec, handler));
    }

    pub fn register_returner(&mut self, name: &str, spec: FuncSpec, handler: Handler) {
        self.returners.insert(name.to_string(), Function::new(spec, handler));
    }

    pub fn register_sensor(&mut self, name: &str, spec: FuncSpec, handler: Handler) {
        self.sensors.insert(name.to_string(), Function::new(spec, handler));
    }

    pub fn lookup(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn lookup_returner(&self, name: &str) -> Option<&Function> {
        self.returners.get(name)
    }

    pub fn lookup_sensor(&self, name: &str) -> Option<&Function> {
        self.sensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Shared handle over the current registry generation. Readers take
/// cheap `Arc` snapshots; `swap` replaces the whole map at once.
#[derive(Clone, Debug)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<Registry>>>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    /// The current generation. In-flight workers keep whatever
    /// snapshot they captured at spawn.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the registry wholesale (the `sys.reload_modules`
    /// contract).
    pub fn swap(&self, registry: Registry) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ctx(registry: Arc<Registry>) -> (InvokeCtx, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            InvokeCtx {
                id: "web-01".to_string(),
                grains: json!({"os": "Linux"}),
                pillar: json!({}),
                opts: json!({"master_port": 4506}),
                cachedir: std::env::temp_dir(),
                events: tx,
                registry,
            },
            rx,
        )
    }

    #[test]
    fn lookup_and_invoke() {
        let registry = Arc::new(Registry::with_builtins());
        let (ctx, _rx) = test_ctx(registry.clone());

        let ping = registry.lookup("test.ping").expect("test.ping registered");
        match ping.invoke(&ctx, &[], &Map::new()).unwrap() {
            FuncOutput::Value(value) => assert_eq!(value, json!(true)),
            other => panic!("unexpected output: {other:?}"),
        }

        assert!(registry.lookup("no.such_function").is_none());
        assert!(registry.lookup_returner("local_cache.returner").is_some());
    }

    #[test]
    fn swap_replaces_whole_map() {
        let shared = SharedRegistry::new(Registry::with_builtins());
        let before = shared.snapshot();
        assert!(before.contains("test.ping"));

        shared.swap(Registry::new());
        assert!(!shared.snapshot().contains("test.ping"));
        // the captured snapshot is unaffected
        assert!(before.contains("test.ping"));

        shared.swap(Registry::with_builtins());
        assert!(shared.snapshot().contains("test.ping"));
    }

    #[test]
    fn exec_error_rendering() {
        let (retval, out, retcode) = ExecError::Missing("no.fun".to_string()).as_return("no.fun");
        assert!(retval.as_str().unwrap().contains("not available"));
        assert_eq!(out.as_deref(), Some("nested"));
        assert_eq!(retcode, 254);

        let (_, out, retcode) =
            ExecError::CommandExecution("disk full".to_string()).as_return("disk.usage");
        assert_eq!(out.as_deref(), Some("nested"));
        assert_eq!(retcode, 0);
    }
}
