//! Argument resolution: detect the args and kwargs to pass to a call
//! and check them against the function's declared spec.
//!
//! A `key=value` string becomes a keyword argument only when the
//! function declares `key` positionally or accepts variadic keywords;
//! otherwise it is invalid. A map flagged with the `__kwarg__` marker
//! is merged as keyword arguments under the same rule. When the
//! function accepts variadic keywords, every publication field is
//! packed in under a `__pub_` prefix.

use crate::{ExecError, FuncSpec};
use serde_json::{Map, Value};

/// Marker key flagging a map argument as packed keyword arguments.
pub const KWARG_MARKER: &str = "__kwarg__";

/// Prefix for publication fields passed through to variadic-keyword
/// functions.
pub const PUB_PREFIX: &str = "__pub_";

/// Resolve positional and keyword arguments for `spec`.
pub fn load_args_and_kwargs(
    spec: &FuncSpec,
    args: &[Value],
    pub_data: Option<&Map<String, Value>>,
) -> Result<(Vec<Value>, Map<String, Value>), ExecError> {
    let mut positional: Vec<Value> = Vec::new();
    let mut kwargs: Map<String, Value> = Map::new();
    let mut invalid: Vec<String> = Vec::new();

    for arg in args {
        match arg {
            Value::String(raw) => match split_kwarg(raw) {
                Some((key, value)) => {
                    if spec.accepts_kwargs || spec.params.contains(&key) {
                        kwargs.insert(key.to_string(), yamlify(value));
                    } else {
                        invalid.push(raw.clone());
                    }
                }
                None => positional.push(arg.clone()),
            },
            Value::Object(map) if is_kwarg_map(map) => {
                for (key, value) in map {
                    if key == KWARG_MARKER {
                        continue;
                    }
                    if spec.accepts_kwargs || spec.params.contains(&key.as_str()) {
                        kwargs.insert(key.clone(), value.clone());
                    } else {
                        invalid.push(format!("{key}={value}"));
                    }
                }
            }
            _ => positional.push(arg.clone()),
        }
    }

    if !invalid.is_empty() {
        return Err(ExecError::InvalidInvocation(format!(
            "The following keyword arguments are not valid: {}",
            invalid.join(", ")
        )));
    }

    if spec.accepts_kwargs {
        if let Some(data) = pub_data {
            for (key, value) in data {
                kwargs.insert(format!("{PUB_PREFIX}{key}"), value.clone());
            }
        }
    }

    Ok((positional, kwargs))
}

/// Raw arity check before the call: more positionals than declared
/// parameters is a wrong-arity error carrying the docstring.
pub fn check_arity(spec: &FuncSpec, fun: &str, positional: &[Value]) -> Result<(), ExecError> {
    if positional.len() > spec.params.len() {
        return Err(ExecError::WrongArity {
            message: format!(
                "{} takes at most {} positional argument(s), {} given",
                fun,
                spec.params.len(),
                positional.len()
            ),
            doc: spec.doc.to_string(),
        });
    }
    Ok(())
}

/// Split `key=value` when the key side looks like an identifier.
/// `=value` and `key==value` style strings stay positional.
fn split_kwarg(raw: &str) -> Option<(&str, &str)> {
    let (key, value) = raw.split_once('=')?;
    if key.is_empty() || value.starts_with('=') {
        return None;
    }
    if !key
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return None;
    }
    Some((key, value))
}

fn is_kwarg_map(map: &Map<String, Value>) -> bool {
    map.get(KWARG_MARKER).and_then(Value::as_bool) == Some(true)
}

/// Interpret a CLI-style scalar the way the YAML loader would:
/// numbers, booleans and null come out typed, everything else stays a
/// string.
fn yamlify(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => value,
        _ => Value::String(raw.to_string()),
    }
}
