//! Target matching: decides whether an inbound command applies to this
//! agent.
//!
//! All operations are pure over a [`MatcherContext`] snapshot and return
//! plain booleans. Malformed patterns and unknown target types never
//! panic; they log and evaluate to false.

mod compound;

pub use compound::Atom;

use globset::Glob;
use ipnet::IpNet;
use regex::Regex;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default path/value delimiter for tree and config targets.
pub const DEFAULT_TARGET_DELIM: &str = ":";

/// Snapshot of the agent's identity, attribute-tree (grains) and
/// configuration-tree (pillar). Swapped atomically as a whole; the
/// matcher never sees a partially refreshed tree.
#[derive(Debug, Clone, Default)]
pub struct MatcherContext {
    pub id: String,
    pub grains: Value,
    pub pillar: Value,
    /// Address of the external range-expansion service, if any.
    pub range_server: Option<String>,
}

/// How a leaf value is compared during a tree walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafMode {
    Glob,
    Regex,
    Exact,
}

pub struct Matcher {
    ctx: Arc<MatcherContext>,
}

impl Matcher {
    pub fn new(ctx: Arc<MatcherContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &MatcherContext {
        &self.ctx
    }

    /// Dispatch on the wire target-type tag. Unknown tags match nothing.
    pub fn targeted(&self, tgt: &Value, tgt_type: Option<&str>, delimiter: Option<&str>) -> bool {
        let delim = delimiter.unwrap_or(DEFAULT_TARGET_DELIM);
        let tag = tgt_type.unwrap_or("glob");
        let pat = tgt.as_str();
        match tag {
            "glob" => pat.map(|p| self.glob(p)).unwrap_or(false),
            "pcre" => pat.map(|p| self.regex(p)).unwrap_or(false),
            "list" => self.list(tgt),
            "grain" => pat.map(|p| self.tree(p, delim)).unwrap_or(false),
            "grain_pcre" => pat.map(|p| self.tree_regex(p, delim)).unwrap_or(false),
            "pillar" => pat.map(|p| self.config(p, delim)).unwrap_or(false),
            "pillar_pcre" => pat.map(|p| self.config_regex(p, delim)).unwrap_or(false),
            "pillar_exact" => pat.map(|p| self.config_exact(p, delim)).unwrap_or(false),
            "ipcidr" => pat.map(|p| self.ipcidr(p)).unwrap_or(false),
            "range" => pat.map(|p| self.range(p)).unwrap_or(false),
            "compound" => pat.map(|p| self.compound(p)).unwrap_or(false),
            other => {
                warn!("Unknown target type {:?}, not matching", other);
                false
            }
        }
    }

    /// Case-sensitive shell-style match against the agent identity.
    pub fn glob(&self, tgt: &str) -> bool {
        glob_match(&self.ctx.id, tgt)
    }

    /// Start-anchored regex match against the agent identity.
    pub fn regex(&self, tgt: &str) -> bool {
        match Regex::new(tgt) {
            Ok(re) => re.find(&self.ctx.id).is_some_and(|m| m.start() == 0),
            Err(err) => {
                warn!("Invalid regex target {:?}: {}", tgt, err);
                false
            }
        }
    }

    /// Identity membership in a comma-split string or a list value.
    pub fn list(&self, tgt: &Value) -> bool {
        match tgt {
            Value::String(spec) => spec.split(',').any(|name| name == self.ctx.id),
            Value::Array(items) => items
                .iter()
                .any(|item| item.as_str() == Some(self.ctx.id.as_str())),
            _ => false,
        }
    }

    /// Attribute-tree walk, leaf compared by glob.
    pub fn tree(&self, tgt: &str, delim: &str) -> bool {
        subtree_match(&self.ctx.grains, tgt, delim, LeafMode::Glob)
    }

    /// Attribute-tree walk, leaf compared by regex.
    pub fn tree_regex(&self, tgt: &str, delim: &str) -> bool {
        subtree_match(&self.ctx.grains, tgt, delim, LeafMode::Regex)
    }

    /// Configuration-tree walk, leaf compared by glob.
    pub fn config(&self, tgt: &str, delim: &str) -> bool {
        subtree_match(&self.ctx.pillar, tgt, delim, LeafMode::Glob)
    }

    /// Configuration-tree walk, leaf compared by regex.
    pub fn config_regex(&self, tgt: &str, delim: &str) -> bool {
        subtree_match(&self.ctx.pillar, tgt, delim, LeafMode::Regex)
    }

    /// Configuration-tree walk, no globbing, no regex.
    pub fn config_exact(&self, tgt: &str, delim: &str) -> bool {
        subtree_match(&self.ctx.pillar, tgt, delim, LeafMode::Exact)
    }

    /// Match the target address or network against the agent's address
    /// grains (`ipv4` / `ipv6`).
    pub fn ipcidr(&self, tgt: &str) -> bool {
        if let Ok(addr) = tgt.parse::<IpAddr>() {
            let proto = if addr.is_ipv4() { "ipv4" } else { "ipv6" };
            return self
                .addr_grains(proto)
                .iter()
                .any(|own| own.parse::<IpAddr>() == Ok(addr));
        }
        if let Ok(net) = tgt.parse::<IpNet>() {
            let proto = match net {
                IpNet::V4(_) => "ipv4",
                IpNet::V6(_) => "ipv6",
            };
            return self.addr_grains(proto).iter().any(|own| {
                own.parse::<IpAddr>()
                    .map(|addr| net.contains(&addr))
                    .unwrap_or(false)
            });
        }
        warn!("Invalid IP/CIDR target: {:?}", tgt);
        false
    }

    /// Range-cluster match. Requires a configured range server; the
    /// expansion service itself is an external collaborator.
    pub fn range(&self, tgt: &str) -> bool {
        match &self.ctx.range_server {
            Some(server) => {
                debug!(
                    "Range target {:?} requires expansion via {}, which is not wired in; \
                     not matching",
                    tgt, server
                );
                false
            }
            None => {
                warn!("Range target {:?} but no range_server configured", tgt);
                false
            }
        }
    }

    /// Tokenized boolean expression over the other engines.
    pub fn compound(&self, tgt: &str) -> bool {
        match compound::evaluate(self, tgt) {
            Ok(result) => {
                debug!("compound_match {} ? {:?} => {}", self.ctx.id, tgt, result);
                result
            }
            Err(err) => {
                warn!("Invalid compound target {:?}: {}", tgt, err);
                false
            }
        }
    }

    fn addr_grains(&self, proto: &str) -> Vec<String> {
        match self.ctx.grains.get(proto) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn glob_match(candidate: &str, pattern: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(candidate),
        Err(err) => {
            warn!("Invalid glob target {:?}: {}", pattern, err);
            false
        }
    }
}

fn leaf_to_string(leaf: &Value) -> String {
    match leaf {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn leaf_match(candidate: &str, pattern: &str, mode: LeafMode) -> bool {
    match mode {
        LeafMode::Glob => glob_match(candidate, pattern),
        LeafMode::Exact => candidate == pattern,
        LeafMode::Regex => match Regex::new(pattern) {
            Ok(re) => re.find(candidate).is_some_and(|m| m.start() == 0),
            Err(err) => {
                warn!("Invalid regex in tree target {:?}: {}", pattern, err);
                false
            }
        },
    }
}

/// Walk `data` along `expr` split on `delim`, matching the trailing
/// pattern against whatever the walk lands on. Every split point is
/// tried so values containing the delimiter still match. A list node
/// matches if any member does; a map node matches the pattern against
/// its keys (with one more level of key/value descent available).
fn subtree_match(data: &Value, expr: &str, delim: &str, mode: LeafMode) -> bool {
    let parts: Vec<&str> = expr.split(delim).collect();
    if parts.len() < 2 {
        warn!("Insufficient arguments in tree match statement: {:?}", expr);
        return false;
    }
    for split in 1..parts.len() {
        let pattern = parts[split..].join(delim);
        if let Some(node) = traverse(data, &parts[..split]) {
            if node_matches(node, &pattern, delim, mode) {
                return true;
            }
        }
    }
    false
}

fn traverse<'a>(data: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut node = data;
    for part in path {
        node = match node {
            Value::Object(map) => map.get(*part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn node_matches(node: &Value, pattern: &str, delim: &str, mode: LeafMode) -> bool {
    match node {
        Value::Object(map) => {
            if let Some((key_pat, rest)) = pattern.split_once(delim) {
                map.iter().any(|(key, value)| {
                    leaf_match(key, key_pat, mode) && node_matches(value, rest, delim, mode)
                })
            } else {
                map.keys().any(|key| leaf_match(key, pattern, mode))
            }
        }
        Value::Array(items) => items
            .iter()
            .any(|item| node_matches(item, pattern, delim, mode)),
        leaf => leaf_match(&leaf_to_string(leaf), pattern, mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matcher() -> Matcher {
        Matcher::new(Arc::new(MatcherContext {
            id: "web-01".to_string(),
            grains: json!({
                "os": "Linux",
                "os_family": "Debian",
                "roles": ["frontend", "cache"],
                "ipv4": ["10.0.4.7", "127.0.0.1"],
                "ipv6": ["::1"],
                "num_cpus": 8,
                "disks": {"sda": {"size": "512G"}},
            }),
            pillar: json!({
                "role": "web",
                "service": {"port": 8080, "tier": "edge"},
            }),
            range_server: None,
        }))
    }

    #[test]
    fn glob_against_identity() {
        let m = matcher();
        assert!(m.glob("web-*"));
        assert!(m.glob("web-0?"));
        assert!(m.glob("web-01"));
        assert!(!m.glob("Web-*"));
        assert!(!m.glob("db-*"));
    }

    #[test]
    fn regex_is_start_anchored() {
        let m = matcher();
        assert!(m.regex("web-\\d+"));
        assert!(m.regex("web"));
        assert!(!m.regex("01"));
        assert!(!m.regex("(unclosed"));
    }

    #[test]
    fn list_membership() {
        let m = matcher();
        assert!(m.list(&json!("db-01,web-01,web-02")));
        assert!(m.list(&json!(["db-01", "web-01"])));
        assert!(!m.list(&json!("db-01,db-02")));
        assert!(!m.list(&json!(42)));
    }

    #[test]
    fn tree_walks_and_globs() {
        let m = matcher();
        assert!(m.tree("os:Linux", ":"));
        assert!(m.tree("os:Lin*", ":"));
        assert!(!m.tree("os:Windows", ":"));
        assert!(m.tree("roles:front*", ":"));
        assert!(m.tree("disks:sda:size:512G", ":"));
        assert!(m.tree("num_cpus:8", ":"));
        // no delimiter present
        assert!(!m.tree("os", ":"));
        // custom delimiter
        assert!(m.tree("os|Linux", "|"));
    }

    #[test]
    fn tree_regex_walks() {
        let m = matcher();
        assert!(m.tree_regex("os:Lin.x", ":"));
        assert!(!m.tree_regex("os:nux", ":"));
    }

    #[test]
    fn config_walks() {
        let m = matcher();
        assert!(m.config("role:we*", ":"));
        assert!(m.config("service:tier:edge", ":"));
        assert!(m.config_regex("role:w.b", ":"));
        assert!(m.config_exact("role:web", ":"));
        assert!(!m.config_exact("role:we*", ":"));
    }

    #[test]
    fn ipcidr_addresses_and_networks() {
        let m = matcher();
        assert!(m.ipcidr("10.0.4.7"));
        assert!(m.ipcidr("10.0.4.0/24"));
        assert!(m.ipcidr("::1"));
        assert!(!m.ipcidr("10.0.5.0/24"));
        assert!(!m.ipcidr("not-an-address"));
    }

    #[test]
    fn range_without_server() {
        let m = matcher();
        assert!(!m.range("%cluster"));
    }

    #[test]
    fn targeted_dispatch() {
        let m = matcher();
        assert!(m.targeted(&json!("web-*"), None, None));
        assert!(m.targeted(&json!("web-*"), Some("glob"), None));
        assert!(m.targeted(&json!("os:Linux"), Some("grain"), None));
        assert!(m.targeted(&json!("os|Linux"), Some("grain"), Some("|")));
        assert!(m.targeted(&json!(["web-01"]), Some("list"), None));
        assert!(!m.targeted(&json!("web-*"), Some("nodegroup"), None));
        assert!(!m.targeted(&json!("web-*"), Some("bogus"), None));
    }
}
