//! Attribute-tree collection: read-mostly facts about the host,
//! refreshed atomically as a whole map.

use serde_json::{json, Map, Value};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Collect the attribute tree, with static overrides from the
/// configuration merged on top.
pub fn collect(id: &str, overrides: &Map<String, Value>) -> Value {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| id.to_string());

    let mut ipv4 = vec!["127.0.0.1".to_string()];
    if let Some(addr) = primary_addr_v4() {
        ipv4.insert(0, addr.to_string());
    }
    let mut ipv6 = vec!["::1".to_string()];
    if let Some(addr) = primary_addr_v6() {
        ipv6.insert(0, addr.to_string());
    }

    let mut grains = Map::new();
    grains.insert("id".to_string(), json!(id));
    grains.insert("host".to_string(), json!(host));
    grains.insert("fqdn".to_string(), json!(host));
    grains.insert("kernel".to_string(), json!(std::env::consts::OS));
    grains.insert("os".to_string(), json!(os_name()));
    grains.insert("os_family".to_string(), json!(os_family()));
    grains.insert("cpuarch".to_string(), json!(std::env::consts::ARCH));
    grains.insert(
        "num_cpus".to_string(),
        json!(std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)),
    );
    grains.insert("pid".to_string(), json!(std::process::id()));
    grains.insert("ipv4".to_string(), json!(ipv4));
    grains.insert("ipv6".to_string(), json!(ipv6));

    for (key, value) in overrides {
        grains.insert(key.clone(), value.clone());
    }

    Value::Object(grains)
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "MacOS",
        "windows" => "Windows",
        "freebsd" => "FreeBSD",
        other => other,
    }
}

fn os_family() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" | "freebsd" => "Unix",
        "windows" => "Windows",
        other => other,
    }
}

/// The address a default-route packet would leave from. No traffic is
/// sent; connect on a UDP socket only selects the local endpoint.
fn primary_addr_v4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.255.255.255:9").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

fn primary_addr_v6() -> Option<Ipv6Addr> {
    let socket = UdpSocket::bind("[::]:0").ok()?;
    socket.connect("[100::1]:9").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V6(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_has_core_keys() {
        let grains = collect("web-01", &Map::new());
        assert_eq!(grains["id"], json!("web-01"));
        for key in ["host", "os", "os_family", "cpuarch", "num_cpus", "ipv4", "ipv6"] {
            assert!(grains.get(key).is_some(), "{key} missing");
        }
        // loopback is always present
        assert!(grains["ipv4"]
            .as_array()
            .unwrap()
            .contains(&json!("127.0.0.1")));
    }

    #[test]
    fn overrides_win() {
        let mut overrides = Map::new();
        overrides.insert("os".to_string(), json!("CustomOS"));
        overrides.insert("datacenter".to_string(), json!("fra1"));
        let grains = collect("web-01", &overrides);
        assert_eq!(grains["os"], json!("CustomOS"));
        assert_eq!(grains["datacenter"], json!("fra1"));
    }
}
