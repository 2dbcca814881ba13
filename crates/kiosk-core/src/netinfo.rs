/// Local network introspection via `ip -j` (iproute2).
///
/// Everything here fails soft: a missing tool, a timed-out command, or
/// unparseable output yields `None` / an empty list. Parsing is kept apart
/// from command invocation so it can be tested on captured output.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Deserialize;
use tokio::process::Command;

const IP_CMD_TIMEOUT: Duration = Duration::from_secs(2);

/// Public anycast address handed to the routing layer purely to learn which
/// device it would pick for default egress. No traffic is sent to it.
const EGRESS_PROBE_ADDR: &str = "1.1.1.1";

#[derive(Debug, Deserialize)]
struct RouteEntry {
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrEntry {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: Option<String>,
    local: Option<String>,
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct NeighEntry {
    dst: Option<String>,
}

/// CIDR of the interface the OS would use for default egress.
pub async fn default_cidr() -> Option<Ipv4Net> {
    let route_json = run_ip(&["-j", "route", "get", EGRESS_PROBE_ADDR]).await?;
    let dev = parse_egress_device(&route_json)?;
    let addr_json = run_ip(&["-j", "addr", "show", "dev", &dev]).await?;
    parse_device_cidr(&addr_json)
}

/// Distinct IPv4 entries from the OS neighbor cache, order preserved.
pub async fn neighbor_ips() -> Vec<Ipv4Addr> {
    match run_ip(&["-j", "neigh", "show"]).await {
        Some(json) => parse_neighbors(&json),
        None => Vec::new(),
    }
}

async fn run_ip(args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("ip");
    cmd.args(args);
    let out = tokio::time::timeout(IP_CMD_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    if text.trim().is_empty() {
        return None;
    }
    Some(text)
}

fn parse_egress_device(json: &str) -> Option<String> {
    let routes: Vec<RouteEntry> = serde_json::from_str(json).ok()?;
    routes.into_iter().find_map(|r| r.dev)
}

fn parse_device_cidr(json: &str) -> Option<Ipv4Net> {
    let entries: Vec<AddrEntry> = serde_json::from_str(json).ok()?;
    for entry in entries {
        for info in entry.addr_info {
            if info.family.as_deref() != Some("inet") {
                continue;
            }
            let (Some(local), Some(prefixlen)) = (info.local, info.prefixlen) else {
                continue;
            };
            let Ok(ip) = local.parse::<Ipv4Addr>() else {
                continue;
            };
            if let Ok(net) = Ipv4Net::new(ip, prefixlen) {
                return Some(net.trunc());
            }
        }
    }
    None
}

fn parse_neighbors(json: &str) -> Vec<Ipv4Addr> {
    let Ok(entries) = serde_json::from_str::<Vec<NeighEntry>>(json) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries {
        let Some(ip) = entry.dst.and_then(|d| d.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}
