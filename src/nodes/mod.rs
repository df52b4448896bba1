//! Node addresses and master-first ordering
//!
//! Each FluxCloud application runs on several interchangeable node
//! instances. This module owns the address representation and the pure
//! ordering step that puts the discovered master (when known) at the
//! front of the attempt list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known FluxOS management port. FDM and HAProxy report the
/// application's *exposed* port, not this one — the two must not be
/// confused when turning an oracle answer into a target address.
pub const FLUX_MANAGEMENT_PORT: u16 = 16127;

/// Upper bound on how many nodes a single operation will fan out to.
pub const MAX_FANOUT: usize = 5;

/// One running instance of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port }
    }

    /// Parse `host` or `host:port`. A missing or unparseable port falls
    /// back to the management port. Returns None for an empty host.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (host, port) = match s.split_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().unwrap_or(FLUX_MANAGEMENT_PORT)),
            None => (s, FLUX_MANAGEMENT_PORT),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self { host: host.to_string(), port })
    }

    /// Address equivalence is host-only — ports and formatting differ
    /// between oracles and callers for the same instance.
    pub fn same_host(&self, other: &NodeAddress) -> bool {
        self.host == other.host
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Strip an optional `:port` suffix, keeping the host part only
pub fn host_only(s: &str) -> &str {
    match s.split_once(':') {
        Some((h, _)) => h,
        None => s,
    }
}

/// Re-point an oracle-reported `host[:port]` at the management port.
/// Oracles report the application's exposed port, which is never the
/// port file and exec operations go to.
pub fn to_management_address(s: &str) -> Option<NodeAddress> {
    let host = host_only(s).trim();
    if host.is_empty() {
        return None;
    }
    Some(NodeAddress::new(host, FLUX_MANAGEMENT_PORT))
}

/// Merge a discovered master host with the caller-supplied candidate list
/// into one ordered, deduplicated, length-bounded list.
///
/// If the master matches a candidate by host, that candidate (with its
/// original port) is hoisted to the front; everything else keeps its
/// relative order. A master that matches no candidate is *not* injected —
/// we never contact a node the caller didn't supply.
pub fn order_nodes(master_host: Option<&str>, candidates: &[NodeAddress]) -> Vec<NodeAddress> {
    // Dedupe by host, first occurrence wins
    let mut ordered: Vec<NodeAddress> = Vec::new();
    for c in candidates {
        if !ordered.iter().any(|n| n.same_host(c)) {
            ordered.push(c.clone());
        }
    }

    if let Some(master) = master_host {
        let master = host_only(master);
        if let Some(pos) = ordered.iter().position(|n| n.host == master) {
            let hoisted = ordered.remove(pos);
            ordered.insert(0, hoisted);
        }
    }

    ordered.truncate(MAX_FANOUT);
    ordered
}
