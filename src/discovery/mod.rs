//! Master discovery — asks external oracles which node instance is
//! currently authoritative for an application
//!
//! Two oracle families exist:
//! - FDM (Flux Domain Manager) regional servers, which return an IP list
//!   pre-sorted master-first
//! - the per-app HAProxy statistics page, from which the currently
//!   active backend server can be read
//!
//! Oracles are tried in a fixed ranked order (FDM EU, USA, ASIA, then
//! HAProxy); the first well-formed non-empty answer wins and no merging
//! happens across oracles. Every failure mode is swallowed: absence of a
//! master is a normal outcome and callers degrade to the caller-supplied
//! node order.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::nodes::host_only;

/// Per-oracle request timeout
pub const ORACLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answer from a single oracle
#[derive(Debug, Clone)]
pub struct MasterCandidate {
    pub host: String,
    pub all_hosts: Vec<String>,
    pub source: &'static str,
}

/// Aggregated discovery result. `master_host` is None when every oracle
/// failed or answered empty — a common, valid outcome.
#[derive(Debug, Clone, Default)]
pub struct MasterLookup {
    pub master_host: Option<String>,
    pub all_hosts: Vec<String>,
    pub source: Option<&'static str>,
}

/// One interchangeable discovery strategy. All oracles share this
/// signature so new ones can be ranked in without touching the executor.
#[allow(async_fn_in_trait)]
pub trait MasterOracle {
    fn name(&self) -> &'static str;
    async fn lookup(&self, client: &reqwest::Client, app_name: &str) -> Option<MasterCandidate>;
}

// ─── FDM ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdmRegion {
    Eu,
    Usa,
    Asia,
}

impl FdmRegion {
    /// Fixed confidence order
    pub const RANKED: [FdmRegion; 3] = [FdmRegion::Eu, FdmRegion::Usa, FdmRegion::Asia];

    fn slug(self) -> &'static str {
        match self {
            FdmRegion::Eu => "eu",
            FdmRegion::Usa => "usa",
            FdmRegion::Asia => "asia",
        }
    }

    fn source_tag(self) -> &'static str {
        match self {
            FdmRegion::Eu => "fdm-eu",
            FdmRegion::Usa => "fdm-usa",
            FdmRegion::Asia => "fdm-asia",
        }
    }

    fn base_url(self, index: u8) -> String {
        format!("https://fdm-{}-1-{}.runonflux.io", self.slug(), index)
    }
}

/// Applications are sharded across four regional FDM index slots purely
/// by the first character of the app name.
pub fn fdm_index(app_name: &str) -> u8 {
    match app_name.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('a'..='g') => 1,
        Some('h'..='n') => 2,
        Some('o'..='u') => 3,
        Some('v'..='z') => 4,
        _ => 1,
    }
}

pub struct FdmOracle {
    pub region: FdmRegion,
}

impl MasterOracle for FdmOracle {
    fn name(&self) -> &'static str {
        self.region.source_tag()
    }

    async fn lookup(&self, client: &reqwest::Client, app_name: &str) -> Option<MasterCandidate> {
        let url = format!(
            "{}/appips/{}",
            self.region.base_url(fdm_index(app_name)),
            app_name
        );
        debug!("FDM lookup {}", url);

        let resp = match client.get(&url).timeout(ORACLE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("FDM {} unreachable: {}", self.name(), e);
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!("FDM {} returned {}", self.name(), resp.status().as_u16());
            return None;
        }
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                debug!("FDM {} malformed body: {}", self.name(), e);
                return None;
            }
        };

        let hosts = parse_fdm_ips(&body)?;
        Some(MasterCandidate {
            host: hosts.first()?.clone(),
            all_hosts: hosts,
            source: self.name(),
        })
    }
}

/// Extract the master-first IP list from an FDM `/appips` response.
/// Returns None for an empty or malformed list.
pub fn parse_fdm_ips(body: &Value) -> Option<Vec<String>> {
    let ips = body.get("data")?.get("ips")?.as_array()?;
    let hosts: Vec<String> = ips
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| host_only(s).to_string())
        .collect();
    if hosts.is_empty() { None } else { Some(hosts) }
}

// ─── HAProxy ───

pub struct HaproxyOracle;

impl MasterOracle for HaproxyOracle {
    fn name(&self) -> &'static str {
        "haproxy"
    }

    async fn lookup(&self, client: &reqwest::Client, app_name: &str) -> Option<MasterCandidate> {
        let scope = format!("{}apprunonfluxio", app_name.to_lowercase());
        let url = format!(
            "https://{}.app.runonflux.io/fluxstatistics?scope={};json;norefresh",
            app_name.to_lowercase(),
            scope
        );
        debug!("HAProxy lookup {}", url);

        let resp = match client.get(&url).timeout(ORACLE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("HAProxy stats unreachable: {}", e);
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!("HAProxy stats returned {}", resp.status().as_u16());
            return None;
        }
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                debug!("HAProxy stats malformed body: {}", e);
                return None;
            }
        };

        let svname = parse_haproxy_active(&body)?;
        let host = host_only(&svname).to_string();
        if host.is_empty() {
            return None;
        }
        Some(MasterCandidate { host, all_hosts: vec![], source: self.name() })
    }
}

/// Walk the HAProxy stats JSON dialect (an array of per-server arrays of
/// field descriptor objects) and return the `svname` of the server whose
/// `act` field is 1 — the backend HAProxy currently routes to.
pub fn parse_haproxy_active(body: &Value) -> Option<String> {
    let rows = body.as_array()?;
    for row in rows {
        let fields = match row.as_array() {
            Some(f) => f,
            None => continue,
        };
        let mut act = false;
        let mut svname: Option<String> = None;
        for field in fields {
            let name = field
                .get("field")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("");
            let value = field.get("value").and_then(|v| v.get("value"));
            match name {
                "act" => {
                    act = value
                        .map(|v| v.as_u64() == Some(1) || v.as_str() == Some("1"))
                        .unwrap_or(false);
                }
                "svname" => {
                    svname = value.and_then(|v| v.as_str()).map(|s| s.to_string());
                }
                _ => {}
            }
        }
        if act {
            if let Some(name) = svname {
                return Some(name);
            }
        }
    }
    None
}

// ─── Ranked lookup ───

/// Ask every oracle in ranked order; first non-empty answer wins.
/// Never errors — a lookup with no master is the degraded-but-valid case.
pub async fn detect_master(client: &reqwest::Client, app_name: &str) -> MasterLookup {
    if app_name.is_empty() {
        return MasterLookup::default();
    }

    for region in FdmRegion::RANKED {
        let oracle = FdmOracle { region };
        if let Some(candidate) = oracle.lookup(client, app_name).await {
            debug!(
                "Master for {} is {} (via {})",
                app_name, candidate.host, candidate.source
            );
            return MasterLookup {
                master_host: Some(candidate.host),
                all_hosts: candidate.all_hosts,
                source: Some(candidate.source),
            };
        }
    }

    if let Some(candidate) = HaproxyOracle.lookup(client, app_name).await {
        debug!(
            "Master for {} is {} (via {})",
            app_name, candidate.host, candidate.source
        );
        return MasterLookup {
            master_host: Some(candidate.host),
            all_hosts: candidate.all_hosts,
            source: Some(candidate.source),
        };
    }

    debug!("No master found for {} — using caller node order", app_name);
    MasterLookup::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn index_slots_follow_first_character() {
        assert_eq!(fdm_index("alpha"), 1);
        assert_eq!(fdm_index("gamma"), 1);
        assert_eq!(fdm_index("hotel"), 2);
        assert_eq!(fdm_index("november"), 2);
        assert_eq!(fdm_index("oscar"), 3);
        assert_eq!(fdm_index("uniform"), 3);
        assert_eq!(fdm_index("victor"), 4);
        assert_eq!(fdm_index("zulu"), 4);
        assert_eq!(fdm_index("Alpha"), 1);
        assert_eq!(fdm_index("9lives"), 1);
        assert_eq!(fdm_index(""), 1);
    }

    #[test]
    fn fdm_ips_are_host_only_master_first() {
        let body = json!({"status": "success", "data": {"ips": ["10.0.0.9:31000", "10.0.0.5"]}});
        let hosts = parse_fdm_ips(&body).unwrap();
        assert_eq!(hosts, vec!["10.0.0.9", "10.0.0.5"]);
    }

    #[test]
    fn fdm_empty_or_malformed_is_none() {
        assert!(parse_fdm_ips(&json!({"data": {"ips": []}})).is_none());
        assert!(parse_fdm_ips(&json!({"data": {}})).is_none());
        assert!(parse_fdm_ips(&json!("nope")).is_none());
        assert!(parse_fdm_ips(&json!({"data": {"ips": ["", "  "]}})).is_none());
    }

    fn stat_field(name: &str, value: Value) -> Value {
        json!({"field": {"name": name}, "value": {"value": value}})
    }

    #[test]
    fn haproxy_active_server_is_found() {
        let body = json!([
            [stat_field("svname", json!("10.0.0.5:31000")), stat_field("act", json!(0))],
            [stat_field("svname", json!("10.0.0.9:31000")), stat_field("act", json!(1))],
        ]);
        assert_eq!(parse_haproxy_active(&body).unwrap(), "10.0.0.9:31000");
    }

    #[test]
    fn haproxy_accepts_string_act_flag() {
        let body = json!([
            [stat_field("act", json!("1")), stat_field("svname", json!("10.0.0.7:31000"))],
        ]);
        assert_eq!(parse_haproxy_active(&body).unwrap(), "10.0.0.7:31000");
    }

    #[test]
    fn haproxy_no_active_server_is_none() {
        let body = json!([
            [stat_field("svname", json!("10.0.0.5:31000")), stat_field("act", json!(0))],
        ]);
        assert!(parse_haproxy_active(&body).is_none());
        assert!(parse_haproxy_active(&json!({})).is_none());
        assert!(parse_haproxy_active(&json!([])).is_none());
    }

    #[tokio::test]
    async fn detect_master_resolves_for_empty_app_name() {
        // Fail-soft path with no network involved
        let client = reqwest::Client::new();
        let lookup = detect_master(&client, "").await;
        assert!(lookup.master_host.is_none());
        assert!(lookup.source.is_none());
    }
}
