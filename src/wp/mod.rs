//! WP-CLI execution over the exec-socket service
//!
//! The exec-socket accepts `{nodeIp, appName, component, cmd}` and
//! returns raw shell-interleaved text: the command echo, shell prompts
//! and the actual output all mixed together. Callers get the filtered
//! output only.

use serde_json::json;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::auth::ZelIdAuth;
use crate::fallback::AttemptError;
use crate::nodes::NodeAddress;

/// WP-CLI commands can churn for a while (plugin installs, db exports)
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// POST {exec_base}/exec — run a shell command inside the app component
/// on one specific node
pub async fn exec_on_node(
    exec_base: &str,
    node: &NodeAddress,
    app: &str,
    component: &str,
    cmd: &str,
    auth: &ZelIdAuth,
) -> Result<String, AttemptError> {
    let url = format!("{}/exec", exec_base.trim_end_matches('/'));
    debug!("exec on {} via {}: {}", node.host, url, cmd);

    let client = reqwest::Client::builder()
        .timeout(EXEC_TIMEOUT)
        .build()
        .map_err(|e| AttemptError::Transport(format!("HTTP client error: {}", e)))?;

    let resp = client
        .post(&url)
        .header("zelidauth", auth.to_header_value())
        .json(&json!({
            "nodeIp": node.host,
            "appName": app,
            "component": component,
            "cmd": cmd,
        }))
        .send()
        .await
        .map_err(|e| AttemptError::Transport(format!("Node {} unreachable: {}", node.host, e)))?;

    if !resp.status().is_success() {
        return Err(AttemptError::Node(format!(
            "Node {} returned {}",
            node.host,
            resp.status().as_u16()
        )));
    }

    let raw = resp
        .text()
        .await
        .map_err(|e| AttemptError::Transport(format!("Node {} read error: {}", node.host, e)))?;
    Ok(filter_output(&raw, cmd))
}

/// Strip command echoes and shell prompt lines from raw exec output
pub fn filter_output(raw: &str, cmd: &str) -> String {
    raw.lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return false;
            }
            // The shell echoes the command back, sometimes prefixed by a prompt
            if trimmed.contains(cmd) {
                return false;
            }
            // Bare prompt lines like "root@abc123:/var/www/html#"
            if trimmed.ends_with('#') || trimmed.ends_with('$') {
                return false;
            }
            true
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// WordPress site URLs rarely change, so one lookup per (app, node) is
/// kept for the process lifetime. Explicit and scoped — invalidate by
/// dropping the entry.
#[derive(Default)]
pub struct SiteUrlCache {
    inner: RwLock<HashMap<String, String>>,
}

impl SiteUrlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(app: &str, node: &NodeAddress) -> String {
        format!("{}@{}", app, node.host)
    }

    pub fn get(&self, app: &str, node: &NodeAddress) -> Option<String> {
        self.inner.read().unwrap().get(&Self::key(app, node)).cloned()
    }

    pub fn set(&self, app: &str, node: &NodeAddress, url: String) {
        self.inner.write().unwrap().insert(Self::key(app, node), url);
    }

    pub fn invalidate(&self, app: &str, node: &NodeAddress) {
        self.inner.write().unwrap().remove(&Self::key(app, node));
    }
}

/// Resolve the WordPress site URL for an app on one node, through the
/// cache first
pub async fn site_url(
    cache: &SiteUrlCache,
    exec_base: &str,
    node: &NodeAddress,
    app: &str,
    component: &str,
    auth: &ZelIdAuth,
) -> Result<String, AttemptError> {
    if let Some(url) = cache.get(app, node) {
        return Ok(url);
    }

    let cmd = "wp option get siteurl --skip-plugins --skip-themes";
    let output = exec_on_node(exec_base, node, app, component, cmd, auth).await?;
    let url = output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.starts_with("http://") || l.starts_with("https://"))
        .ok_or_else(|| {
            AttemptError::Node(format!("Node {} returned no site URL", node.host))
        })?
        .to_string();

    cache.set(app, node, url.clone());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_drops_echo_and_prompts() {
        let raw = "root@abc:/var/www/html# wp plugin list --format=json\n\
                   [{\"name\":\"akismet\"}]\n\
                   root@abc:/var/www/html#\n";
        let filtered = filter_output(raw, "wp plugin list --format=json");
        assert_eq!(filtered, "[{\"name\":\"akismet\"}]");
    }

    #[test]
    fn filter_keeps_multiline_output() {
        let raw = "$ wp user list\nadmin\teditor\nbob\tauthor\n$\n";
        let filtered = filter_output(raw, "wp user list");
        assert_eq!(filtered, "admin\teditor\nbob\tauthor");
    }

    #[test]
    fn filter_drops_blank_lines() {
        assert_eq!(filter_output("\n\nhello\n\n", "wp x"), "hello");
    }

    #[test]
    fn site_url_cache_is_keyed_by_app_and_node() {
        let cache = SiteUrlCache::new();
        let n1 = NodeAddress::new("10.0.0.5", 16127);
        let n2 = NodeAddress::new("10.0.0.9", 16127);

        cache.set("blog", &n1, "https://blog.example".to_string());
        assert_eq!(cache.get("blog", &n1).unwrap(), "https://blog.example");
        assert!(cache.get("blog", &n2).is_none());
        assert!(cache.get("shop", &n1).is_none());

        cache.invalidate("blog", &n1);
        assert!(cache.get("blog", &n1).is_none());
    }
}
