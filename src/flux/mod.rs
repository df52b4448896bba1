//! FluxOS public API client
//!
//! Thin read-mostly client for the global FluxOS REST API: app
//! specifications, per-app instance locations (the candidate node list
//! the orchestrator starts from) and lifecycle actions.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::auth::ZelIdAuth;
use crate::nodes::{NodeAddress, to_management_address};

pub const DEFAULT_API_BASE: &str = "https://api.runonflux.io";

pub struct FluxClient {
    base_url: String,
    client: reqwest::Client,
}

impl FluxClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url: base_url.trim_end_matches('/').to_string(), client }
    }

    /// GET a FluxOS endpoint and unwrap the `{status, data}` envelope
    async fn get(&self, path: &str) -> Result<Value, String> {
        let url = format!("{}{}", self.base_url, path);
        debug!("FluxOS GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("FluxOS request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("FluxOS API {} {}: {}", status.as_u16(), path, body));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| format!("FluxOS JSON parse: {}", e))?;

        if json.get("status").and_then(|s| s.as_str()) == Some("error") {
            let message = json
                .get("data")
                .and_then(|d| d.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(format!("FluxOS error on {}: {}", path, message));
        }

        Ok(json.get("data").cloned().unwrap_or(json))
    }

    /// Instance addresses for an app, re-pointed at the management port
    pub async fn app_locations(&self, app: &str) -> Result<Vec<NodeAddress>, String> {
        let data = self.get(&format!("/apps/location/{}", app)).await?;
        let arr = data.as_array().ok_or("Expected array from /apps/location")?;
        let nodes: Vec<NodeAddress> = arr
            .iter()
            .filter_map(|v| v.get("ip").and_then(|ip| ip.as_str()))
            .filter_map(to_management_address)
            .collect();
        Ok(nodes)
    }

    /// Full specification of one deployed app
    pub async fn app_specification(&self, app: &str) -> Result<Value, String> {
        self.get(&format!("/apps/appspecifications/{}", app)).await
    }

    /// All global app specs owned by one wallet address
    pub async fn apps_by_owner(&self, owner: &str) -> Result<Vec<Value>, String> {
        let data = self.get("/apps/globalappsspecifications").await?;
        let arr = data
            .as_array()
            .ok_or("Expected array from /apps/globalappsspecifications")?;
        Ok(arr
            .iter()
            .filter(|spec| spec.get("owner").and_then(|o| o.as_str()) == Some(owner))
            .cloned()
            .collect())
    }

    /// Lifecycle passthrough: start/stop/restart a deployed app.
    /// FluxOS wants the raw credential on these, so the normalized form
    /// is serialized back to the JSON-object shape it accepts.
    pub async fn app_lifecycle(
        &self,
        app: &str,
        action: &str,
        auth: &ZelIdAuth,
    ) -> Result<Value, String> {
        let path = match action {
            "start" | "stop" | "restart" => format!("/apps/app{}/{}", action, app),
            other => return Err(format!("Unsupported lifecycle action: {}", other)),
        };
        let url = format!("{}{}", self.base_url, path);
        debug!("FluxOS lifecycle {}", url);

        let resp = self
            .client
            .get(&url)
            .header("zelidauth", auth.to_header_value())
            .send()
            .await
            .map_err(|e| format!("FluxOS request failed: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("FluxOS API {} {}", resp.status().as_u16(), path));
        }
        resp.json().await.map_err(|e| format!("FluxOS JSON parse: {}", e))
    }
}
