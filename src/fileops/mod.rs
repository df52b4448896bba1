//! Per-node file operation adapters
//!
//! Each adapter wraps one REST call against a single node's management
//! API and normalizes the result into the attempt outcome the fallback
//! executor expects. Adapters never loop or retry themselves — node
//! selection and fallback happen a layer up.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::auth::ZelIdAuth;
use crate::fallback::AttemptError;
use crate::nodes::NodeAddress;

// Per-attempt timeouts, weighted by operation cost
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const SAVE_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const DELETE_TIMEOUT: Duration = Duration::from_secs(20);

/// Downloaded file body — JSON passthrough when the node served JSON,
/// raw text otherwise
#[derive(Debug, Clone)]
pub enum FileContent {
    Json(Value),
    Text(String),
}

fn client(timeout: Duration) -> Result<reqwest::Client, AttemptError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AttemptError::Transport(format!("HTTP client error: {}", e)))
}

fn transport(node: &NodeAddress, e: reqwest::Error) -> AttemptError {
    AttemptError::Transport(format!("Node {} unreachable: {}", node.host, e))
}

/// A 2xx body can still be an application-level failure: FluxOS wraps
/// those in a `{status:"error"}` envelope with the message nested in
/// several possible places.
pub fn envelope_error(body: &Value) -> Option<String> {
    if body.get("status").and_then(|s| s.as_str()) != Some("error") {
        return None;
    }
    let message = body
        .get("data")
        .and_then(|d| d.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| body.get("data").and_then(|d| d.as_str()))
        .or_else(|| body.get("message").and_then(|m| m.as_str()))
        .unwrap_or("Node returned an error");
    Some(message.to_string())
}

/// Classify a node response: non-2xx and error envelopes become node
/// errors carrying the most concrete message available.
async fn classify_json(node: &NodeAddress, resp: reqwest::Response) -> Result<Value, AttemptError> {
    if !resp.status().is_success() {
        return Err(AttemptError::Node(format!(
            "Node {} returned {}",
            node.host,
            resp.status().as_u16()
        )));
    }
    let body: Value = resp
        .json()
        .await
        .map_err(|e| AttemptError::Node(format!("Node {} sent malformed JSON: {}", node.host, e)))?;
    if let Some(message) = envelope_error(&body) {
        return Err(AttemptError::Node(message));
    }
    Ok(body)
}

/// GET /apps/getfolderinfo — directory listing
pub async fn list_folder(
    node: &NodeAddress,
    app: &str,
    component: &str,
    path: &str,
    auth: &ZelIdAuth,
) -> Result<Value, AttemptError> {
    let url = format!(
        "{}/apps/getfolderinfo/{}/{}/{}",
        node.base_url(),
        app,
        component,
        urlencoding::encode(path)
    );
    debug!("list {}", url);

    let resp = client(LIST_TIMEOUT)?
        .get(&url)
        .header("zelidauth", auth.to_header_value())
        .send()
        .await
        .map_err(|e| transport(node, e))?;
    classify_json(node, resp).await
}

/// GET /apps/downloadfile — file content passthrough. A body that fails
/// to parse as JSON is a raw text file, not an error.
pub async fn download_file(
    node: &NodeAddress,
    app: &str,
    component: &str,
    path: &str,
    auth: &ZelIdAuth,
) -> Result<FileContent, AttemptError> {
    let url = format!(
        "{}/apps/downloadfile/{}/{}/{}",
        node.base_url(),
        app,
        component,
        urlencoding::encode(path)
    );
    debug!("download {}", url);

    let resp = client(DOWNLOAD_TIMEOUT)?
        .get(&url)
        .header("zelidauth", auth.to_header_value())
        .send()
        .await
        .map_err(|e| transport(node, e))?;

    if !resp.status().is_success() {
        return Err(AttemptError::Node(format!(
            "Node {} returned {}",
            node.host,
            resp.status().as_u16()
        )));
    }

    let text = resp
        .text()
        .await
        .map_err(|e| transport(node, e))?;

    match serde_json::from_str::<Value>(&text) {
        Ok(body) => {
            if let Some(message) = envelope_error(&body) {
                return Err(AttemptError::Node(message));
            }
            Ok(FileContent::Json(body))
        }
        Err(_) => Ok(FileContent::Text(text)),
    }
}

/// POST /ioutils/fileupload — save a text file into its folder
pub async fn save_file(
    node: &NodeAddress,
    app: &str,
    component: &str,
    folder: &str,
    file_name: &str,
    content: String,
    auth: &ZelIdAuth,
) -> Result<Value, AttemptError> {
    let part = reqwest::multipart::Part::text(content).file_name(file_name.to_string());
    upload_part(node, app, component, folder, part, SAVE_TIMEOUT, auth).await
}

/// POST /ioutils/fileupload — binary upload into a folder
pub async fn upload_binary(
    node: &NodeAddress,
    app: &str,
    component: &str,
    folder: &str,
    file_name: &str,
    bytes: Vec<u8>,
    auth: &ZelIdAuth,
) -> Result<Value, AttemptError> {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name.to_string())
        .mime_str("application/octet-stream")
        .map_err(|e| AttemptError::Node(format!("MIME error: {}", e)))?;
    upload_part(node, app, component, folder, part, UPLOAD_TIMEOUT, auth).await
}

async fn upload_part(
    node: &NodeAddress,
    app: &str,
    component: &str,
    folder: &str,
    part: reqwest::multipart::Part,
    timeout: Duration,
    auth: &ZelIdAuth,
) -> Result<Value, AttemptError> {
    let url = upload_url(node, app, component, folder);
    debug!("upload {}", url);

    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = client(timeout)?
        .post(&url)
        .header("zelidauth", auth.to_header_value())
        .multipart(form)
        .send()
        .await
        .map_err(|e| transport(node, e))?;
    classify_json(node, resp).await
}

/// The folder segment is omitted entirely for the volume root
fn upload_url(node: &NodeAddress, app: &str, component: &str, folder: &str) -> String {
    let base = format!("{}/ioutils/fileupload/volume/{}/{}", node.base_url(), app, component);
    if folder.is_empty() {
        base
    } else {
        format!("{}/{}", base, urlencoding::encode(folder))
    }
}

/// GET /apps/removeobject — delete a file or directory
pub async fn remove_object(
    node: &NodeAddress,
    app: &str,
    component: &str,
    path: &str,
    auth: &ZelIdAuth,
) -> Result<Value, AttemptError> {
    let url = format!(
        "{}/apps/removeobject/{}/{}/{}",
        node.base_url(),
        app,
        component,
        urlencoding::encode(path)
    );
    debug!("delete {}", url);

    let resp = client(DELETE_TIMEOUT)?
        .get(&url)
        .header("zelidauth", auth.to_header_value())
        .send()
        .await
        .map_err(|e| transport(node, e))?;
    classify_json(node, resp).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_envelope_message_is_extracted() {
        let body = json!({"status": "error", "data": {"message": "Application volume not found"}});
        assert_eq!(envelope_error(&body).unwrap(), "Application volume not found");

        let body = json!({"status": "error", "data": "volume gone"});
        assert_eq!(envelope_error(&body).unwrap(), "volume gone");

        let body = json!({"status": "error", "message": "top-level"});
        assert_eq!(envelope_error(&body).unwrap(), "top-level");

        let body = json!({"status": "error"});
        assert_eq!(envelope_error(&body).unwrap(), "Node returned an error");
    }

    #[test]
    fn success_envelope_is_not_an_error() {
        assert!(envelope_error(&json!({"status": "success", "data": []})).is_none());
        assert!(envelope_error(&json!({"data": {"message": "hi"}})).is_none());
        assert!(envelope_error(&json!("raw body")).is_none());
    }

    #[test]
    fn upload_url_omits_empty_folder_segment() {
        let node = NodeAddress::new("10.0.0.5", 16127);
        assert_eq!(
            upload_url(&node, "myapp", "web", ""),
            "http://10.0.0.5:16127/ioutils/fileupload/volume/myapp/web"
        );
        assert_eq!(
            upload_url(&node, "myapp", "web", "wp-content/uploads"),
            "http://10.0.0.5:16127/ioutils/fileupload/volume/myapp/web/wp-content%2Fuploads"
        );
    }
}
