//! REST API for the Capacitor dashboard
//!
//! Every multi-node operation here goes through the same sequence:
//! resolve the candidate node list, ask the oracles for the master,
//! order the nodes, then hand a single-node adapter to the fallback
//! executor. Handlers only differ in the adapter they pass in.

use actix_web::{HttpRequest, HttpResponse, web};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::auth::require_auth;
use crate::discovery;
use crate::fallback::{self, ActiveNodeCache, FallbackError, FallbackSuccess, RetryPolicy};
use crate::fileops::{self, FileContent};
use crate::flux::FluxClient;
use crate::nodes::{NodeAddress, order_nodes};
use crate::wp::{self, SiteUrlCache};

/// Bulk deletions run this many independent fallback sessions at a time;
/// the window advances only once the whole batch settles
const BULK_DELETE_WINDOW: usize = 5;

/// Shared application state
pub struct AppState {
    pub policy: RetryPolicy,
    pub active_nodes: ActiveNodeCache,
    pub site_urls: SiteUrlCache,
    pub flux: FluxClient,
    pub oracle_client: reqwest::Client,
    pub exec_socket_base: String,
}

// ─── Common helpers ───

#[derive(Deserialize)]
pub struct FileQuery {
    pub path: Option<String>,
    /// Optional comma-separated `host[:port]` override of the candidate
    /// list; defaults to the app's FluxOS instance locations
    pub nodes: Option<String>,
}

fn parse_node_list(raw: &str) -> Vec<NodeAddress> {
    raw.split(',').filter_map(NodeAddress::parse).collect()
}

/// Resolve and order the node list for one operation: caller-supplied
/// candidates (or FluxOS locations), master-first when an oracle answers
async fn resolve_ordered_nodes(
    state: &AppState,
    app: &str,
    nodes_param: Option<&str>,
) -> Result<Vec<NodeAddress>, HttpResponse> {
    let candidates = match nodes_param {
        Some(raw) => parse_node_list(raw),
        None => state.flux.app_locations(app).await.map_err(|e| {
            HttpResponse::BadGateway()
                .json(json!({ "error": format!("Unable to resolve nodes for {}: {}", app, e) }))
        })?,
    };

    if candidates.is_empty() {
        // Fails fast — no discovery, no attempts
        return Err(HttpResponse::BadRequest()
            .json(json!({ "error": format!("No nodes available for {}", app) })));
    }

    let lookup = discovery::detect_master(&state.oracle_client, app).await;
    if let Some(source) = lookup.source {
        debug!("Master for {} via {} ({} hosts reported)", app, source, lookup.all_hosts.len());
    }
    Ok(order_nodes(lookup.master_host.as_deref(), &candidates))
}

/// Failure body names the operation and carries the last concrete node
/// error — that message is often the only actionable diagnostic
fn operation_failed(op: &str, err: &FallbackError) -> HttpResponse {
    match err {
        FallbackError::NoNodes => HttpResponse::BadRequest()
            .json(json!({ "error": format!("Failed to {}. No nodes available", op) })),
        FallbackError::Exhausted { last_error, nodes_tried } => HttpResponse::BadGateway().json(
            json!({
                "error": format!("Failed to {}. {}", op, last_error),
                "nodes_tried": nodes_tried,
            }),
        ),
    }
}

fn switch_note<T>(success: &FallbackSuccess<T>) -> serde_json::Value {
    match &success.switched_from {
        Some((from, reason)) => json!({ "from": from.to_string(), "reason": reason }),
        None => serde_json::Value::Null,
    }
}

// ─── File operations ───

/// GET /api/files/{app}/{component}/list?path=
pub async fn list_files(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<FileQuery>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let folder = query.path.clone().unwrap_or_default();

    let nodes = match resolve_ordered_nodes(&state, &app, query.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (app, component, folder, auth) = (app.clone(), component.clone(), folder.clone(), auth.clone());
        async move { fileops::list_folder(&node, &app, &component, &folder, &auth).await }
    })
    .await;

    match result {
        Ok(success) => HttpResponse::Ok().json(json!({
            "status": "success",
            "data": success.payload,
            "node": success.node.to_string(),
            "switched": switch_note(&success),
        })),
        Err(e) => operation_failed("list files", &e),
    }
}

/// GET /api/files/{app}/{component}/download?path= — content passthrough
pub async fn download_file(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<FileQuery>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let file_path = match &query.path {
        Some(p) if !p.is_empty() => p.clone(),
        _ => return HttpResponse::BadRequest().json(json!({ "error": "Missing path" })),
    };

    let nodes = match resolve_ordered_nodes(&state, &app, query.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (app, component, file_path, auth) = (app.clone(), component.clone(), file_path.clone(), auth.clone());
        async move { fileops::download_file(&node, &app, &component, &file_path, &auth).await }
    })
    .await;

    match result {
        Ok(success) => {
            let node = success.node.to_string();
            match success.payload {
                FileContent::Json(v) => HttpResponse::Ok()
                    .insert_header(("x-capacitor-node", node))
                    .json(v),
                FileContent::Text(t) => HttpResponse::Ok()
                    .insert_header(("x-capacitor-node", node))
                    .content_type("text/plain; charset=utf-8")
                    .body(t),
            }
        }
        Err(e) => operation_failed("download file", &e),
    }
}

#[derive(Deserialize)]
pub struct SaveFileRequest {
    pub content: String,
}

/// PUT /api/files/{app}/{component}/save?path= — text save
pub async fn save_file(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<FileQuery>,
    body: web::Json<SaveFileRequest>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let file_path = match &query.path {
        Some(p) if !p.is_empty() => p.clone(),
        _ => return HttpResponse::BadRequest().json(json!({ "error": "Missing path" })),
    };
    // Last segment is the file name, the rest its folder
    let (folder, file_name) = match file_path.rsplit_once('/') {
        Some((f, n)) => (f.to_string(), n.to_string()),
        None => (String::new(), file_path.clone()),
    };
    if file_name.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Missing file name" }));
    }
    let content = body.into_inner().content;

    let nodes = match resolve_ordered_nodes(&state, &app, query.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (app, component, folder, file_name, content, auth) = (
            app.clone(), component.clone(), folder.clone(), file_name.clone(), content.clone(), auth.clone(),
        );
        async move {
            fileops::save_file(&node, &app, &component, &folder, &file_name, content, &auth).await
        }
    })
    .await;

    match result {
        Ok(success) => {
            info!("Saved {} for {}/{} on {}", file_path, app, component, success.node);
            HttpResponse::Ok().json(json!({
                "status": "success",
                "node": success.node.to_string(),
                "switched": switch_note(&success),
            }))
        }
        Err(e) => operation_failed("save file", &e),
    }
}

/// POST /api/files/{app}/{component}/upload?path= — multipart binary upload
/// into the folder named by `path` (volume root when absent)
pub async fn upload_file(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<FileQuery>,
    mut payload: actix_multipart::Multipart,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let folder = query.path.clone().unwrap_or_default();

    // The whole file is buffered up front: a retried attempt must be able
    // to replay the body against another node
    let mut file_name = String::new();
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(item) = payload.next().await {
        let mut field = match item {
            Ok(f) => f,
            Err(e) => {
                return HttpResponse::BadRequest()
                    .json(json!({ "error": format!("Malformed upload: {}", e) }));
            }
        };
        if let Some(name) = field.content_disposition().and_then(|cd| cd.get_filename()) {
            file_name = name.to_string();
        }
        while let Some(chunk) = field.next().await {
            match chunk {
                Ok(data) => bytes.extend_from_slice(&data),
                Err(e) => {
                    return HttpResponse::BadRequest()
                        .json(json!({ "error": format!("Upload read error: {}", e) }));
                }
            }
        }
    }
    if file_name.is_empty() || bytes.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No file in upload" }));
    }

    let nodes = match resolve_ordered_nodes(&state, &app, query.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let size = bytes.len();
    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (app, component, folder, file_name, bytes, auth) = (
            app.clone(), component.clone(), folder.clone(), file_name.clone(), bytes.clone(), auth.clone(),
        );
        async move {
            fileops::upload_binary(&node, &app, &component, &folder, &file_name, bytes, &auth).await
        }
    })
    .await;

    match result {
        Ok(success) => {
            info!("Uploaded {} ({} bytes) for {}/{} to {}", file_name, size, app, component, success.node);
            HttpResponse::Ok().json(json!({
                "status": "success",
                "node": success.node.to_string(),
                "switched": switch_note(&success),
            }))
        }
        Err(e) => operation_failed("upload file", &e),
    }
}

/// DELETE /api/files/{app}/{component}?path= — delete one path
pub async fn delete_path(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<FileQuery>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let target = match &query.path {
        Some(p) if !p.is_empty() => p.clone(),
        _ => return HttpResponse::BadRequest().json(json!({ "error": "Missing path" })),
    };

    let nodes = match resolve_ordered_nodes(&state, &app, query.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (app, component, target, auth) = (app.clone(), component.clone(), target.clone(), auth.clone());
        async move { fileops::remove_object(&node, &app, &component, &target, &auth).await }
    })
    .await;

    match result {
        Ok(success) => {
            info!("Deleted {} for {}/{} on {}", target, app, component, success.node);
            HttpResponse::Ok().json(json!({
                "status": "success",
                "node": success.node.to_string(),
                "switched": switch_note(&success),
            }))
        }
        Err(e) => operation_failed("delete", &e),
    }
}

#[derive(Deserialize)]
pub struct BulkDeleteRequest {
    pub paths: Vec<String>,
    pub nodes: Option<String>,
}

/// POST /api/files/{app}/{component}/bulk-delete — many paths, a window
/// of independent fallback sessions at a time. Partial failure never
/// cancels the rest of the batch; failures accumulate into the report.
pub async fn bulk_delete(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<BulkDeleteRequest>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let request = body.into_inner();
    if request.paths.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "No paths supplied" }));
    }

    let nodes = match resolve_ordered_nodes(&state, &app, request.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let mut report: Vec<serde_json::Value> = Vec::new();
    let mut failures = 0usize;

    for batch in request.paths.chunks(BULK_DELETE_WINDOW) {
        let sessions = batch.iter().map(|target| {
            let (state, app, component, nodes, auth, target) =
                (&state, &app, &component, &nodes, &auth, target.clone());
            async move {
                let result = fallback::execute(
                    &state.policy,
                    &state.active_nodes,
                    app,
                    component,
                    nodes,
                    |node| {
                        let (app, component, target, auth) =
                            (app.clone(), component.clone(), target.clone(), auth.clone());
                        async move {
                            fileops::remove_object(&node, &app, &component, &target, &auth).await
                        }
                    },
                )
                .await;
                (target, result)
            }
        });

        for (target, result) in futures::future::join_all(sessions).await {
            match result {
                Ok(success) => report.push(json!({
                    "path": target,
                    "status": "success",
                    "node": success.node.to_string(),
                })),
                Err(e) => {
                    failures += 1;
                    report.push(json!({
                        "path": target,
                        "status": "error",
                        "error": format!("Failed to delete. {}", e),
                    }));
                }
            }
        }
    }

    info!(
        "Bulk delete for {}/{}: {} ok, {} failed",
        app, component, report.len() - failures, failures
    );
    HttpResponse::Ok().json(json!({
        "status": if failures == 0 { "success" } else { "partial" },
        "failed": failures,
        "results": report,
        "completed_at": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    }))
}

// ─── WP-CLI ───

#[derive(Deserialize)]
pub struct ExecRequest {
    pub cmd: String,
    pub nodes: Option<String>,
}

/// POST /api/wp/{app}/{component}/exec — run a WP-CLI command through
/// the exec-socket on the best node
pub async fn wp_exec(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<ExecRequest>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();
    let request = body.into_inner();
    if request.cmd.trim().is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Missing command" }));
    }

    let nodes = match resolve_ordered_nodes(&state, &app, request.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let cmd = request.cmd.clone();
    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (base, app, component, cmd, auth) = (
            state.exec_socket_base.clone(), app.clone(), component.clone(), cmd.clone(), auth.clone(),
        );
        async move { wp::exec_on_node(&base, &node, &app, &component, &cmd, &auth).await }
    })
    .await;

    match result {
        Ok(success) => HttpResponse::Ok().json(json!({
            "status": "success",
            "output": success.payload,
            "node": success.node.to_string(),
            "switched": switch_note(&success),
        })),
        Err(e) => operation_failed("run command", &e),
    }
}

/// GET /api/wp/{app}/{component}/siteurl — cached WordPress site URL
pub async fn wp_site_url(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<FileQuery>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, component) = path.into_inner();

    let nodes = match resolve_ordered_nodes(&state, &app, query.nodes.as_deref()).await {
        Ok(n) => n,
        Err(resp) => return resp,
    };

    let result = fallback::execute(&state.policy, &state.active_nodes, &app, &component, &nodes, |node| {
        let (app, component, auth) = (app.clone(), component.clone(), auth.clone());
        let state = state.clone();
        async move {
            wp::site_url(&state.site_urls, &state.exec_socket_base, &node, &app, &component, &auth)
                .await
        }
    })
    .await;

    match result {
        Ok(success) => HttpResponse::Ok().json(json!({
            "status": "success",
            "siteurl": success.payload,
            "node": success.node.to_string(),
        })),
        Err(e) => operation_failed("resolve site URL", &e),
    }
}

// ─── Apps ───

#[derive(Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

/// GET /api/apps?owner= — the caller's deployed apps
pub async fn list_apps(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<OwnerQuery>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    // Default to the wallet address baked into the credential
    let owner = query.owner.clone().unwrap_or_else(|| auth.zelid.clone());

    match state.flux.apps_by_owner(&owner).await {
        Ok(apps) => HttpResponse::Ok().json(json!({ "status": "success", "data": apps })),
        Err(e) => HttpResponse::BadGateway().json(json!({ "error": e })),
    }
}

/// GET /api/apps/{app} — specification plus instance locations
pub async fn app_detail(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    if let Err(resp) = require_auth(&req) {
        return resp;
    }
    let app = path.into_inner();

    let (spec, locations) =
        tokio::join!(state.flux.app_specification(&app), state.flux.app_locations(&app));

    let spec = match spec {
        Ok(s) => s,
        Err(e) => return HttpResponse::BadGateway().json(json!({ "error": e })),
    };
    let nodes: Vec<String> = locations
        .unwrap_or_default()
        .iter()
        .map(|n| n.to_string())
        .collect();

    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "specification": spec, "nodes": nodes },
    }))
}

/// POST /api/apps/{app}/{action} — start/stop/restart passthrough
pub async fn app_lifecycle(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let auth = match require_auth(&req) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let (app, action) = path.into_inner();

    match state.flux.app_lifecycle(&app, &action, &auth).await {
        Ok(data) => {
            info!("Lifecycle {} for {}", action, app);
            HttpResponse::Ok().json(data)
        }
        Err(e) => HttpResponse::BadGateway().json(json!({ "error": e })),
    }
}

// ─── Active node ───

/// GET /api/node/{app}/{component} — the sticky node the next operation
/// will start from, if one is known
pub async fn active_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    if let Err(resp) = require_auth(&req) {
        return resp;
    }
    let (app, component) = path.into_inner();
    let node = state.active_nodes.get(&app, &component).map(|n| n.to_string());
    HttpResponse::Ok().json(json!({ "app": app, "component": component, "node": node }))
}

/// DELETE /api/node/{app}/{component} — forget the sticky node so the
/// next session starts from the freshly discovered master
pub async fn clear_active_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    if let Err(resp) = require_auth(&req) {
        return resp;
    }
    let (app, component) = path.into_inner();
    // A stale site URL usually goes hand in hand with a stale node choice
    if let Some(node) = state.active_nodes.get(&app, &component) {
        state.site_urls.invalidate(&app, &node);
    }
    state.active_nodes.clear(&app, &component);
    HttpResponse::Ok().json(json!({ "cleared": true }))
}

/// Configure all API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // Files
        .route("/api/files/{app}/{component}/list", web::get().to(list_files))
        .route("/api/files/{app}/{component}/download", web::get().to(download_file))
        .route("/api/files/{app}/{component}/save", web::put().to(save_file))
        .route("/api/files/{app}/{component}/upload", web::post().to(upload_file))
        .route("/api/files/{app}/{component}/bulk-delete", web::post().to(bulk_delete))
        .route("/api/files/{app}/{component}", web::delete().to(delete_path))
        // WP-CLI
        .route("/api/wp/{app}/{component}/exec", web::post().to(wp_exec))
        .route("/api/wp/{app}/{component}/siteurl", web::get().to(wp_site_url))
        // Apps
        .route("/api/apps", web::get().to(list_apps))
        .route("/api/apps/{app}", web::get().to(app_detail))
        .route("/api/apps/{app}/{action}", web::post().to(app_lifecycle))
        // Active node
        .route("/api/node/{app}/{component}", web::get().to(active_node))
        .route("/api/node/{app}/{component}", web::delete().to(clear_active_node));
}
