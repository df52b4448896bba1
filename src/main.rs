//! Capacitor — dashboard backend for FluxCloud applications
//!
//! Serves the dashboard web UI and a REST API that:
//! - Lists a wallet owner's deployed apps via the FluxOS public API
//! - Browses, edits, uploads and deletes files on an app's storage volume
//! - Runs WP-CLI commands against a WordPress-based app
//!
//! Every multi-node operation picks its target through master discovery
//! (FDM, HAProxy), master-first ordering and a retrying fallback executor.

mod api;
mod auth;
mod discovery;
mod fallback;
mod fileops;
mod flux;
mod nodes;
mod wp;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use std::time::Duration;
use tracing::info;

/// Capacitor — FluxCloud application dashboard
#[derive(Parser)]
#[command(name = "capacitor", version, about = "Dashboard backend for FluxCloud applications")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3080)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// FluxOS public API base URL
    #[arg(long, default_value = flux::DEFAULT_API_BASE)]
    flux_api: String,

    /// Base URL of the exec-socket command service
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    exec_socket: String,

    /// TLS certificate path (PEM)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long)]
    tls_key: Option<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("capacitor=info".parse().unwrap())
                .add_directive("actix_web=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    info!("");
    info!("  ⚡ Capacitor v{}", env!("CARGO_PKG_VERSION"));
    info!("  ──────────────────────────────────");
    info!("  FluxOS API:  {}", cli.flux_api);
    info!("  exec-socket: {}", cli.exec_socket);
    info!("  Dashboard:   http://{}:{}", cli.bind, cli.port);

    // One shared client for oracle calls; per-attempt timeouts are set
    // at each request
    let oracle_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let app_state = web::Data::new(api::AppState {
        policy: fallback::RetryPolicy::default(),
        active_nodes: fallback::ActiveNodeCache::new(),
        site_urls: wp::SiteUrlCache::new(),
        flux: flux::FluxClient::new(&cli.flux_api),
        oracle_client,
        exec_socket_base: cli.exec_socket.clone(),
    });

    // Determine web directory
    let web_dir = find_web_dir();
    info!("  Serving web UI from: {}", web_dir);
    info!("");

    // Try to load TLS config using OpenSSL — fall back to HTTP if anything goes wrong
    let ssl_builder = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

            let builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
                .map_err(|e| {
                    tracing::warn!("Failed to create SSL acceptor: {} — falling back to HTTP", e)
                })
                .ok()
                .and_then(|mut b| {
                    if let Err(e) = b.set_certificate_chain_file(cert_path) {
                        tracing::warn!("Cannot load TLS cert '{}': {} — falling back to HTTP", cert_path, e);
                        return None;
                    }
                    if let Err(e) = b.set_private_key_file(key_path, SslFiletype::PEM) {
                        tracing::warn!("Cannot load TLS key '{}': {} — falling back to HTTP", key_path, e);
                        return None;
                    }
                    Some(b)
                });
            builder
        }
        _ => None,
    };

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(api::configure)
            .service(actix_files::Files::new("/", &web_dir).index_file("index.html"))
    });

    if let Some(ssl_builder) = ssl_builder {
        let bind = format!("{}:{}", cli.bind, cli.port);
        info!("  🔒 TLS enabled — https://{}", bind);
        server.bind_openssl(&bind, ssl_builder)?.run().await
    } else {
        server.bind(format!("{}:{}", cli.bind, cli.port))?.run().await
    }
}

/// Find the web directory — check multiple locations
fn find_web_dir() -> String {
    let candidates = [
        // Development
        "web",
        // Installed
        "/opt/capacitor/web",
        "/usr/share/capacitor/web",
    ];

    for dir in &candidates {
        let path = std::path::Path::new(dir);
        if path.exists() && path.join("index.html").exists() {
            return dir.to_string();
        }
    }

    // Fallback
    "web".to_string()
}
