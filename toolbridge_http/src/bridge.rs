//! HTTP front end: fixed routes over the provider router.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::registry::ProviderRegistry;
use crate::router::{ProviderRouter, ProviderSelector, take_body_hint};
use crate::session::SessionStatus;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// Shared state for the bridge
struct BridgeState {
    router: ProviderRouter,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderQuery {
    provider: Option<String>,
}

impl ProviderQuery {
    fn selector(&self) -> ProviderSelector {
        ProviderSelector::from_hint(self.provider.as_deref())
    }
}

/// Build a CORS layer appropriate for the bind address.
///
/// - **Loopback**: only pages served from `127.0.0.1`, `localhost` or `[::1]`
///   may call the bridge.
/// - **Non-loopback**: any origin, so deployments behind a reverse proxy
///   keep working; [`start_bridge`] logs a warning.
fn build_cors_layer(bind_addr: &SocketAddr) -> CorsLayer {
    let methods = AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]);
    let headers = AllowHeaders::list([
        axum::http::header::CONTENT_TYPE,
        axum::http::header::ACCEPT,
    ]);

    let origin = if bind_addr.ip().is_loopback() {
        AllowOrigin::predicate(|origin: &HeaderValue, _req: &axum::http::request::Parts| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };
            let lower = origin_str.to_ascii_lowercase();
            lower.starts_with("http://127.0.0.1")
                || lower.starts_with("http://localhost")
                || lower.starts_with("http://[::1]")
        })
    } else {
        AllowOrigin::any()
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
}

/// Build the axum application serving `registry`.
pub fn build_app(registry: Arc<ProviderRegistry>, bind_addr: &SocketAddr) -> Router {
    let state = Arc::new(BridgeState {
        router: ProviderRouter::new(registry),
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/tools", get(list_tools))
        .route("/tools/{tool_name}", post(call_tool))
        .route("/mcp", post(handle_mcp_request))
        .layer(build_cors_layer(bind_addr))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `registry` on an already bound listener until `shutdown` resolves.
///
/// Termination of every started child is requested as soon as `shutdown`
/// resolves, before in-flight HTTP requests are drained.
pub async fn serve<F>(listener: TcpListener, registry: Arc<ProviderRegistry>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::HttpServer(format!("Failed to get local addr: {}", e)))?;
    let app = build_app(registry.clone(), &local_addr);

    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down: terminating provider processes");
            shutdown_registry.shutdown_all();
        })
        .await
        .map_err(|e| BridgeError::HttpServer(format!("Server error: {}", e)))?;

    registry.shutdown_all();
    Ok(())
}

/// Starts the HTTP bridge server and blocks until Ctrl-C or SIGTERM.
///
/// # Port Binding
///
/// If `config.bind_addr` specifies port 0, the OS assigns a free port. The
/// bound port is printed to stderr as `TOOLBRIDGE_BOUND_PORT=<port>` for test
/// harnesses.
///
/// # Example
///
/// ```rust,no_run
/// use toolbridge_http::{BridgeConfig, ProviderSpec, start_bridge};
///
/// #[tokio::main]
/// async fn main() {
///     let config = BridgeConfig {
///         providers: vec![ProviderSpec::new("xero", "xero-mcp-server")],
///         ..BridgeConfig::default()
///     };
///     if let Err(e) = start_bridge(config).await {
///         eprintln!("Bridge failed: {}", e);
///     }
/// }
/// ```
pub async fn start_bridge(config: BridgeConfig) -> Result<()> {
    info!("Starting HTTP bridge on {}", config.bind_addr);

    if !config.bind_addr.ip().is_loopback() {
        warn!(
            "HTTP bridge bound to non-loopback address {}. \
             CORS allows any origin and there is no authentication. \
             Restrict access via firewall or reverse proxy.",
            config.bind_addr
        );
    }

    let registry = Arc::new(ProviderRegistry::from_config(&config)?);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| BridgeError::HttpServer(format!("Failed to bind: {}", e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| BridgeError::HttpServer(format!("Failed to get local addr: {}", e)))?;

    info!("HTTP bridge listening on http://{}", local_addr);
    info!("Tools endpoint: http://{}/tools", local_addr);
    info!("JSON-RPC endpoint (POST): http://{}/mcp", local_addr);

    // Machine-readable, parsed by test harnesses.
    eprintln!("TOOLBRIDGE_BOUND_PORT={}", local_addr.port());

    serve(listener, registry, shutdown_signal()).await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Readiness probe.
///
/// Provider flags are captured when the probe arrives. The default provider
/// is then brought up (bounded by the init timeout); the others are started
/// in the background and never fail the probe.
async fn health_check(State(state): State<Arc<BridgeState>>) -> Response {
    let registry = state.router.registry();
    let providers: Map<String, Value> = registry
        .providers()
        .iter()
        .map(|session| (session.name().to_string(), provider_health(&session.status())))
        .collect();
    let timestamp = chrono::Utc::now().to_rfc3339();

    for session in registry.providers() {
        if session.name() == registry.default_provider() || session.is_ready() {
            continue;
        }
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.ensure_ready().await {
                debug!(provider = %session.name(), "Background provider start failed: {}", e);
            }
        });
    }

    match registry.ensure(registry.default_provider()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "default_provider": registry.default_provider(),
                "providers": providers,
                "timestamp": timestamp,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(provider = %registry.default_provider(), "Health check failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "error": e.to_string(),
                    "providers": providers,
                    "timestamp": timestamp,
                })),
            )
                .into_response()
        }
    }
}

fn provider_health(status: &SessionStatus) -> Value {
    json!({
        "running": status.running,
        "ready": status.ready,
        "state": status.state,
    })
}

/// `GET /tools?provider=<key|all>`
async fn list_tools(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<ProviderQuery>,
) -> Response {
    match state.router.list_tools(&query.selector()).await {
        Ok(response) => rpc_response(response),
        Err(e) => e.into_response(),
    }
}

/// `POST /tools/{tool_name}` with body `{"arguments": {...}, "provider"?: "<key>"}`.
async fn call_tool(
    State(state): State<Arc<BridgeState>>,
    Path(tool_name): Path<String>,
    Query(query): Query<ProviderQuery>,
    body: Bytes,
) -> Response {
    let result = async {
        let mut body = parse_body(&body)?;
        let selector = query.selector().or(take_body_hint(&mut body));
        let arguments = body
            .get_mut("arguments")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));
        state.router.call_tool(&tool_name, arguments, &selector).await
    }
    .await;

    match result {
        Ok(response) => rpc_response(response),
        Err(e) => e.into_response(),
    }
}

/// `POST /mcp`: generic JSON-RPC passthrough.
async fn handle_mcp_request(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<ProviderQuery>,
    body: Bytes,
) -> Response {
    let result = async {
        let mut message = parse_body(&body)?;
        let selector = query.selector().or(take_body_hint(&mut message));
        state.router.forward(message, selector).await
    }
    .await;

    match result {
        Ok(Some(response)) => rpc_response(response),
        // Notifications have no response.
        Ok(None) => (StatusCode::ACCEPTED, Json(json!({}))).into_response(),
        Err(e) => e.into_response(),
    }
}

fn parse_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| BridgeError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}

/// A provider's response, verbatim. A JSON-RPC error answer maps to 502.
fn rpc_response(response: Value) -> Response {
    let status = if response.get("error").is_some() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (status, Json(response)).into_response()
}
