// Server entrypoint: tracing, configuration, router layers and graceful shutdown.
use aigentic_server::api::errors::error_response;
use aigentic_server::build_router;
use aigentic_server::config::{load_config, Config};
use aigentic_server::shutdown::shutdown_signal;
use aigentic_server::state::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::Response;
use futures::FutureExt;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    let cors = build_cors(&config);
    let app = build_router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!(
        "aigentic API listening on http://{addr} ({} environment)",
        config.environment
    );

    let server =
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(state.shutdown_sender()));
    if let Err(err) = server.await {
        warn!("server exited with error: {err}");
    }

    Ok(())
}

/// The returned guard flushes the file writer on drop and must outlive the server.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let (writer, guard) = match config
        .observability
        .log_file
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(log_file) => {
            let path = Path::new(log_file);
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "aigentic.log".into());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if config.observability.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    guard
}

fn bind_address(config: &Config) -> String {
    let host = std::env::var("AIGENTIC_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("AIGENTIC_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn build_cors(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new();

    match config
        .cors
        .allow_origins
        .as_ref()
        .map(|value| value.iter().map(|item| item.as_str()).collect::<Vec<_>>())
    {
        Some(origins) if origins.iter().any(|value| *value == "*") => {
            cors = cors.allow_origin(Any);
        }
        Some(origins) => {
            let values = origins
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_origin(AllowOrigin::list(values));
            }
        }
        None => {
            cors = cors.allow_origin(Any);
        }
    }

    match config
        .cors
        .allow_methods
        .as_ref()
        .map(|value| value.iter().map(|item| item.as_str()).collect::<Vec<_>>())
    {
        Some(methods) if methods.iter().any(|value| *value == "*") => {
            cors = cors.allow_methods(Any);
        }
        Some(methods) => {
            let values = methods
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_methods(AllowMethods::list(values));
            }
        }
        None => {
            cors = cors.allow_methods(Any);
        }
    }

    match config
        .cors
        .allow_headers
        .as_ref()
        .map(|value| value.iter().map(|item| item.as_str()).collect::<Vec<_>>())
    {
        Some(headers) if headers.iter().any(|value| *value == "*") => {
            cors = cors.allow_headers(Any);
        }
        Some(headers) => {
            let values = headers
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_headers(AllowHeaders::list(values));
            }
        }
        None => {
            cors = cors.allow_headers(Any);
        }
    }

    // Wildcard origins cannot be combined with credentials.
    let wildcard_origin = config
        .cors
        .allow_origins
        .as_ref()
        .map_or(true, |origins| origins.iter().any(|value| value == "*"));
    if config.cors.allow_credentials.unwrap_or(false) && !wildcard_origin {
        cors = cors.allow_credentials(true);
    }

    cors
}

async fn panic_guard(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
