use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use streamgate::auth::build_allowed_key_set;
use streamgate::config::{load_config, AppConfig};
use streamgate::observability::init_tracing;
use streamgate::pool::refresh::HttpTokenRefresher;
use streamgate::pool::CredentialPool;
use streamgate::routing::dispatch_request;
use streamgate::state::AppState;
use streamgate::transport::{build_http_client, UpstreamClient};

fn main() {
    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);
    let runtime = build_runtime(&config);

    runtime.block_on(async move {
        run(config).await;
    });
}

fn build_runtime(config: &AppConfig) -> tokio::runtime::Runtime {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.server.runtime_worker_threads {
        builder.worker_threads(threads);
    }
    builder.enable_io();
    builder.enable_time();
    builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

async fn run(config: AppConfig) {
    let host = config.server.host.clone();
    let port = config.server.port;

    let http_client = build_http_client(&config.server).unwrap_or_else(|e| {
        eprintln!("Failed to build HTTP client: {e}");
        std::process::exit(1);
    });
    let refresher = Arc::new(HttpTokenRefresher::new(
        http_client.clone(),
        &config.upstream,
    ));
    let pool = CredentialPool::new(config.credentials.clone(), refresher);
    let upstream = UpstreamClient::new(http_client, &config.upstream);
    let allowed_client_keys = build_allowed_key_set(&config);
    let state = Arc::new(AppState::new(config, pool, upstream, allowed_client_keys));

    tracing::info!(
        "streamgate starting on {}:{} with {} pooled credential(s)",
        host,
        port,
        state.pool.len()
    );

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to {host}:{port}: {err}");
            std::process::exit(1);
        });

    tracing::info!("streamgate is ready to accept connections");
    serve_accept_loop(listener, AutoBuilder::new(TokioExecutor::new()), state).await;
}

async fn serve_accept_loop(
    listener: tokio::net::TcpListener,
    conn_builder: AutoBuilder<TokioExecutor>,
    state: Arc<AppState>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("Accept error: {err}");
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("failed to enable TCP_NODELAY for {remote_addr}: {err}");
        }

        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let request_state = Arc::clone(&state);
        let hyper_service = service_fn(move |request: Request<Incoming>| {
            dispatch_request(Arc::clone(&request_state), request.map(Body::new))
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, hyper_service).await {
                tracing::debug!("failed to serve connection from {remote_addr}: {err:#}");
            }
        });
    }
}
