//! ObjectStack gateway server.
//!
//! Bootstraps the process-wide singletons (tenant pool manager, lock
//! release notifier, blob backend, maintenance sweepers) and serves the
//! health endpoints. The request routing layer mounts on top of the same
//! singletons.
//!
//! # Usage
//!
//! ```text
//! DATABASE_URL=postgresql://... STORAGE_BACKEND=s3 objectstack-server
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_LISTEN` | `0.0.0.0:5000` | Bind address |
//! | `DATABASE_URL` | local Postgres | Metadata store |
//! | `STORAGE_BACKEND` | `file` | `s3` or `file` |
//! | `TUS_LOCK_TYPE` | `postgres` | Resumable lock variant |
//! | `LOG_LEVEL` | `info` | Log level filter |
//! | `RUST_LOG` | *(unset)* | Fine-grained filter (overrides `LOG_LEVEL`) |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use objectstack_blob::{BlobStore, FsBlobStore, S3BlobStore};
use objectstack_core::{BackendKind, StorageConfig, TenantId, TusLockType};
use objectstack_db::{
    AcquireOptions, AuthScope, LockNotifier, PoolManager, StaticTenantRegistry, TenantConfig,
    TenantRegistry,
};
use objectstack_shard::{FillFirst, ShardAllocator};
use objectstack_tus::sweep_expired_locks;

/// Server version reported in health responses.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the `LOG_LEVEL` config
/// value.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// Build the blob backend from configuration.
async fn build_blob_store(config: &StorageConfig) -> Arc<dyn BlobStore> {
    match config.storage_backend {
        BackendKind::S3 => Arc::new(S3BlobStore::new(&config.s3).await),
        BackendKind::File => Arc::new(FsBlobStore::new(&config.storage_file_root)),
    }
}

/// The single-tenant registry entry derived from configuration.
fn single_tenant(config: &StorageConfig) -> TenantConfig {
    TenantConfig {
        id: TenantId::new(config.tenant_id.clone()),
        db_url: config.database.url.clone(),
        jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| "insecure-dev-secret".to_owned()),
        file_size_limit: config.upload_file_size_limit,
        max_buckets: None,
        features: serde_json::json!({}),
    }
}

async fn health_response(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (status, body) = match req.uri().path() {
        "/healthz" | "/status" => (
            StatusCode::OK,
            serde_json::json!({ "status": "ok", "version": VERSION }).to_string(),
        ),
        _ => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "statusCode": 404, "error": "NotFound", "message": "no such route" })
                .to_string(),
        ),
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = StorageConfig::from_env();
    init_tracing(&config.log_level)?;

    info!(version = VERSION, multitenant = config.is_multitenant, "starting objectstack");

    let registry = Arc::new(StaticTenantRegistry::single(single_tenant(&config)));
    let pool_manager = PoolManager::new(config.database.clone(), config.is_multitenant);
    let blob = build_blob_store(&config).await;

    // One privileged connection drives the process-wide subsystems.
    let tenant = registry.get(&TenantId::new(config.tenant_id.clone())).await?;
    let service_conn = pool_manager.acquire(
        &tenant,
        AuthScope::service(),
        true,
        AcquireOptions::default(),
    )?;

    let notifier = match LockNotifier::start(service_conn.pool().clone()).await {
        Ok(notifier) => notifier,
        Err(e) => {
            warn!(error = %e, "lock release channel unavailable, falling back to in-process dispatch");
            LockNotifier::detached()
        }
    };

    // Zombie upload locks are swept only for the conditional-put locker;
    // advisory locks die with their transaction.
    if config.tus.lock_type == TusLockType::S3 {
        let sweep_blob = Arc::clone(&blob);
        let interval = config.tus.lock_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_expired_locks(&sweep_blob).await {
                    warn!(error = %e, "upload lock sweep failed");
                }
            }
        });
    }

    // Unconfirmed shard reservations expire on a fixed cadence.
    let allocator = Arc::new(ShardAllocator::new(
        service_conn.clone(),
        Arc::new(FillFirst),
    ));
    {
        let allocator = Arc::clone(&allocator);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                match allocator.expire_leases().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "expired shard reservations"),
                    Err(e) => warn!(error = %e, "shard lease sweep failed"),
                }
            }
        });
    }

    let addr: SocketAddr = config
        .gateway_listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.gateway_listen))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, backend = ?config.storage_backend, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let result = HttpConnBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(health_response))
                        .await;
                    if let Err(e) = result {
                        warn!(%peer, error = %e, "connection error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    notifier.stop();
    pool_manager.stop().await;
    info!("shutdown complete");
    Ok(())
}
