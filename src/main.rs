//! DropVault -- multipart upload coordinator service.
//!
//! SIGTERM/SIGINT handlers only stop accepting connections and wait for
//! in-flight requests, bounded by `server.shutdown_timeout`.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dropvault::auth::{JwtIdentityProvider, Principal};
use dropvault::config::{Config, LoggingConfig};
use dropvault::metadata::store::MetadataStore;
use dropvault::storage::backend::BlobStore;
use dropvault::storage::memory::MemoryBlobStore;

/// Command-line arguments for the DropVault server.
#[derive(Parser, Debug)]
#[command(
    name = "dropvault",
    version,
    about = "Multipart upload coordinator service"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "dropvault.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bearer token signed with `auth.jwt_secret`.
    Token {
        /// User id to embed in the token.
        #[arg(long)]
        user_id: String,
        /// Display name; defaults to the user id.
        #[arg(long)]
        username: Option<String>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = dropvault::config::load_config_or_default(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);
    config.upload.validate()?;

    if let Some(Command::Token { user_id, username }) = cli.command {
        let provider = JwtIdentityProvider::new(
            &config.auth.jwt_secret,
            Duration::from_secs(config.auth.token_ttl_secs),
        );
        let principal = Principal {
            username: username.unwrap_or_else(|| user_id.clone()),
            user_id,
        };
        println!("{}", provider.issue_token(&principal)?);
        return Ok(());
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        // Initialize Prometheus metrics recorder and register metric descriptions.
        dropvault::metrics::init_metrics();
        dropvault::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let metadata = build_metadata(&config).await?;
    let (blobs, local_blobs) = build_blob_store(&config).await?;
    let identity = dropvault::auth::from_config(&config.auth)?;
    if config.auth.mode == "none" {
        warn!(
            "auth.mode is 'none': every caller acts as '{}'",
            config.auth.default_owner
        );
    }

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(dropvault::AppState::new(
        config,
        metadata,
        blobs,
        local_blobs,
        identity,
    ));

    let app = dropvault::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("DropVault listening on {}", bind_addr);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();
    tokio::select! {
        result = server => result?,
        _ = drain_deadline(shutdown_timeout) => {
            warn!("In-flight requests did not finish within {:?}", shutdown_timeout);
        }
    }

    info!("DropVault shut down");

    Ok(())
}

/// Initialize the metadata store selected by `metadata.engine`.
async fn build_metadata(config: &Config) -> anyhow::Result<Arc<dyn MetadataStore>> {
    match config.metadata.engine.as_str() {
        "dynamodb" => {
            let store =
                dropvault::metadata::dynamodb::DynamoDbMetadataStore::new(&config.metadata.dynamodb)
                    .await?;
            info!(
                "DynamoDB metadata store initialized: files={} chunks={}",
                config.metadata.dynamodb.files_table, config.metadata.dynamodb.chunks_table
            );
            Ok(Arc::new(store))
        }
        "memory" => {
            warn!("In-process metadata store: records are lost on restart");
            Ok(Arc::new(dropvault::metadata::memory::MemoryMetadataStore::new()))
        }
        other => anyhow::bail!("unknown metadata.engine '{other}' (expected 'memory' or 'dynamodb')"),
    }
}

/// Initialize the blob store selected by `storage.backend`.
///
/// The in-process store is also returned separately so the router can
/// mount its `/blobs` receiver.
async fn build_blob_store(
    config: &Config,
) -> anyhow::Result<(Arc<dyn BlobStore>, Option<Arc<MemoryBlobStore>>)> {
    match config.storage.backend.as_str() {
        "aws" => {
            let aws_config = config.storage.aws.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 'aws' but storage.aws config section is missing")
            })?;
            let store = dropvault::storage::aws::S3BlobStore::new(aws_config).await?;
            info!(
                "S3 blob store initialized: bucket={} region={} prefix='{}'",
                aws_config.bucket, aws_config.region, aws_config.prefix
            );
            let blobs: Arc<dyn BlobStore> = Arc::new(store);
            Ok((blobs, None))
        }
        "memory" => {
            let memory = &config.storage.memory;
            let store = Arc::new(MemoryBlobStore::new(&memory.base_url, &memory.signing_key));
            info!("In-process blob store initialized, grants under {}", memory.base_url);
            let blobs: Arc<dyn BlobStore> = store.clone();
            Ok((blobs, Some(store)))
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected 'memory' or 'aws')"),
    }
}

/// Resolve after a shutdown signal plus `timeout`, bounding the drain.
async fn drain_deadline(timeout: Duration) {
    shutdown_signal().await;
    tokio::time::sleep(timeout).await;
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
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
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
