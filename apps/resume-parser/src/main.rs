mod ai;
mod config;
mod errors;
mod extraction;
mod llm_client;
mod messaging;
mod models;
mod pipeline;
mod registry;
mod resilience;
mod routes;
mod security;
mod state;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ai::LlmResumeExtractor;
use crate::config::Config;
use crate::extraction::{PdfExtract, TextExtractor};
use crate::llm_client::LlmClient;
use crate::messaging::{NatsEventPublisher, SubmissionListener};
use crate::pipeline::{Adapters, ResumePipeline};
use crate::registry::{
    DeduplicationStore, InMemoryDeduplicationStore, ProcessingRegistry, RedisDeduplicationStore,
};
use crate::resilience::CircuitBreakers;
use crate::routes::build_router;
use crate::security::{EncryptionService, StaticOrganizationDirectory};
use crate::state::AppState;
use crate::storage::S3BlobStore;

const NATS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NATS_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; fails on missing required env vars
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting resume parser v{} on node {}",
        env!("CARGO_PKG_VERSION"),
        config.processing_node
    );

    // Processing registry: Redis when configured, otherwise process-local
    let store: Arc<dyn DeduplicationStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisDeduplicationStore::connect(url)
                .await
                .context("Failed to connect the Redis dedup store")?;
            info!("Redis dedup store initialized");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set; deduplicating within this process only");
            Arc::new(InMemoryDeduplicationStore::new())
        }
    };
    let registry = ProcessingRegistry::new(store, config.registry.clone());
    let breakers = Arc::new(CircuitBreakers::new(config.breaker.clone()));

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let blobs = Arc::new(S3BlobStore::new(s3, config.s3_bucket.clone()));
    info!("S3 client initialized (bucket: {})", config.s3_bucket);

    // Initialize NATS
    let nats = tokio::time::timeout(NATS_CONNECT_TIMEOUT, async_nats::connect(&config.nats_url))
        .await
        .with_context(|| format!("Timed out connecting to NATS at {}", config.nats_url))?
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats_url))?;
    info!("Connected to NATS at {}", config.nats_url);

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone())?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let directory =
        StaticOrganizationDirectory::from_hex(&config.org_master_key, config.allowed_organizations.clone())
            .context("ORG_MASTER_KEY is invalid")?;

    let adapters = Adapters {
        blobs,
        text: TextExtractor::new(Arc::new(PdfExtract)),
        ai: Arc::new(LlmResumeExtractor::new(llm)),
        encryption: EncryptionService::new(Arc::new(directory), config.processing_node.clone()),
        publisher: Arc::new(NatsEventPublisher::new(nats.clone(), NATS_PUBLISH_TIMEOUT)),
    };
    let pipeline = Arc::new(ResumePipeline::new(
        registry.clone(),
        breakers.clone(),
        adapters,
        config.pipeline.clone(),
    ));
    pipeline.start();

    // Submission listener
    let listener = SubmissionListener::new(nats, config.listener.clone());
    let handler = pipeline.clone();
    let mut listener_task = tokio::spawn(async move { listener.run(handler).await });

    // Health server
    let app = build_router(AppState { registry, breakers }).layer(TraceLayer::new_for_http());
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let http = tokio::net::TcpListener::bind(addr).await?;
    info!("Health server listening on {addr}");
    let mut server_task = tokio::spawn(async move { axum::serve(http, app).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        result = &mut listener_task => {
            match result {
                Ok(Ok(())) => warn!("Submission listener stopped"),
                Ok(Err(e)) => error!("Submission listener failed: {e}"),
                Err(e) => error!("Submission listener task panicked: {e}"),
            }
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => warn!("Health server stopped"),
                Ok(Err(e)) => error!("Health server failed: {e}"),
                Err(e) => error!("Health server task panicked: {e}"),
            }
        }
    }

    listener_task.abort();
    server_task.abort();
    pipeline.stop().await;
    info!("Resume parser stopped");

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "resume-parser-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
