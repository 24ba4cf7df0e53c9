//! Transcoding orchestrator worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vtrans_media::{check_ffmpeg, FfmpegConfig, FfmpegEncoder};
use vtrans_queue::{RedisConfig, RedisEventBus, RedisJobStore, RedisLockProvider, UploadStream};
use vtrans_storage::R2Client;
use vtrans_worker::{run_upload_consumer, JobIntake, Scheduler, TranscodeConfig, TranscodeContext};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vtrans=info".parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

fn init_metrics() -> anyhow::Result<()> {
    let Ok(addr) = std::env::var("METRICS_LISTEN_ADDR") else {
        return Ok(());
    };
    let addr: SocketAddr = addr.parse().context("METRICS_LISTEN_ADDR")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus exporter")?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    // TLS to managed Redis and R2
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }
    init_metrics()?;

    info!("Starting vtrans-worker");

    let config = TranscodeConfig::from_env().context("loading transcode config")?;
    info!(
        owner = %config.owner_id,
        renditions = config.ladder.len(),
        dash = config.generate_dash_manifest,
        "Worker config loaded"
    );

    let redis = RedisConfig::from_env();
    let store = Arc::new(RedisJobStore::new(&redis).context("creating job store")?);
    let locks = Arc::new(RedisLockProvider::new(&redis).context("creating lock provider")?);
    let bus = Arc::new(RedisEventBus::new(&redis).context("creating event bus")?);
    let uploads = Arc::new(UploadStream::new(&redis).context("creating upload stream")?);

    let blobs = Arc::new(R2Client::from_env().context("creating R2 client")?);
    if let Err(e) = blobs.check_connectivity().await {
        warn!("R2 connectivity check failed: {}", e);
    }

    let ffmpeg = FfmpegConfig::from_env();
    check_ffmpeg(&ffmpeg.binary).context("checking ffmpeg")?;
    let encoder = Arc::new(FfmpegEncoder::new(ffmpeg));

    let shutdown_timeout = config.shutdown_timeout;
    let consumer_name = config.owner_id.clone();
    let intake = Arc::new(JobIntake::new(store.clone(), config.ladder.clone()));
    let ctx = Arc::new(TranscodeContext::new(config, store, locks, blobs, encoder, bus));
    let scheduler = Arc::new(Scheduler::new(ctx));

    let (stop_tx, stop_rx) = watch::channel(false);
    let consumer = tokio::spawn(run_upload_consumer(uploads, intake, consumer_name, stop_rx));
    let scheduling = tokio::spawn(scheduler.clone().run());

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    scheduler.shutdown();
    stop_tx.send_replace(true);
    if let Err(e) = scheduling.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    if let Err(e) = consumer.await {
        warn!("Upload consumer ended abnormally: {}", e);
    }

    if scheduler.drain(shutdown_timeout).await {
        info!("All in-flight jobs finished");
    } else {
        warn!("Shutdown timeout reached with jobs still running");
    }

    info!("Worker shutdown complete");
    Ok(())
}
