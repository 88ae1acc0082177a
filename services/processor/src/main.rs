use anyhow::{Context, Result};
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_processor::alert::{Notifier, SnsNotifier};
use vigil_processor::config::{DecoderKind, SamplingConfig};
use vigil_processor::s3_store::load_sdk_config;
use vigil_processor::sampler::ffmpeg::FfmpegDecoder;
use vigil_processor::trigger::resolve_source;
use vigil_processor::{Config, DecoderFactory, HttpClassifier, JobRunner, PipelineContext, S3Store};

/// Usage: `vigil-processor [TRIGGER_FILE | -]`
///
/// The trigger document is read from the given file, or stdin for `-`. With no
/// argument the source comes from `trigger.container` / `trigger.key`.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        "Starting Vigil processor"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let document = read_trigger(std::env::args().nth(1).as_deref())?;
    let source = resolve_source(document.as_deref(), &config.trigger)
        .context("Failed to resolve source video")?;

    // Clients are built once and shared by the job
    let sdk_config = load_sdk_config(&config.storage).await;
    let store = Arc::new(S3Store::new(&sdk_config, &config.storage));
    let classifier = Arc::new(
        HttpClassifier::new(&config.classifier).context("Failed to initialize classifier client")?,
    );
    let notifier: Option<Arc<dyn Notifier>> = match config.notification.topic_arn {
        Some(_) => Some(Arc::new(SnsNotifier::new(&sdk_config))),
        None => {
            warn!("No notification topic configured, alerts disabled");
            None
        }
    };
    let decoder = resolve_decoder(&config.sampling)
        .await
        .context("Failed to initialize video decoder")?;

    let ctx = PipelineContext {
        store,
        classifier,
        notifier,
        decoder,
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let runner = JobRunner::new(ctx, Arc::new(config)).with_cancellation(cancel);
    let result = runner.run(source).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to encode job result")?
    );

    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(job_id = %result.job_id, "Job did not complete");
        Ok(ExitCode::FAILURE)
    }
}

fn read_trigger(arg: Option<&str>) -> Result<Option<String>> {
    match arg {
        None => Ok(None),
        Some("-") => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read trigger from stdin")?;
            Ok(Some(buf))
        }
        Some(path) => std::fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("Failed to read trigger file {}", path)),
    }
}

async fn resolve_decoder(config: &SamplingConfig) -> Result<Arc<dyn DecoderFactory>> {
    match config.decoder {
        DecoderKind::Ffmpeg => {
            let decoder =
                FfmpegDecoder::resolve(config.ffmpeg_bin.clone(), config.ffprobe_bin.clone()).await?;
            Ok(Arc::new(decoder))
        }
        #[cfg(feature = "gstreamer")]
        DecoderKind::Gstreamer => Ok(Arc::new(vigil_processor::sampler::gst::GstDecoder::resolve()?)),
        #[cfg(not(feature = "gstreamer"))]
        DecoderKind::Gstreamer => anyhow::bail!("built without the gstreamer feature"),
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // stdout carries the job result
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, cancelling job");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, cancelling job");
        }
    }
}
