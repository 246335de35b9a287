//! vram-switcher - serves the model switching control API
//!
//! Loads the model catalog, optionally brings up the largest downloaded model
//! in the background and exposes the scheduler over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vram_switcher::{
    Config, build_metrics_layer_and_handle, build_metrics_router, build_scheduler,
    control_router, startup,
};

#[derive(Parser, Debug)]
#[command(name = "vram-switcher")]
#[command(about = "Admission and switching of LLM backends on a shared GPU")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json", env = "VRAM_SWITCHER_CONFIG")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "VRAM_SWITCHER_PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Do not load a default model at boot
    #[arg(long)]
    no_auto_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("vram_switcher=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting vram-switcher");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if args.no_auto_start {
        config.auto_start = false;
    }

    info!(
        models = ?config.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        port = config.port,
        auto_start = config.auto_start,
        "Configuration loaded"
    );

    let scheduler = build_scheduler(&config).context("Failed to build scheduler")?;

    if config.auto_start {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let outcome = startup::auto_start(&scheduler).await;
            info!(?outcome, "Startup policy finished");
        });
    } else {
        info!("Auto-start disabled");
    }

    let mut app = control_router(scheduler);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle("vram_switcher");
        app = app.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                warn!(error = %e, "Metrics server stopped");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
