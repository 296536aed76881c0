use anyhow::Context;
use argh::FromArgs;
use rtsp_capture::{
    create_router, run_http_server, Config, GstVideoSource, StreamRegistry, VideoSource,
};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(FromArgs)]
/// Serve the latest frame of each configured RTSP stream over HTTP
struct Args {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "String::from(\"config.yaml\")")]
    config: String,

    /// address to bind the HTTP server to (overrides server.host)
    #[argh(option)]
    host: Option<String>,

    /// port to bind the HTTP server to (overrides server.port)
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from '{}'", args.config))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    log::info!(
        "Loaded configuration with {} RTSP streams",
        config.rtsp_streams.len()
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C / SIGTERM handler
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received shutdown signal, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    // Start one capture loop per stream
    let latency_ms = config.capture.latency_ms;
    let read_timeout = config.capture.read_timeout();
    let registry = Arc::new(StreamRegistry::build_and_start_all(
        &config,
        |_name, _url| {
            let source = GstVideoSource::new(latency_ms, read_timeout)?;
            Ok(Box::new(source) as Box<dyn VideoSource>)
        },
    ));

    let router = create_router(registry.clone(), config.capture.jpeg_quality);
    let served = run_http_server(router, &config.server.bind_addr(), shutdown_rx).await;

    // Stop readers even if the server failed to bind
    log::info!("Stopping RTSP stream readers...");
    let stopping = registry.clone();
    tokio::task::spawn_blocking(move || stopping.stop_all()).await?;

    served.map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    log::info!("All streams stopped, exiting");
    Ok(())
}
