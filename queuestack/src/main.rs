//! QueueStack - local SQS-compatible message queue server
//!
//! Serves the SQS JSON protocol from an in-memory engine: standard and FIFO
//! queues, long polling, dead-letter redrive and message move tasks.

mod config;
mod router;

use clap::Parser;
use queuestack_sqs::{SqsConfig, SqsService};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "queuestack")]
#[command(about = "Local SQS-compatible message queue server", long_about = None)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "QUEUESTACK_PORT")]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "QUEUESTACK_HOST")]
    host: Option<String>,

    /// Base URL used in queue URLs; defaults to http://localhost:<port>
    #[arg(long, env = "QUEUESTACK_ENDPOINT")]
    endpoint: Option<String>,

    /// Config file (defaults to ./queuestack.{toml,yaml,json} when present)
    #[arg(short, long, env = "QUEUESTACK_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "QUEUESTACK_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "queuestack={level},queuestack_sqs={level},tower_http=debug",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(endpoint) = args.endpoint {
        config.sqs.endpoint = endpoint;
    } else if config.sqs.endpoint == SqsConfig::default().endpoint {
        config.sqs.endpoint = format!("http://localhost:{}", config.server.port);
    }

    info!("Starting QueueStack...");
    info!(
        account = %config.sqs.account_id,
        region = %config.sqs.region,
        endpoint = %config.sqs.endpoint,
        "SQS enabled"
    );

    let sqs = Arc::new(SqsService::new(config.sqs));
    let app = router::create_router(sqs);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
