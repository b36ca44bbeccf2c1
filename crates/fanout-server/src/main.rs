use anyhow::{Context, Result};
use fanout_protocol::RouterId;
use fanout_server::config::{LogFormat, RelayConfig, StreamConfig, StreamSourceConfig};
use fanout_server::pool::Pools;
use fanout_server::relay::Relay;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = RelayConfig::load().context("loading configuration")?;
    init_tracing(config.log_format);

    tracing::info!("Starting fanout relay...");

    // The I/O pool's runtime drives everything, including this function
    let pools = Pools::new(&config.pools).context("starting thread pools")?;
    let handle = pools.io.handle().clone();
    handle.block_on(run(config, pools.clone()))
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fanout_server=info,fanout_media=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn run(config: RelayConfig, pools: Pools) -> Result<()> {
    let stats_interval = config.stats_interval_ms;
    let streams = config.streams.clone();
    let relay = Relay::builder(config).pools(pools).build().await?;

    let mut started = Vec::new();
    for stream in &streams {
        match start_stream(&relay, stream).await {
            Ok(router) => started.push((stream.name.clone(), router)),
            Err(e) => tracing::error!(stream = %stream.name, error = %e, "failed to start stream"),
        }
    }
    if streams.is_empty() {
        tracing::info!("no streams configured, waiting for host connections");
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(stats_interval.max(1)));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for ctrl-c")?;
                tracing::info!("shutting down");
                break;
            }
            _ = ticker.tick(), if stats_interval > 0 => log_stats(&relay, &started).await,
        }
    }

    relay.shutdown().await;
    Ok(())
}

async fn start_stream(relay: &Relay, stream: &StreamConfig) -> fanout_server::Result<RouterId> {
    let source = match &stream.source {
        StreamSourceConfig::Synthetic(synthetic) => relay.create_synthetic_source(synthetic.clone()).await,
        StreamSourceConfig::File { path, looping, codecs } => {
            relay.create_file_source(path, *looping, codecs.clone()).await?
        }
    };
    let router = relay.create_router().await;
    for sink in &stream.sinks {
        let sink = relay.create_file_sink(&sink.path, sink.codecs.clone()).await?;
        relay.add_subscriber(router, sink).await?;
    }
    relay.set_publisher(router, source).await?;
    tracing::info!(stream = %stream.name, router = %router, sinks = stream.sinks.len(), "stream started");
    Ok(router)
}

async fn log_stats(relay: &Relay, streams: &[(String, RouterId)]) {
    for (name, router) in streams {
        let Ok(stats) = relay.router_stats(*router).await else { continue };
        tracing::info!(
            stream = %name,
            subscribers = stats.subscribers,
            packets_in = stats.packets_in,
            relayed = stats.relayed,
            transcoded = stats.transcoded,
            codec_errors = stats.codec_errors,
            "router stats"
        );
    }
    let cpu = relay.pools().cpu.stats();
    tracing::info!(
        executed = cpu.executed,
        queued = cpu.queued,
        dropped_oldest = cpu.dropped_oldest,
        rejected = cpu.rejected,
        "cpu pool stats"
    );
}
