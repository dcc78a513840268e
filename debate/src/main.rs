mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use debate_core::{load_config, logging};
use debate_sfu::{FfmpegLauncher, LogReportSink, RedisReportQueue, ReportSink, RoomRegistry, SfuConfig};

use server::DebateServer;

/// Debate SFU signaling and recording server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, env = "DEBATE_CONFIG_PATH")]
    config: Option<String>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            return Err(e.into());
        }
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Debate SFU starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Start the media engine
    let (engine, fatal) = server::start_engine(&config).await?;

    // 4. Report delivery
    let report_sink: Arc<dyn ReportSink> = if config.report.redis_url.is_empty() {
        warn!("Redis not configured, debate reports will only be logged");
        Arc::new(LogReportSink)
    } else {
        match RedisReportQueue::connect(&config.report.redis_url, &config.report.key_prefix).await {
            Ok(queue) => {
                info!(key = %queue.key(), "Report queue connected");
                Arc::new(queue)
            }
            Err(e) => {
                error!("Failed to connect report queue: {}", e);
                return Err(e.into());
            }
        }
    };

    // 5. Room registry
    let sfu_config = SfuConfig::from(&config);
    let launcher = Arc::new(FfmpegLauncher::new(sfu_config.recorder.clone()));
    let registry = RoomRegistry::new(sfu_config, engine, launcher, report_sink);
    registry.spawn_cleanup_task();

    // 6. Serve until a signal arrives or a media worker dies
    DebateServer::new(config, registry, fatal).start().await
}
