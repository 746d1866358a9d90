use std::fs::File;

use anyhow::{Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use lumind::{application::Application, cli::Cli, config::ConfigManager};

const DAEMON_LOG: &str = "/var/tmp/lumind.log";

fn init_log(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "lumind".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Fork before the runtime exists.
    if cli.daemonize {
        into_daemon()?;
    }
    init_log(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    })?;

    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            let config_manager = ConfigManager::load(cli.config).await?;
            if config_manager.get().await.verbose {
                log::set_max_level(LevelFilter::Debug);
            }
            info!("lumind {} starting", env!("CARGO_PKG_VERSION"));
            if let Some(path) = config_manager.path() {
                info!("Configuration: {}", path.display());
            }

            Application::builder()
                .with_config_manager(config_manager)
                .build()
                .await?
                .run()
                .await
        })
}
