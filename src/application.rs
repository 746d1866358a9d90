//! Application entry point and builder pattern implementation.

use anyhow::{Context, Result};
use log::info;
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    config::{Config, ConfigManager},
    kernel::Kernel,
    modules::{
        daytime::{self, DaytimeModule},
        interface::InterfaceModule,
        location::{self, LocationModule},
    },
    reactor::{Reactor, TokioReactor},
};

/// Owns the kernel and drives its event loop until the daemon is told to
/// stop.
///
/// # Example
///
/// ```no_run
/// use lumind::application::Application;
/// use lumind::config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = config::ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()
///     .await?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    kernel: Kernel<TokioReactor>,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Starts every module, dispatches ready sources until SIGINT or
    /// SIGTERM, then shuts the modules down in reverse init order.
    pub async fn run(&mut self) -> Result<()> {
        self.kernel.start().context("Failed to start modules")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;

        info!("Starting main event loop");
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for shutdown signal")?;
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                (source, kind) = self.kernel.reactor_mut().next_ready() => {
                    self.kernel.dispatch(source, kind);
                }
            }
        }

        self.kernel.shutdown();
        info!("Main event loop terminated");
        Ok(())
    }
}

/// Registers the daemon's modules with `kernel`.
///
/// Location and daytime are also put in the catalog so they can be unloaded
/// and loaded back at runtime.
pub fn register_modules<R: Reactor>(kernel: &mut Kernel<R>, config: &Config) -> Result<()> {
    let daytime_fixed = config.daytime.has_fixed_events();

    kernel.register(Box::new(InterfaceModule::new(&config.interface)))?;
    kernel.register(Box::new(LocationModule::new(&config.location, daytime_fixed)))?;
    kernel.register(Box::new(DaytimeModule::new(&config.daytime)))?;

    let location_cfg = config.location.clone();
    kernel.register_optional(location::NAME, move || {
        Box::new(LocationModule::new(&location_cfg, daytime_fixed))
    });
    let daytime_cfg = config.daytime.clone();
    kernel.register_optional(daytime::NAME, move || Box::new(DaytimeModule::new(&daytime_cfg)));
    Ok(())
}

/// Builder pattern for creating Application instances.
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    pub async fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow::anyhow!("Configuration manager is required"))?;
        let config = config_manager.clone_config().await;

        let mut kernel = Kernel::new(TokioReactor::new());
        register_modules(&mut kernel, &config)?;

        Ok(Application { kernel })
    }
}
