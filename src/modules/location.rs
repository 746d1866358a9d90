//! Location module.
//!
//! Publishes the user's position. A configured position is published once.
//! A `ReqLocation` without coordinates is a query, answered with the current
//! position. Otherwise the module waits for a location request (from the bus
//! interface or a geolocation provider); if none arrives before the fallback
//! timer fires, the last position saved in the cache file is used. The
//! latest position is written back to the cache on shutdown.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::{daytime, interface};
use crate::{
    config::LocationCfg,
    graph::DependencyKind,
    kernel::{CheckContext, Dependency, Module, ModuleContext},
    message::{Coordinates, Message, Payload, Publication},
    reactor::SourceId,
    topic::{Topic, TopicSet},
};

pub const NAME: &str = "location";

/// Reads a cache file holding `latitude longitude`.
pub fn read_cache(path: &Path) -> Result<Coordinates> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read location cache {}", path.display()))?;
    let mut fields = content.split_whitespace().map(str::parse::<f64>);
    let (Some(Ok(lat)), Some(Ok(lon))) = (fields.next(), fields.next()) else {
        anyhow::bail!("Malformed location cache {}", path.display());
    };
    let location = Coordinates::new(lat, lon);
    if !location.is_valid() {
        anyhow::bail!("Location cache {} is out of range", path.display());
    }
    Ok(location)
}

pub fn write_cache(path: &Path, location: Coordinates) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    fs::write(path, format!("{:.6} {:.6}\n", location.lat, location.lon))
        .with_context(|| format!("Failed to write location cache {}", path.display()))
}

pub struct LocationModule {
    cfg: LocationCfg,
    cache: Option<PathBuf>,
    daytime_fixed: bool,
    current: Option<Coordinates>,
    fallback: Option<SourceId>,
}

impl LocationModule {
    /// `daytime_fixed` tells whether the daytime module has both of its
    /// events configured and so can do without a position.
    pub fn new(cfg: &LocationCfg, daytime_fixed: bool) -> Self {
        Self {
            cache: cfg.cache_path(),
            cfg: cfg.clone(),
            daytime_fixed,
            current: None,
            fallback: None,
        }
    }

    /// Answers a query with the current position, even if unchanged.
    fn announce(&self, ctx: &mut ModuleContext<'_>) {
        match self.current {
            Some(location) => {
                ctx.publish(Publication::new(Topic::Location, Payload::Location(location)))
            }
            None => debug!("location queried before one is known"),
        }
    }

    fn update(&mut self, location: Coordinates, ctx: &mut ModuleContext<'_>) {
        if self.current == Some(location) {
            return;
        }
        info!("location is now {:.2} {:.2}", location.lat, location.lon);
        self.current = Some(location);
        ctx.publish(Publication::new(Topic::Location, Payload::Location(location)));
    }
}

impl Module for LocationModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::soft(interface::NAME)]
    }

    fn evaluate(&self) -> bool {
        !self.cfg.disabled
    }

    fn check(&mut self, ctx: &mut CheckContext<'_>) -> bool {
        if self.daytime_fixed && self.cfg.fixed().is_none() {
            ctx.reclassify(daytime::NAME, NAME, DependencyKind::Soft);
            info!("daytime events are fixed, location is not needed");
            return false;
        }
        true
    }

    fn init(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        ctx.subscribe_topics(TopicSet::only(Topic::ReqLocation));
        if let Some(location) = self.cfg.fixed() {
            self.update(location, ctx);
            ctx.opt_out_polling();
            return Ok(());
        }

        let timeout = Duration::from_secs(self.cfg.fallback_timeout_secs.max(1));
        self.fallback = Some(ctx.arm_timer(timeout));
        Ok(())
    }

    fn receive(&mut self, msg: &Message, ctx: &mut ModuleContext<'_>) -> Result<()> {
        match msg {
            Message::Ready(_) => {
                if self.current.is_some() {
                    return Ok(());
                }
                let Some(path) = &self.cache else {
                    debug!("no cache location available");
                    return Ok(());
                };
                let location = read_cache(path)?;
                info!("location loaded from {}", path.display());
                self.update(location, ctx);
            }
            Message::Published(p) => {
                let location = match p.payload() {
                    Payload::Location(location) => location,
                    Payload::Empty => {
                        self.announce(ctx);
                        return Ok(());
                    }
                    _ => anyhow::bail!("location request without coordinates"),
                };
                if self.cfg.fixed().is_some() {
                    debug!("location is fixed by configuration, ignoring request");
                    return Ok(());
                }
                if !location.is_valid() {
                    anyhow::bail!("location {:.2} {:.2} is out of range", location.lat, location.lon);
                }
                if let Some(timer) = self.fallback {
                    ctx.disarm(timer);
                }
                self.update(*location, ctx);
            }
        }
        Ok(())
    }

    fn destroy(&mut self, _ctx: &mut ModuleContext<'_>) {
        if self.cfg.fixed().is_some() {
            return;
        }
        let (Some(path), Some(location)) = (&self.cache, self.current) else {
            return;
        };
        match write_cache(path, location) {
            Ok(()) => debug!("latest location stored in {}", path.display()),
            Err(e) => warn!("{e:#}"),
        }
    }
}
