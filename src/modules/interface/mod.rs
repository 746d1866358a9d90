//! D-Bus interface module.
//!
//! Mirrors every update topic into a property snapshot, turns incoming
//! method calls into bus requests, and owns the inhibition lock table
//! behind `org.freedesktop.ScreenSaver`.
//!
//! Method calls arrive on zbus tasks and are forwarded as [`Inbound`]
//! items through a wake channel; the module handles them on the control
//! thread when its source is dispatched. Calls that need an answer carry a
//! oneshot sender.

mod dbus;
mod monitor;
mod presence;

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{oneshot, watch};

pub use dbus::{BUS_NAME, LumindApi, OBJECT_PATH, ScreenSaver, SessionBus};
pub use presence::NameOwnerWatch;

use crate::{
    config::InterfaceCfg,
    error::KernelError,
    inhibit::{LockManager, LockRef, PresenceWatch, SELF_INHIBIT_COOKIE, SELF_INHIBIT_KEY},
    kernel::{Module, ModuleContext},
    message::{
        BacklightRequest, CaptureRequest, Coordinates, InhibitChange, Message, Payload,
        Publication,
    },
    reactor::{WakeReceiver, WakeSender, wake_channel},
    topic::{Topic, TopicSet},
};

pub const NAME: &str = "interface";

/// Work handed from bus handlers to the control thread.
#[derive(Debug)]
pub enum Inbound {
    Capture {
        reset_timer: bool,
        capture_only: bool,
    },
    SelfInhibit {
        inhibit: bool,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Signed backlight change, already validated.
    Nudge {
        delta: f64,
    },
    SetLocation(Coordinates),
    Load {
        name: String,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    Unload {
        name: String,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    Inhibit {
        sender: String,
        app: String,
        reason: String,
        reply: oneshot::Sender<u32>,
    },
    UnInhibit {
        sender: String,
        cookie: u32,
        reply: oneshot::Sender<bool>,
    },
    /// `Inhibit` sent to another ScreenSaver owner, seen by the monitor.
    ObservedInhibit {
        sender: String,
        app: String,
        reason: String,
    },
    ObservedUnInhibit {
        sender: String,
    },
    Simulate,
    /// A bus name lost its owner.
    Vanished(String),
    /// The transport is on the bus and can watch lock holders.
    Connected,
    RegistrationFailed(String),
}

/// Last value seen on every update topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub bl_pct: f64,
    pub kbd_pct: f64,
    pub ambient_br: f64,
    pub temp: i32,
    pub display_state: i32,
    pub ac_state: i32,
    pub inhibited: bool,
    pub location: Coordinates,
    pub screen_comp: f64,
    pub day_time: i32,
    pub in_event: bool,
    pub sunrise: u64,
    pub sunset: u64,
}

fn store<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

impl Snapshot {
    /// Folds an update into the snapshot. Returns whether anything changed.
    pub fn apply(&mut self, publication: &Publication) -> bool {
        match (publication.topic(), publication.payload()) {
            (Topic::BlPct, Payload::Percentage(v)) => store(&mut self.bl_pct, *v),
            (Topic::KbdPct, Payload::Percentage(v)) => store(&mut self.kbd_pct, *v),
            (Topic::AmbientBr, Payload::Percentage(v)) => store(&mut self.ambient_br, *v),
            (Topic::ScreenComp, Payload::Percentage(v)) => store(&mut self.screen_comp, *v),
            (Topic::Temp, Payload::Level(v)) => store(&mut self.temp, *v),
            (Topic::DisplayState, Payload::Level(v)) => store(&mut self.display_state, *v),
            (Topic::AcState, Payload::Level(v)) => store(&mut self.ac_state, *v),
            (Topic::DayTime, Payload::Level(v)) => store(&mut self.day_time, *v),
            (Topic::InEvent, Payload::Flag(v)) => store(&mut self.in_event, *v),
            (Topic::Inhibited, Payload::Inhibit(change)) => store(&mut self.inhibited, change.new),
            (Topic::Inhibited, Payload::Flag(v)) => store(&mut self.inhibited, *v),
            (Topic::Location, Payload::Location(c)) => store(&mut self.location, *c),
            (Topic::Sunrise, Payload::Time(t)) => store(&mut self.sunrise, *t),
            (Topic::Sunset, Payload::Time(t)) => store(&mut self.sunset, *t),
            (topic, payload) => {
                debug!("ignoring {topic} update carrying {payload:?}");
                false
            }
        }
    }
}

/// Objects a transport exposes once connected.
pub struct Services {
    pub api: LumindApi,
    pub screensaver: Option<ScreenSaver>,
    /// For reporting transport failures back to the module.
    pub events: WakeSender<Inbound>,
}

/// Where the module's bus objects live.
pub trait Transport {
    /// Starts serving; failures come back as [`Inbound::RegistrationFailed`].
    fn connect(&mut self, services: Services);

    /// The property named after `topic` has a new value.
    fn property_changed(&mut self, topic: Topic);

    fn disconnect(&mut self);
}

pub struct InterfaceModule<T: Transport, W: PresenceWatch> {
    cfg: InterfaceCfg,
    transport: T,
    locks: LockManager<W>,
    events: WakeSender<Inbound>,
    inbox: WakeReceiver<Inbound>,
    snapshot: watch::Sender<Snapshot>,
}

impl InterfaceModule<SessionBus, NameOwnerWatch> {
    /// The module as the daemon runs it: served on the session bus.
    pub fn new(cfg: &InterfaceCfg) -> Self {
        let (events, inbox) = wake_channel();
        let connection = Arc::new(OnceLock::new());
        let watch = NameOwnerWatch::new(connection.clone(), events.clone());
        Self::with_parts(
            cfg.clone(),
            SessionBus::new(connection),
            watch,
            events,
            inbox,
        )
    }
}

impl<T: Transport, W: PresenceWatch> InterfaceModule<T, W> {
    pub fn with_parts(
        cfg: InterfaceCfg,
        transport: T,
        watch: W,
        events: WakeSender<Inbound>,
        inbox: WakeReceiver<Inbound>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            cfg,
            transport,
            locks: LockManager::new(watch),
            events,
            inbox,
            snapshot,
        }
    }

    fn announce(ctx: &mut ModuleContext<'_>, change: Option<InhibitChange>) {
        if let Some(change) = change {
            ctx.publish(Publication::new(Topic::Inhibited, Payload::Inhibit(change)));
        }
    }

    fn self_inhibit(&mut self, inhibit: bool, ctx: &mut ModuleContext<'_>) -> Result<(), String> {
        if self.cfg.inhibit_disabled {
            debug!("inhibition is disabled, refusing Inhibit({inhibit})");
            return Err("inhibition is disabled".to_string());
        }
        if inhibit {
            let (_, change) = self.locks.acquire(
                SELF_INHIBIT_KEY,
                Some(SELF_INHIBIT_COOKIE),
                "Lumind",
                "user requested",
            );
            Self::announce(ctx, change);
            return Ok(());
        }
        let change = self
            .locks
            .release(LockRef::Key(SELF_INHIBIT_KEY), true)
            .map_err(|e| e.to_string())?;
        Self::announce(ctx, change);
        Ok(())
    }

    fn handle(&mut self, item: Inbound, ctx: &mut ModuleContext<'_>) {
        match item {
            Inbound::Capture {
                reset_timer,
                capture_only,
            } => ctx.publish(Publication::new(
                Topic::ReqCapture,
                Payload::Capture(CaptureRequest {
                    reset_timer,
                    capture_only,
                }),
            )),
            Inbound::SelfInhibit { inhibit, reply } => {
                let _ = reply.send(self.self_inhibit(inhibit, ctx));
            }
            Inbound::Nudge { delta } => {
                let target = (self.snapshot.borrow().bl_pct + delta).clamp(0.0, 1.0);
                ctx.publish(Publication::new(
                    Topic::ReqBacklight,
                    Payload::Backlight(BacklightRequest {
                        target,
                        smooth: true,
                    }),
                ));
            }
            Inbound::SetLocation(location) => ctx.publish(Publication::new(
                Topic::ReqLocation,
                Payload::Location(location),
            )),
            Inbound::Load { name, reply } => ctx.load_module(&name, move |res| {
                let _ = reply.send(res);
            }),
            Inbound::Unload { name, reply } => ctx.unload_module(&name, move |res| {
                let _ = reply.send(res);
            }),
            Inbound::Inhibit {
                sender,
                app,
                reason,
                reply,
            } => {
                let (cookie, change) = self.locks.acquire(&sender, None, &app, &reason);
                Self::announce(ctx, change);
                let _ = reply.send(cookie);
            }
            Inbound::UnInhibit {
                sender,
                cookie,
                reply,
            } => {
                let released = match self.locks.release(
                    LockRef::KeyOrCookie {
                        key: &sender,
                        cookie,
                    },
                    false,
                ) {
                    Ok(change) => {
                        Self::announce(ctx, change);
                        true
                    }
                    Err(e) => {
                        debug!("UnInhibit from {sender}: {e}");
                        false
                    }
                };
                let _ = reply.send(released);
            }
            Inbound::ObservedInhibit {
                sender,
                app,
                reason,
            } => {
                let (_, change) = self.locks.acquire(&sender, None, &app, &reason);
                Self::announce(ctx, change);
            }
            Inbound::ObservedUnInhibit { sender } => {
                match self.locks.release(LockRef::Key(&sender), false) {
                    Ok(change) => Self::announce(ctx, change),
                    Err(e) => debug!("monitored UnInhibit from {sender}: {e}"),
                }
            }
            Inbound::Simulate => {
                ctx.publish(Publication::new(Topic::ReqSimulate, Payload::Empty))
            }
            Inbound::Vanished(name) => Self::announce(ctx, self.locks.vanished(&name)),
            Inbound::Connected => self.locks.resume_watch(),
            Inbound::RegistrationFailed(reason) => {
                warn!("bus interface unavailable: {reason}");
                ctx.poison();
            }
        }
    }
}

impl<T: Transport, W: PresenceWatch> Module for InterfaceModule<T, W> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn evaluate(&self) -> bool {
        !self.cfg.disabled
    }

    fn init(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        ctx.subscribe_topics(TopicSet::updates());
        ctx.register_source(self.inbox.source());

        let api = LumindApi::new(self.events.clone(), self.snapshot.subscribe());
        let screensaver = (!self.cfg.inhibit_disabled)
            .then(|| ScreenSaver::new(self.events.clone(), self.snapshot.subscribe()));
        self.transport.connect(Services {
            api,
            screensaver,
            events: self.events.clone(),
        });
        info!("bus interface starting");
        Ok(())
    }

    fn receive(&mut self, msg: &Message, ctx: &mut ModuleContext<'_>) -> Result<()> {
        match msg {
            Message::Ready(_) => {
                for item in self.inbox.drain() {
                    self.handle(item, ctx);
                }
            }
            Message::Published(publication) => {
                if self.snapshot.send_if_modified(|s| s.apply(publication)) {
                    self.transport.property_changed(publication.topic());
                }
            }
        }
        Ok(())
    }

    fn destroy(&mut self, _ctx: &mut ModuleContext<'_>) {
        self.transport.disconnect();
    }
}
