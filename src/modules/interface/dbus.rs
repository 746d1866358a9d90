//! Session bus objects and the transport that serves them.

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use zbus::{
    Connection, connection,
    fdo::{self, RequestNameFlags, RequestNameReply},
    interface,
    message::Header,
};

use super::{
    Inbound, Services, Snapshot, Transport,
    monitor::{SCREENSAVER_NAME, watch_screensaver},
};
use crate::{
    error::KernelError, message::Coordinates, reactor::WakeSender, task_manager::TaskManager,
    topic::Topic,
};

pub const BUS_NAME: &str = "org.lumind.Lumind";
pub const OBJECT_PATH: &str = "/org/lumind/Lumind";
const SCREENSAVER_PATHS: [&str; 2] = ["/ScreenSaver", "/org/freedesktop/ScreenSaver"];

fn post(events: &WakeSender<Inbound>, item: Inbound) -> fdo::Result<()> {
    events
        .send(item)
        .map_err(|_| fdo::Error::Failed("lumind is shutting down".to_string()))
}

/// Queues a request for the control thread and waits for its answer.
async fn ask<R>(
    events: &WakeSender<Inbound>,
    make: impl FnOnce(oneshot::Sender<R>) -> Inbound,
) -> fdo::Result<R> {
    let (reply, answer) = oneshot::channel();
    post(events, make(reply))?;
    answer
        .await
        .map_err(|_| fdo::Error::Failed("request was dropped".to_string()))
}

fn checked_delta(delta: f64) -> fdo::Result<f64> {
    if delta > 0.0 && delta < 1.0 {
        Ok(delta)
    } else {
        Err(fdo::Error::InvalidArgs(format!(
            "backlight change {delta} must be between 0 and 1"
        )))
    }
}

fn load_error(e: KernelError) -> fdo::Error {
    match e {
        KernelError::UnknownModule(_) | KernelError::NotRunning(_) => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

/// `org.lumind.Lumind1`: daemon state and commands.
pub struct LumindApi {
    events: WakeSender<Inbound>,
    snapshot: watch::Receiver<Snapshot>,
}

impl LumindApi {
    pub fn new(events: WakeSender<Inbound>, snapshot: watch::Receiver<Snapshot>) -> Self {
        Self { events, snapshot }
    }

    /// Current values behind the properties.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }
}

#[interface(name = "org.lumind.Lumind1")]
impl LumindApi {
    #[zbus(property)]
    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[zbus(property)]
    fn bl_pct(&self) -> f64 {
        self.snapshot.borrow().bl_pct
    }

    #[zbus(property)]
    fn kbd_pct(&self) -> f64 {
        self.snapshot.borrow().kbd_pct
    }

    #[zbus(property)]
    fn ambient_br(&self) -> f64 {
        self.snapshot.borrow().ambient_br
    }

    #[zbus(property)]
    fn temp(&self) -> i32 {
        self.snapshot.borrow().temp
    }

    #[zbus(property)]
    fn display_state(&self) -> i32 {
        self.snapshot.borrow().display_state
    }

    #[zbus(property)]
    fn ac_state(&self) -> i32 {
        self.snapshot.borrow().ac_state
    }

    #[zbus(property)]
    fn inhibited(&self) -> bool {
        self.snapshot.borrow().inhibited
    }

    #[zbus(property)]
    fn location(&self) -> (f64, f64) {
        let loc = self.snapshot.borrow().location;
        (loc.lat, loc.lon)
    }

    #[zbus(property)]
    fn screen_comp(&self) -> f64 {
        self.snapshot.borrow().screen_comp
    }

    #[zbus(property)]
    fn day_time(&self) -> i32 {
        self.snapshot.borrow().day_time
    }

    #[zbus(property)]
    fn in_event(&self) -> bool {
        self.snapshot.borrow().in_event
    }

    #[zbus(property)]
    fn sunrise(&self) -> u64 {
        self.snapshot.borrow().sunrise
    }

    #[zbus(property)]
    fn sunset(&self) -> u64 {
        self.snapshot.borrow().sunset
    }

    fn capture(&self, reset_timer: bool, capture_only: bool) -> fdo::Result<()> {
        post(
            &self.events,
            Inbound::Capture {
                reset_timer,
                capture_only,
            },
        )
    }

    async fn inhibit(&self, inhibit: bool) -> fdo::Result<()> {
        ask(&self.events, |reply| Inbound::SelfInhibit { inhibit, reply })
            .await?
            .map_err(fdo::Error::Failed)
    }

    fn inc_bl(&self, delta: f64) -> fdo::Result<()> {
        let delta = checked_delta(delta)?;
        post(&self.events, Inbound::Nudge { delta })
    }

    fn dec_bl(&self, delta: f64) -> fdo::Result<()> {
        let delta = checked_delta(delta)?;
        post(&self.events, Inbound::Nudge { delta: -delta })
    }

    fn set_location(&self, latitude: f64, longitude: f64) -> fdo::Result<()> {
        let location = Coordinates::new(latitude, longitude);
        if !location.is_valid() {
            return Err(fdo::Error::InvalidArgs(format!(
                "location {latitude} {longitude} is out of range"
            )));
        }
        post(&self.events, Inbound::SetLocation(location))
    }

    async fn load(&self, module: String) -> fdo::Result<()> {
        ask(&self.events, |reply| Inbound::Load { name: module, reply })
            .await?
            .map_err(load_error)
    }

    async fn unload(&self, module: String) -> fdo::Result<()> {
        ask(&self.events, |reply| Inbound::Unload { name: module, reply })
            .await?
            .map_err(load_error)
    }
}

/// `org.freedesktop.ScreenSaver` inhibition contract.
#[derive(Clone)]
pub struct ScreenSaver {
    events: WakeSender<Inbound>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ScreenSaver {
    pub fn new(events: WakeSender<Inbound>, snapshot: watch::Receiver<Snapshot>) -> Self {
        Self { events, snapshot }
    }
}

fn caller(header: &Header<'_>) -> fdo::Result<String> {
    header
        .sender()
        .map(|name| name.to_string())
        .ok_or_else(|| fdo::Error::InvalidArgs("caller has no unique name".to_string()))
}

#[interface(name = "org.freedesktop.ScreenSaver")]
impl ScreenSaver {
    async fn inhibit(
        &self,
        application_name: String,
        reason_for_inhibit: String,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<u32> {
        let sender = caller(&header)?;
        ask(&self.events, |reply| Inbound::Inhibit {
            sender,
            app: application_name,
            reason: reason_for_inhibit,
            reply,
        })
        .await
    }

    async fn un_inhibit(&self, cookie: u32, #[zbus(header)] header: Header<'_>) -> fdo::Result<()> {
        let sender = caller(&header)?;
        let released = ask(&self.events, |reply| Inbound::UnInhibit {
            sender,
            cookie,
            reply,
        })
        .await?;
        if released {
            Ok(())
        } else {
            Err(fdo::Error::InvalidArgs(format!(
                "no inhibition with cookie {cookie}"
            )))
        }
    }

    fn simulate_user_activity(&self) -> fdo::Result<()> {
        post(&self.events, Inbound::Simulate)
    }

    fn get_active(&self) -> bool {
        self.snapshot.borrow().inhibited
    }
}

/// Serves the daemon objects on the session bus from a background task.
pub struct SessionBus {
    tasks: TaskManager,
    connection: Arc<OnceLock<Connection>>,
    changes: Option<mpsc::UnboundedSender<Topic>>,
}

impl SessionBus {
    /// `connection` is filled in once the names are acquired.
    pub fn new(connection: Arc<OnceLock<Connection>>) -> Self {
        Self {
            tasks: TaskManager::new(),
            connection,
            changes: None,
        }
    }
}

impl Transport for SessionBus {
    fn connect(&mut self, services: Services) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.changes = Some(tx);
        let slot = self.connection.clone();
        self.tasks
            .spawn_task("dbus", move |token| serve(services, slot, rx, token));
    }

    fn property_changed(&mut self, topic: Topic) {
        if let Some(changes) = &self.changes {
            let _ = changes.send(topic);
        }
    }

    fn disconnect(&mut self) {
        self.changes = None;
        self.tasks.cancel_all();
    }
}

async fn serve(
    services: Services,
    slot: Arc<OnceLock<Connection>>,
    mut changes: mpsc::UnboundedReceiver<Topic>,
    token: CancellationToken,
) -> Result<()> {
    let Services {
        api,
        screensaver,
        events,
    } = services;

    let (connection, owned) = match open(api, screensaver).await {
        Ok(opened) => opened,
        Err(e) => {
            let _ = events.send(Inbound::RegistrationFailed(format!("{e:#}")));
            return Err(e);
        }
    };
    let _ = slot.set(connection.clone());
    let _ = events.send(Inbound::Connected);
    info!("serving {BUS_NAME} on the session bus");

    if owned == Some(false) {
        info!("falling back to monitoring requests sent to {SCREENSAVER_NAME}");
        let monitor = watch_screensaver(events.clone(), token.child_token());
        tokio::spawn(async move {
            if let Err(e) = monitor.await {
                warn!("failed to monitor {SCREENSAVER_NAME}: {e:#}");
            }
        });
    }

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            topic = changes.recv() => {
                let Some(topic) = topic else { break };
                if let Err(e) = emit_changed(&connection, topic).await {
                    warn!("failed to emit change of {topic}: {e}");
                }
            }
        }
    }
    Ok(())
}

/// Connects and claims the names. The flag tells whether the ScreenSaver
/// name was acquired, `None` when it was not asked for.
async fn open(
    api: LumindApi,
    screensaver: Option<ScreenSaver>,
) -> Result<(Connection, Option<bool>)> {
    let mut builder = connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, api)?;
    if let Some(screensaver) = &screensaver {
        for path in SCREENSAVER_PATHS {
            builder = builder.serve_at(path, screensaver.clone())?;
        }
    }
    let connection = builder
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME}"))?;

    if screensaver.is_none() {
        return Ok((connection, None));
    }
    let flags = RequestNameFlags::ReplaceExisting | RequestNameFlags::DoNotQueue;
    let owned = match connection.request_name_with_flags(SCREENSAVER_NAME, flags).await {
        Ok(RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner) => {
            info!("serving {SCREENSAVER_NAME}");
            true
        }
        Ok(reply) => {
            warn!("{SCREENSAVER_NAME} is owned elsewhere ({reply:?})");
            false
        }
        Err(e) => {
            warn!("{SCREENSAVER_NAME} is owned elsewhere: {e}");
            false
        }
    };
    Ok((connection, Some(owned)))
}

async fn emit_changed(connection: &Connection, topic: Topic) -> zbus::Result<()> {
    let iface = connection
        .object_server()
        .interface::<_, LumindApi>(OBJECT_PATH)
        .await?;
    let emitter = iface.signal_emitter();
    let api = iface.get().await;

    match topic {
        Topic::BlPct => api.bl_pct_changed(emitter).await,
        Topic::KbdPct => api.kbd_pct_changed(emitter).await,
        Topic::AmbientBr => api.ambient_br_changed(emitter).await,
        Topic::Temp => api.temp_changed(emitter).await,
        Topic::DisplayState => api.display_state_changed(emitter).await,
        Topic::AcState => api.ac_state_changed(emitter).await,
        Topic::Inhibited => api.inhibited_changed(emitter).await,
        Topic::Location => api.location_changed(emitter).await,
        Topic::ScreenComp => api.screen_comp_changed(emitter).await,
        Topic::DayTime => api.day_time_changed(emitter).await,
        Topic::InEvent => api.in_event_changed(emitter).await,
        Topic::Sunrise => api.sunrise_changed(emitter).await,
        Topic::Sunset => api.sunset_changed(emitter).await,
        _ => Ok(()),
    }
}
