//! Watches lock holders leaving the session bus.

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use futures::StreamExt;
use log::debug;
use tokio_util::sync::CancellationToken;
use zbus::{Connection, fdo::DBusProxy};

use super::Inbound;
use crate::{inhibit::PresenceWatch, reactor::WakeSender, task_manager::TaskManager};

const TASK: &str = "name-owner-watch";

/// Subscribes to `NameOwnerChanged` while at least one lock exists and
/// reports every name that lost its owner. Starting again replaces the
/// running subscription.
pub struct NameOwnerWatch {
    connection: Arc<OnceLock<Connection>>,
    events: WakeSender<Inbound>,
    tasks: TaskManager,
}

impl NameOwnerWatch {
    pub fn new(connection: Arc<OnceLock<Connection>>, events: WakeSender<Inbound>) -> Self {
        Self {
            connection,
            events,
            tasks: TaskManager::new(),
        }
    }
}

impl PresenceWatch for NameOwnerWatch {
    fn start(&mut self) {
        let Some(connection) = self.connection.get().cloned() else {
            debug!("not connected yet, lock holders are watched once the bus is up");
            return;
        };
        let events = self.events.clone();
        self.tasks
            .spawn_task(TASK, move |token| watch_owners(connection, events, token));
    }

    fn stop(&mut self) {
        self.tasks.cancel(TASK);
    }
}

async fn watch_owners(
    connection: Connection,
    events: WakeSender<Inbound>,
    token: CancellationToken,
) -> Result<()> {
    let proxy = DBusProxy::new(&connection).await?;
    let mut changes = proxy.receive_name_owner_changed().await?;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            signal = changes.next() => {
                let Some(signal) = signal else { break };
                let args = signal.args()?;
                if args.new_owner().is_some() {
                    continue;
                }
                let name = args.name().to_string();
                debug!("{name} left the session bus");
                if events.send(Inbound::Vanished(name)).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}
