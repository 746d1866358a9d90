//! Eavesdrops on `org.freedesktop.ScreenSaver` when another client owns it.
//!
//! A second session connection turns itself into a monitor for method calls
//! addressed to the ScreenSaver name. `Inhibit` and `UnInhibit` calls seen
//! there are mirrored into the lock table, keyed by their sender.

use anyhow::{Context, Result};
use futures::StreamExt;
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use zbus::{MatchRule, MessageStream, connection, fdo::MonitoringProxy, message};

use super::Inbound;
use crate::reactor::WakeSender;

pub(super) const SCREENSAVER_NAME: &str = "org.freedesktop.ScreenSaver";

/// Maps a monitored method call to the lock operation it implies.
pub(super) fn observed_call(msg: &zbus::Message) -> Option<Inbound> {
    let header = msg.header();
    if header.message_type() != message::Type::MethodCall {
        return None;
    }
    if header.interface().map(|i| i.as_str()) != Some(SCREENSAVER_NAME) {
        return None;
    }
    let sender = header.sender()?.to_string();

    match header.member()?.as_str() {
        "Inhibit" => {
            let (app, reason) = msg.body().deserialize::<(String, String)>().ok()?;
            Some(Inbound::ObservedInhibit {
                sender,
                app,
                reason,
            })
        }
        "UnInhibit" => {
            msg.body().deserialize::<u32>().ok()?;
            Some(Inbound::ObservedUnInhibit { sender })
        }
        _ => None,
    }
}

pub(super) async fn watch_screensaver(
    events: WakeSender<Inbound>,
    token: CancellationToken,
) -> Result<()> {
    let connection = connection::Builder::session()?
        .build()
        .await
        .context("failed to open a monitoring connection")?;
    let mut stream = MessageStream::from(&connection);

    let rule = MatchRule::builder()
        .msg_type(message::Type::MethodCall)
        .destination(SCREENSAVER_NAME)?
        .build();
    MonitoringProxy::new(&connection)
        .await?
        .become_monitor(&[rule], 0)
        .await
        .context("BecomeMonitor was refused")?;
    info!("monitoring inhibition requests sent to {SCREENSAVER_NAME}");

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("unreadable monitored message: {e}");
                        continue;
                    }
                };
                let Some(item) = observed_call(&msg) else { continue };
                if events.send(item).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn call<B>(interface: &str, member: &str, body: &B) -> zbus::Message
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        zbus::Message::method_call("/ScreenSaver", member)
            .unwrap()
            .interface(interface)
            .unwrap()
            .sender(":1.42")
            .unwrap()
            .build(body)
            .unwrap()
    }

    #[test]
    fn inhibit_call_becomes_a_lock() {
        let msg = call(SCREENSAVER_NAME, "Inhibit", &("mpv", "playing video"));

        match observed_call(&msg) {
            Some(Inbound::ObservedInhibit {
                sender,
                app,
                reason,
            }) => {
                assert_eq!(sender, ":1.42");
                assert_eq!(app, "mpv");
                assert_eq!(reason, "playing video");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn uninhibit_call_releases_by_sender() {
        let msg = call(SCREENSAVER_NAME, "UnInhibit", &7u32);

        assert!(matches!(
            observed_call(&msg),
            Some(Inbound::ObservedUnInhibit { sender }) if sender == ":1.42"
        ));
    }

    #[test]
    fn unrelated_calls_are_ignored() {
        assert!(observed_call(&call(SCREENSAVER_NAME, "GetActive", &())).is_none());
        assert!(observed_call(&call("org.example.Player", "Inhibit", &("a", "b"))).is_none());
        assert!(observed_call(&call(SCREENSAVER_NAME, "Inhibit", &7u32)).is_none());
    }
}
