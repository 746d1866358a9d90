//! Event loop primitive.
//!
//! The lifecycle manager only talks to the [`Reactor`] trait: register a
//! source, arm or disarm a timer, drop a source. [`TokioReactor`] is the
//! production implementation; it multiplexes registered streams with a
//! [`DelayQueue`] of monotonic timers and hands back one ready source at a time.
//!
//! Background tasks never touch module state directly. They push items
//! through a [`WakeSender`]; the owning module registers the matching
//! [`WakeReceiver::source`] and drains the queue when it is dispatched.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use futures::{Stream, StreamExt, future::poll_fn, stream};
use log::debug;
use tokio::sync::{Notify, mpsc};
use tokio_stream::StreamMap;
use tokio_util::time::{DelayQueue, delay_queue};

/// Handle of a registered source or timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Io,
    Timer,
}

/// A wake-up source: every item means "something to read".
pub type Source = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// Registration surface of the event loop.
pub trait Reactor {
    /// Registers a wake-up source.
    fn register(&mut self, source: Source) -> SourceId;

    /// Creates a monotonic timer firing once after `after`.
    ///
    /// A zero duration creates the timer disarmed.
    fn arm_timer(&mut self, after: Duration) -> SourceId;

    /// Sets a timer's expiry; zero disarms it.
    fn rearm(&mut self, timer: SourceId, after: Duration);

    fn disarm(&mut self, timer: SourceId) {
        self.rearm(timer, Duration::ZERO);
    }

    /// Drops a source or timer. Unknown ids are ignored.
    fn deregister(&mut self, id: SourceId);
}

/// Tokio-backed reactor.
#[derive(Default)]
pub struct TokioReactor {
    next_id: u64,
    streams: StreamMap<SourceId, Source>,
    timers: DelayQueue<SourceId>,
    armed: HashMap<SourceId, Option<delay_queue::Key>>,
}

impl TokioReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> SourceId {
        self.next_id += 1;
        SourceId(self.next_id)
    }

    /// Waits for the next ready source.
    ///
    /// Pends forever when nothing is registered, so it can sit in a
    /// `select!` next to the shutdown signal.
    pub async fn next_ready(&mut self) -> (SourceId, SourceKind) {
        loop {
            tokio::select! {
                Some((id, ())) = self.streams.next(), if !self.streams.is_empty() => {
                    return (id, SourceKind::Io);
                }
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)), if !self.timers.is_empty() => {
                    let id = expired.into_inner();
                    if let Some(slot) = self.armed.get_mut(&id) {
                        *slot = None;
                    }
                    return (id, SourceKind::Timer);
                }
                else => futures::future::pending::<()>().await,
            }
        }
    }

    pub fn is_timer(&self, id: SourceId) -> bool {
        self.armed.contains_key(&id)
    }
}

impl Reactor for TokioReactor {
    fn register(&mut self, source: Source) -> SourceId {
        let id = self.allocate();
        self.streams.insert(id, source);
        debug!("registered {id}");
        id
    }

    fn arm_timer(&mut self, after: Duration) -> SourceId {
        let id = self.allocate();
        self.armed.insert(id, None);
        self.rearm(id, after);
        id
    }

    fn rearm(&mut self, timer: SourceId, after: Duration) {
        let Some(slot) = self.armed.get_mut(&timer) else {
            debug!("rearm on unknown timer {timer}");
            return;
        };

        match (slot.as_ref(), after.is_zero()) {
            (Some(key), false) => self.timers.reset(key, after),
            (Some(key), true) => {
                self.timers.remove(key);
                *slot = None;
            }
            (None, false) => *slot = Some(self.timers.insert(timer, after)),
            (None, true) => {}
        }
    }

    fn deregister(&mut self, id: SourceId) {
        if let Some(slot) = self.armed.remove(&id) {
            if let Some(key) = slot {
                self.timers.remove(&key);
            }
        } else {
            self.streams.remove(&id);
        }
        debug!("deregistered {id}");
    }
}

/// Sending half of a wake channel. Cheap to clone, safe to move into tasks.
pub struct WakeSender<T> {
    tx: mpsc::UnboundedSender<T>,
    notify: Arc<Notify>,
}

impl<T> Clone for WakeSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<T> WakeSender<T> {
    /// Queues an item and wakes the owning module.
    ///
    /// Gives the item back if the receiving module is gone.
    pub fn send(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.0)?;
        self.notify.notify_one();
        Ok(())
    }
}

/// Receiving half of a wake channel, owned by a module.
pub struct WakeReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    notify: Arc<Notify>,
}

impl<T> WakeReceiver<T> {
    /// Stream to hand to [`Reactor::register`]. Bursts of sends coalesce
    /// into a single wake-up; drain everything on each dispatch.
    pub fn source(&self) -> Source {
        stream::unfold(self.notify.clone(), |notify| async move {
            notify.notified().await;
            Some(((), notify))
        })
        .boxed()
    }

    /// Takes everything queued so far.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

pub fn wake_channel<T>() -> (WakeSender<T>, WakeReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let notify = Arc::new(Notify::new());
    (
        WakeSender {
            tx,
            notify: notify.clone(),
        },
        WakeReceiver { rx, notify },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_once() {
        let mut reactor = TokioReactor::new();
        let timer = reactor.arm_timer(Duration::from_secs(3));

        let ready = timeout(Duration::from_secs(4), reactor.next_ready()).await;
        assert_eq!(ready.unwrap(), (timer, SourceKind::Timer));

        let again = timeout(Duration::from_secs(10), reactor.next_ready()).await;
        assert!(again.is_err(), "timer fired twice without re-arming");
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut reactor = TokioReactor::new();
        let timer = reactor.arm_timer(Duration::from_secs(1));
        reactor.disarm(timer);

        let ready = timeout(Duration::from_secs(5), reactor.next_ready()).await;
        assert!(ready.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearmed_timer_fires_again() {
        let mut reactor = TokioReactor::new();
        let timer = reactor.arm_timer(Duration::ZERO);
        reactor.rearm(timer, Duration::from_millis(200));

        let ready = timeout(Duration::from_secs(1), reactor.next_ready()).await;
        assert_eq!(ready.unwrap(), (timer, SourceKind::Timer));

        reactor.rearm(timer, Duration::from_millis(200));
        let ready = timeout(Duration::from_secs(1), reactor.next_ready()).await;
        assert_eq!(ready.unwrap(), (timer, SourceKind::Timer));
    }

    #[test]
    fn wake_sender_makes_source_ready() {
        let mut reactor = TokioReactor::new();
        let (tx, mut rx) = wake_channel::<u32>();
        let id = reactor.register(rx.source());

        {
            let mut next = task::spawn(reactor.next_ready());
            assert_pending!(next.poll());

            tx.send(7).unwrap();
            tx.send(8).unwrap();
            assert!(next.is_woken());
            assert_eq!(assert_ready!(next.poll()), (id, SourceKind::Io));
        }

        assert_eq!(rx.drain(), vec![7, 8]);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn deregistered_source_is_silent() {
        let mut reactor = TokioReactor::new();
        let (tx, rx) = wake_channel::<()>();
        let id = reactor.register(rx.source());
        reactor.deregister(id);

        tx.send(()).unwrap();
        let mut next = task::spawn(reactor.next_ready());
        assert_pending!(next.poll());
    }

    #[test]
    fn send_fails_once_receiver_is_dropped() {
        let (tx, rx) = wake_channel::<&str>();
        drop(rx);
        assert_eq!(tx.send("late"), Err("late"));
    }
}
