//! Test support: a reactor that never polls and a module that records what
//! it receives.

use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

use anyhow::Result;

use super::{Module, ModuleContext};
use crate::{
    message::{Message, Publication},
    reactor::{Reactor, Source, SourceId},
};

/// Reactor whose sources only become ready when a test dispatches them.
#[derive(Default)]
pub(crate) struct ManualReactor {
    next: u64,
    pub(crate) live: Vec<SourceId>,
    pub(crate) timers: HashMap<SourceId, Duration>,
}

impl ManualReactor {
    fn allocate(&mut self) -> SourceId {
        self.next += 1;
        SourceId::from_raw(self.next)
    }

    /// Current expiry of a timer; zero means disarmed.
    pub(crate) fn expiry(&self, timer: SourceId) -> Option<Duration> {
        self.timers.get(&timer).copied()
    }
}

impl Reactor for ManualReactor {
    fn register(&mut self, _source: Source) -> SourceId {
        let id = self.allocate();
        self.live.push(id);
        id
    }

    fn arm_timer(&mut self, after: Duration) -> SourceId {
        let id = self.allocate();
        self.timers.insert(id, after);
        id
    }

    fn rearm(&mut self, timer: SourceId, after: Duration) {
        if let Some(expiry) = self.timers.get_mut(&timer) {
            *expiry = after;
        }
    }

    fn deregister(&mut self, id: SourceId) {
        self.live.retain(|s| *s != id);
        self.timers.remove(&id);
    }
}

pub(crate) type Inbox = Rc<RefCell<Vec<Publication>>>;

/// Subscribes to `pattern` and keeps every publication it is handed.
pub(crate) struct Recorder {
    name: &'static str,
    pattern: &'static str,
    inbox: Inbox,
}

impl Recorder {
    pub(crate) fn new(name: &'static str, pattern: &'static str) -> (Self, Inbox) {
        let inbox = Inbox::default();
        (
            Self {
                name,
                pattern,
                inbox: inbox.clone(),
            },
            inbox,
        )
    }
}

impl Module for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        ctx.subscribe(self.pattern)?;
        ctx.opt_out_polling();
        Ok(())
    }

    fn receive(&mut self, msg: &Message, _ctx: &mut ModuleContext<'_>) -> Result<()> {
        if let Message::Published(p) = msg {
            self.inbox.borrow_mut().push(p.clone());
        }
        Ok(())
    }
}
