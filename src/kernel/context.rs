//! Handles passed to module callbacks.
//!
//! A context borrows the kernel's shared structures for the duration of one
//! callback. Changes that touch the module's own bookkeeping (sources,
//! poisoning, load requests) are recorded as [`Effects`] and applied by the
//! kernel once the callback returns.

use std::{collections::VecDeque, time::Duration};

use log::debug;

use super::{ModuleId, ModuleState, Slot, find_live};
use crate::{
    bus::MessageBus,
    error::{KernelError, TopicError},
    graph::{DependencyGraph, DependencyKind},
    message::Publication,
    reactor::{Reactor, Source, SourceId, SourceKind},
    topic::TopicSet,
};

/// Called once a queued load or unload has run.
pub type Completion = Box<dyn FnOnce(Result<(), KernelError>)>;

pub(super) enum Command {
    Load { name: String, done: Completion },
    Unload { name: String, done: Completion },
}

#[derive(Default)]
pub(super) struct Effects {
    pub(super) added: Vec<(SourceId, SourceKind)>,
    pub(super) removed: Vec<SourceId>,
    pub(super) opted_out: bool,
    pub(super) poisoned: bool,
    pub(super) commands: Vec<Command>,
}

/// Passed to [`Module::check`](super::Module::check).
///
/// Exposes the settled state of peers and the dependency-kind mutation API.
pub struct CheckContext<'a> {
    pub(super) me: ModuleId,
    pub(super) graph: &'a mut DependencyGraph,
    pub(super) slots: &'a [Slot],
}

impl CheckContext<'_> {
    pub fn id(&self) -> ModuleId {
        self.me
    }

    pub fn state_of(&self, name: &str) -> Option<ModuleState> {
        find_live(self.slots, name).map(|id| self.slots[id.index()].state)
    }

    /// Changes the kind of `module`'s existing edge to `target`.
    ///
    /// Returns false when either module is unknown, there is no such edge,
    /// or the change would close a HARD cycle.
    pub fn reclassify(&mut self, module: &str, target: &str, kind: DependencyKind) -> bool {
        let (Some(source), Some(dest)) = (find_live(self.slots, module), find_live(self.slots, target))
        else {
            return false;
        };
        let changed = self.graph.reclassify(source, dest, kind);
        if changed {
            debug!("dependency {module} -> {target} is now {kind:?}");
        }
        changed
    }

    /// Shorthand for reclassifying one of this module's own edges.
    pub fn reclassify_own(&mut self, target: &str, kind: DependencyKind) -> bool {
        let me = self.slots[self.me.index()].name;
        self.reclassify(me, target, kind)
    }
}

/// Passed to `init`, `receive` and `destroy`.
pub struct ModuleContext<'a> {
    pub(super) me: ModuleId,
    pub(super) reactor: &'a mut dyn Reactor,
    pub(super) bus: &'a mut MessageBus,
    pub(super) queue: &'a mut VecDeque<Publication>,
    pub(super) slots: &'a [Slot],
    pub(super) effects: Effects,
}

impl<'a> ModuleContext<'a> {
    pub(super) fn new(
        me: ModuleId,
        reactor: &'a mut dyn Reactor,
        bus: &'a mut MessageBus,
        queue: &'a mut VecDeque<Publication>,
        slots: &'a [Slot],
    ) -> Self {
        Self {
            me,
            reactor,
            bus,
            queue,
            slots,
            effects: Effects::default(),
        }
    }

    pub(super) fn into_effects(self) -> Effects {
        self.effects
    }

    pub fn id(&self) -> ModuleId {
        self.me
    }

    pub fn name(&self) -> &'static str {
        self.slots[self.me.index()].name
    }

    /// Subscribes to every topic whose name matches `pattern`.
    pub fn subscribe(&mut self, pattern: &str) -> Result<TopicSet, TopicError> {
        self.bus.subscribe(self.me, pattern)
    }

    pub fn subscribe_topics(&mut self, topics: TopicSet) {
        self.bus.subscribe_topics(self.me, topics);
    }

    /// Queues a publication; it is delivered before the outermost publish
    /// or dispatch returns.
    pub fn publish(&mut self, publication: Publication) {
        self.queue
            .push_back(publication.with_sender(Some(self.me)));
    }

    /// Registers a wake-up source owned by this module.
    pub fn register_source(&mut self, source: Source) -> SourceId {
        let id = self.reactor.register(source);
        self.effects.added.push((id, SourceKind::Io));
        id
    }

    /// Creates a timer owned by this module; zero creates it disarmed.
    pub fn arm_timer(&mut self, after: Duration) -> SourceId {
        let id = self.reactor.arm_timer(after);
        self.effects.added.push((id, SourceKind::Timer));
        id
    }

    /// Sets the expiry of one of this module's timers; zero disarms it.
    pub fn rearm(&mut self, timer: SourceId, after: Duration) {
        match self.owned(timer) {
            Some(SourceKind::Timer) => self.reactor.rearm(timer, after),
            _ => debug!("{} tried to rearm {timer} which it does not own", self.name()),
        }
    }

    pub fn disarm(&mut self, timer: SourceId) {
        self.rearm(timer, Duration::ZERO);
    }

    pub fn deregister(&mut self, id: SourceId) {
        if self.owned(id).is_none() {
            debug!("{} tried to drop {id} which it does not own", self.name());
            return;
        }
        self.reactor.deregister(id);
        self.effects.added.retain(|(s, _)| *s != id);
        self.effects.removed.push(id);
    }

    /// Declares that this module runs without any wake-up source.
    pub fn opt_out_polling(&mut self) {
        self.effects.opted_out = true;
    }

    /// Demotes this module to POISONED once the callback returns.
    pub fn poison(&mut self) {
        self.effects.poisoned = true;
    }

    pub fn state_of(&self, name: &str) -> Option<ModuleState> {
        find_live(self.slots, name).map(|id| self.slots[id.index()].state)
    }

    /// Asks the kernel to load an optional module once this callback returns.
    pub fn load_module(&mut self, name: &str, done: impl FnOnce(Result<(), KernelError>) + 'static) {
        self.effects.commands.push(Command::Load {
            name: name.to_string(),
            done: Box::new(done),
        });
    }

    pub fn unload_module(&mut self, name: &str, done: impl FnOnce(Result<(), KernelError>) + 'static) {
        self.effects.commands.push(Command::Unload {
            name: name.to_string(),
            done: Box::new(done),
        });
    }

    fn owned(&self, id: SourceId) -> Option<SourceKind> {
        if self.effects.removed.contains(&id) {
            return None;
        }
        self.slots[self.me.index()]
            .sources
            .iter()
            .chain(self.effects.added.iter())
            .find(|(s, _)| *s == id)
            .map(|(_, kind)| *kind)
    }
}
