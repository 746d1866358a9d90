//! Module lifecycle manager.
//!
//! Owns every module in an arena addressed by [`ModuleId`], the dependency
//! graph, the message bus and the reactor. All callbacks run on the control
//! thread, one at a time: the module object is taken out of its slot while
//! its callback runs and put back afterwards.
//!
//! ```text
//! REGISTERED -> CHECKED -> INITIALIZING -> RUNNING -> DESTROYING -> DESTROYED
//!                  \             \
//!                   DISABLED      DISABLED          (any live state) -> POISONED
//! ```

mod context;
#[cfg(test)]
pub(crate) mod testing;

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use anyhow::Result;
use log::{debug, info, warn};

pub use context::{CheckContext, Completion, ModuleContext};
use context::{Command, Effects};

use crate::{
    bus::MessageBus,
    error::KernelError,
    graph::{DependencyGraph, DependencyKind, Readiness},
    message::{Message, Publication, Ready},
    reactor::{Reactor, SourceId, SourceKind},
};

/// Stable index of a module in the kernel arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

impl ModuleId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Registered,
    Checked,
    Disabled,
    Initializing,
    Running,
    Destroying,
    Destroyed,
    Poisoned,
}

impl ModuleState {
    pub fn is_running(self) -> bool {
        self == ModuleState::Running
    }

    /// Not RUNNING yet, but nothing has ruled it out.
    pub fn can_still_run(self) -> bool {
        matches!(
            self,
            ModuleState::Registered | ModuleState::Checked | ModuleState::Initializing
        )
    }

    pub fn has_been_checked(self) -> bool {
        self != ModuleState::Registered
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ModuleState::Disabled | ModuleState::Destroyed | ModuleState::Poisoned
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Registered => "REGISTERED",
            ModuleState::Checked => "CHECKED",
            ModuleState::Disabled => "DISABLED",
            ModuleState::Initializing => "INITIALIZING",
            ModuleState::Running => "RUNNING",
            ModuleState::Destroying => "DESTROYING",
            ModuleState::Destroyed => "DESTROYED",
            ModuleState::Poisoned => "POISONED",
        };
        f.write_str(name)
    }
}

/// A dependency declared by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub target: &'static str,
    pub kind: DependencyKind,
}

impl Dependency {
    pub const fn hard(target: &'static str) -> Self {
        Self {
            target,
            kind: DependencyKind::Hard,
        }
    }

    pub const fn soft(target: &'static str) -> Self {
        Self {
            target,
            kind: DependencyKind::Soft,
        }
    }
}

/// An independently lifecycled unit of daemon functionality.
///
/// Modules never call each other. Everything goes through bus publications,
/// wake-up sources, and in `check`, the dependency-kind mutation API.
pub trait Module {
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Cheap configuration gate, evaluated before `check`.
    fn evaluate(&self) -> bool {
        true
    }

    /// Decides whether the module can run at all. May change dependency
    /// kinds through the context.
    fn check(&mut self, _ctx: &mut CheckContext<'_>) -> bool {
        true
    }

    /// Must register a wake-up source, arm a timer, or opt out of polling.
    fn init(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()>;

    fn receive(&mut self, msg: &Message, ctx: &mut ModuleContext<'_>) -> Result<()>;

    fn destroy(&mut self, _ctx: &mut ModuleContext<'_>) {}
}

pub type ModuleFactory = Box<dyn Fn() -> Box<dyn Module>>;

struct Slot {
    name: &'static str,
    module: Option<Box<dyn Module>>,
    deps: Vec<Dependency>,
    state: ModuleState,
    sources: Vec<(SourceId, SourceKind)>,
    opted_out: bool,
    missing_hard: Option<&'static str>,
}

/// Latest slot carrying `name` that has not been destroyed.
fn find_live(slots: &[Slot], name: &str) -> Option<ModuleId> {
    slots
        .iter()
        .rposition(|s| s.name == name && s.state != ModuleState::Destroyed)
        .map(ModuleId::new)
}

pub struct Kernel<R: Reactor> {
    reactor: R,
    slots: Vec<Slot>,
    graph: DependencyGraph,
    bus: MessageBus,
    owners: HashMap<SourceId, ModuleId>,
    catalog: HashMap<&'static str, ModuleFactory>,
    init_order: Vec<ModuleId>,
    queue: VecDeque<Publication>,
    commands: VecDeque<Command>,
    draining: bool,
    started: bool,
    stopping: bool,
}

impl<R: Reactor> Kernel<R> {
    pub fn new(reactor: R) -> Self {
        Self {
            reactor,
            slots: Vec::new(),
            graph: DependencyGraph::new(),
            bus: MessageBus::new(),
            owners: HashMap::new(),
            catalog: HashMap::new(),
            init_order: Vec::new(),
            queue: VecDeque::new(),
            commands: VecDeque::new(),
            draining: false,
            started: false,
            stopping: false,
        }
    }

    pub fn reactor(&self) -> &R {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn state(&self, id: ModuleId) -> Option<ModuleState> {
        self.slots.get(id.index()).map(|s| s.state)
    }

    pub fn state_of(&self, name: &str) -> Option<ModuleState> {
        self.id_of(name).and_then(|id| self.state(id))
    }

    pub fn id_of(&self, name: &str) -> Option<ModuleId> {
        find_live(&self.slots, name)
    }

    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &'static str, ModuleState)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(idx, s)| (ModuleId::new(idx), s.name, s.state))
    }

    /// Names accepted by [`Kernel::load`], sorted.
    pub fn optional_modules(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.catalog.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Sources and timers currently registered by `id`.
    pub fn sources_of(&self, id: ModuleId) -> Vec<SourceId> {
        self.slots
            .get(id.index())
            .map(|s| s.sources.iter().map(|(source, _)| *source).collect())
            .unwrap_or_default()
    }

    /// Module currently owning `source`.
    pub fn owner_of(&self, source: SourceId) -> Option<ModuleId> {
        self.owners.get(&source).copied()
    }

    /// Adds a module. Before [`Kernel::start`] this only records it; once
    /// started, the module is linked, checked and initialized right away.
    pub fn register(&mut self, module: Box<dyn Module>) -> Result<ModuleId, KernelError> {
        let name = module.name();
        if self.is_live(name) {
            return Err(KernelError::Duplicate(name.to_string()));
        }

        let id = ModuleId::new(self.slots.len());
        self.slots.push(Slot {
            name,
            deps: module.dependencies(),
            module: Some(module),
            state: ModuleState::Registered,
            sources: Vec::new(),
            opted_out: false,
            missing_hard: None,
        });
        self.graph.add_node(id);
        debug!("registered module {name} as {id}");

        if self.started {
            if let Err(e) = self.link(id) {
                self.graph.clear(id);
                self.slots[id.index()].state = ModuleState::Disabled;
                return Err(e);
            }
            self.settle();
        }
        Ok(id)
    }

    /// Makes `name` loadable at runtime through [`Kernel::load`].
    pub fn register_optional(
        &mut self,
        name: &'static str,
        factory: impl Fn() -> Box<dyn Module> + 'static,
    ) {
        self.catalog.insert(name, Box::new(factory));
    }

    /// Links every registered module and brings up whatever can run.
    ///
    /// A HARD cycle is a configuration error: nothing is initialized.
    pub fn start(&mut self) -> Result<(), KernelError> {
        for idx in 0..self.slots.len() {
            self.link(ModuleId::new(idx))?;
        }
        self.started = true;
        info!("starting {} modules", self.slots.len());
        self.settle();
        Ok(())
    }

    /// Publishes from outside any module and delivers everything queued.
    pub fn publish(&mut self, publication: Publication) {
        self.queue.push_back(publication.with_sender(None));
        self.drain();
    }

    /// Hands a ready source to the module owning it.
    pub fn dispatch(&mut self, source: SourceId, kind: SourceKind) {
        let Some(id) = self.owner_of(source) else {
            debug!("{source} became ready but nobody owns it");
            return;
        };
        if !self.slots[id.index()].state.is_running() {
            return;
        }
        self.deliver(id, &Message::Ready(Ready { source, kind }));
        self.drain();
    }

    pub fn load(&mut self, name: &str) -> Result<ModuleId, KernelError> {
        if self.stopping {
            return Err(KernelError::LoadFailed {
                name: name.to_string(),
                reason: "daemon is shutting down".to_string(),
            });
        }
        let factory = self
            .catalog
            .get(name)
            .ok_or_else(|| KernelError::UnknownModule(name.to_string()))?;
        let module = factory();

        info!("loading module {name}");
        let id = self.register(module)?;
        if !self.started {
            return Ok(id);
        }
        match self.slots[id.index()].state {
            ModuleState::Running => Ok(id),
            other => Err(KernelError::LoadFailed {
                name: name.to_string(),
                reason: format!("module ended up {other}"),
            }),
        }
    }

    pub fn unload(&mut self, name: &str) -> Result<(), KernelError> {
        if !self.catalog.contains_key(name) {
            return Err(KernelError::UnknownModule(name.to_string()));
        }
        let id = self
            .id_of(name)
            .filter(|id| self.slots[id.index()].state.is_running())
            .ok_or_else(|| KernelError::NotRunning(name.to_string()))?;

        info!("unloading module {name}");
        self.init_order.retain(|m| *m != id);
        self.destroy(id);
        Ok(())
    }

    /// Destroys every module that got past init, most recent first.
    /// Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if !self.init_order.is_empty() {
            info!("shutting down {} modules", self.init_order.len());
        }
        self.stopping = true;
        while let Some(id) = self.init_order.pop() {
            self.destroy(id);
        }
        self.queue.clear();
    }

    fn is_live(&self, name: &str) -> bool {
        self.id_of(name)
            .is_some_and(|id| self.slots[id.index()].state != ModuleState::Disabled)
    }

    fn link(&mut self, id: ModuleId) -> Result<(), KernelError> {
        let name = self.slots[id.index()].name;
        let deps = self.slots[id.index()].deps.clone();

        for dep in deps {
            match find_live(&self.slots, dep.target) {
                Some(target) => self
                    .graph
                    .declare(id, target, dep.kind)
                    .map_err(|source| KernelError::Configuration {
                        module: name.to_string(),
                        source,
                    })?,
                None if dep.kind == DependencyKind::Hard => {
                    self.slots[id.index()]
                        .missing_hard
                        .get_or_insert(dep.target);
                }
                None => debug!("{name}: optional peer {} is not registered", dep.target),
            }
        }
        Ok(())
    }

    fn settle(&mut self) {
        let registered: Vec<ModuleId> = self
            .modules()
            .filter(|(_, _, state)| *state == ModuleState::Registered)
            .map(|(id, _, _)| id)
            .collect();
        for id in registered {
            self.check(id);
        }

        loop {
            let mut progressed = false;
            for id in self.graph.init_order() {
                if self.slots[id.index()].state != ModuleState::Checked {
                    continue;
                }
                let readiness = self.graph.resolve(id, |t| self.slots[t.index()].state);
                match readiness {
                    Readiness::Ready => self.init(id),
                    Readiness::Blocked(target) => {
                        warn!(
                            "module {} disabled: hard dependency {} is {}",
                            self.slots[id.index()].name,
                            self.slots[target.index()].name,
                            self.slots[target.index()].state
                        );
                        self.slots[id.index()].state = ModuleState::Disabled;
                    }
                    Readiness::Waiting(_) => continue,
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        for slot in self.slots.iter_mut().filter(|s| s.state == ModuleState::Checked) {
            warn!("module {} disabled: dependencies never settled", slot.name);
            slot.state = ModuleState::Disabled;
        }

        self.drain();
    }

    fn check(&mut self, id: ModuleId) {
        let slot = &mut self.slots[id.index()];
        let name = slot.name;
        if let Some(target) = slot.missing_hard {
            warn!("module {name} disabled: hard dependency {target} is not registered");
            slot.state = ModuleState::Disabled;
            return;
        }
        let Some(mut module) = slot.module.take() else {
            return;
        };

        let passed = module.evaluate() && {
            let mut ctx = CheckContext {
                me: id,
                graph: &mut self.graph,
                slots: &self.slots,
            };
            module.check(&mut ctx)
        };

        let slot = &mut self.slots[id.index()];
        slot.module = Some(module);
        if passed {
            debug!("module {name} checked");
            slot.state = ModuleState::Checked;
        } else {
            info!("module {name} disabled by its own check");
            slot.state = ModuleState::Disabled;
        }
    }

    fn init(&mut self, id: ModuleId) {
        let name = self.slots[id.index()].name;
        self.slots[id.index()].state = ModuleState::Initializing;
        self.init_order.push(id);

        let result = self.with_module(id, |module, ctx| module.init(ctx));

        let slot = &self.slots[id.index()];
        if slot.state == ModuleState::Poisoned {
            self.queue.retain(|p| p.sender() != Some(id));
            return;
        }
        let failure = match result {
            Some(Ok(())) if slot.sources.is_empty() && !slot.opted_out => {
                Some("no wake-up source registered".to_string())
            }
            Some(Ok(())) => None,
            Some(Err(e)) => Some(format!("{e:#}")),
            None => Some("module object is missing".to_string()),
        };

        match failure {
            None => {
                info!("module {name} running");
                self.slots[id.index()].state = ModuleState::Running;
            }
            Some(reason) => {
                warn!("module {name} disabled: init failed: {reason}");
                self.init_order.retain(|m| *m != id);
                self.release(id);
                self.queue.retain(|p| p.sender() != Some(id));
                self.slots[id.index()].state = ModuleState::Disabled;
            }
        }
    }

    fn destroy(&mut self, id: ModuleId) {
        let slot = &mut self.slots[id.index()];
        match slot.state {
            ModuleState::Running => slot.state = ModuleState::Destroying,
            ModuleState::Poisoned => {}
            _ => return,
        }
        debug!("destroying module {}", slot.name);

        self.with_module(id, |module, ctx| module.destroy(ctx));
        self.release(id);

        let slot = &mut self.slots[id.index()];
        if slot.state == ModuleState::Destroying {
            slot.state = ModuleState::Destroyed;
        }
        self.drain();
    }

    fn poison(&mut self, id: ModuleId) {
        let slot = &mut self.slots[id.index()];
        if slot.state.is_terminal() {
            return;
        }
        warn!("module {} poisoned itself", slot.name);
        slot.state = ModuleState::Poisoned;
        self.release(id);
    }

    /// Drops every source and subscription held by `id`.
    fn release(&mut self, id: ModuleId) {
        let sources = std::mem::take(&mut self.slots[id.index()].sources);
        for (source, _) in sources {
            self.reactor.deregister(source);
            self.owners.remove(&source);
        }
        self.bus.unsubscribe_all(id);
    }

    fn with_module<T>(
        &mut self,
        id: ModuleId,
        f: impl FnOnce(&mut dyn Module, &mut ModuleContext<'_>) -> T,
    ) -> Option<T> {
        let mut module = self.slots[id.index()].module.take()?;
        let mut ctx = ModuleContext::new(
            id,
            &mut self.reactor,
            &mut self.bus,
            &mut self.queue,
            &self.slots,
        );
        let out = f(module.as_mut(), &mut ctx);
        let effects = ctx.into_effects();

        self.slots[id.index()].module = Some(module);
        self.apply(id, effects);
        Some(out)
    }

    fn apply(&mut self, id: ModuleId, effects: Effects) {
        let slot = &mut self.slots[id.index()];
        for (source, kind) in effects.added {
            slot.sources.push((source, kind));
            self.owners.insert(source, id);
        }
        if !effects.removed.is_empty() {
            slot.sources.retain(|(s, _)| !effects.removed.contains(s));
            for source in &effects.removed {
                self.owners.remove(source);
            }
        }
        slot.opted_out |= effects.opted_out;
        self.commands.extend(effects.commands);

        if effects.poisoned {
            self.poison(id);
        }
    }

    fn deliver(&mut self, id: ModuleId, msg: &Message) {
        let name = self.slots[id.index()].name;
        match self.with_module(id, |module, ctx| module.receive(msg, ctx)) {
            Some(Ok(())) => {}
            Some(Err(e)) => match msg.topic() {
                Some(topic) => warn!("module {name} failed to handle {topic}: {e:#}"),
                None => warn!("module {name} failed to handle a ready source: {e:#}"),
            },
            None => debug!("module {name} is busy, dropping message"),
        }
    }

    /// Delivers queued publications and runs queued commands, FIFO, until
    /// both queues are empty. Re-entrant calls return immediately.
    fn drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;

        loop {
            if let Some(publication) = self.queue.pop_front() {
                let recipients = self.bus.recipients(&publication);
                let msg = Message::Published(publication);
                for id in recipients {
                    if self.slots[id.index()].state.is_running() {
                        self.deliver(id, &msg);
                    }
                }
            } else if let Some(command) = self.commands.pop_front() {
                self.run(command);
            } else {
                break;
            }
        }

        self.draining = false;
    }

    fn run(&mut self, command: Command) {
        match command {
            Command::Load { name, done } => done(self.load(&name).map(|_| ())),
            Command::Unload { name, done } => done(self.unload(&name)),
        }
    }
}
