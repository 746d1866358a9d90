//! Publish/subscribe routing between modules.

use crate::{
    error::TopicError,
    kernel::ModuleId,
    message::{MessageClass, Publication},
    topic::{Topic, TopicSet},
};

/// One subscription: a module and the topics its pattern matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub module: ModuleId,
    pub topics: TopicSet,
}

/// Message bus for publish-subscribe messaging between modules.
///
/// The bus only decides *who* gets a publication; the lifecycle manager does
/// the actual delivery on the control thread. Routing rules:
///
/// - recipients come back in subscription order;
/// - a module matching through several subscriptions is listed once;
/// - a REQUEST never goes back to the module that published it.
///
/// # Example
///
/// ```
/// use lumind::bus::MessageBus;
/// use lumind::kernel::ModuleId;
/// use lumind::message::{Payload, Publication};
/// use lumind::topic::Topic;
///
/// let mut bus = MessageBus::new();
/// bus.subscribe(ModuleId::new(0), "Pct$").unwrap();
///
/// let publication = Publication::new(Topic::BlPct, Payload::Percentage(0.5));
/// assert_eq!(bus.recipients(&publication), vec![ModuleId::new(0)]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct MessageBus {
    subscriptions: Vec<Subscription>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `module` to every topic whose name matches `pattern`.
    ///
    /// The pattern is compiled once here; returns the matched topic set.
    pub fn subscribe(&mut self, module: ModuleId, pattern: &str) -> Result<TopicSet, TopicError> {
        let topics = TopicSet::from_pattern(pattern)?;
        self.subscribe_topics(module, topics);
        Ok(topics)
    }

    pub fn subscribe_topics(&mut self, module: ModuleId, topics: TopicSet) {
        self.subscriptions.push(Subscription { module, topics });
    }

    /// Drops every subscription of `module`; returns how many were removed.
    pub fn unsubscribe_all(&mut self, module: ModuleId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.module != module);
        before - self.subscriptions.len()
    }

    pub fn is_subscribed(&self, module: ModuleId, topic: Topic) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.module == module && s.topics.contains(topic))
    }

    /// Modules that should receive `publication`, in subscription order.
    pub fn recipients(&self, publication: &Publication) -> Vec<ModuleId> {
        let topic = publication.topic();
        let requester = match publication.class() {
            MessageClass::Request => publication.sender(),
            _ => None,
        };

        let mut out: Vec<ModuleId> = Vec::new();
        for sub in &self.subscriptions {
            if !sub.topics.contains(topic) || Some(sub.module) == requester {
                continue;
            }
            if !out.contains(&sub.module) {
                out.push(sub.module);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
