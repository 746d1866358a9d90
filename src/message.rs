//! Bus messages.
//!
//! A [`Message`] is either a publication routed through the bus (update or
//! request) or a lifecycle notification produced by the event loop when one of
//! the module's sources becomes ready. Messages are plain values: every
//! subscriber gets its own clone and payload strings are owned.

use crate::{
    kernel::ModuleId,
    reactor::{SourceId, SourceKind},
    topic::{Topic, TopicKind},
};

/// Class of a message, as seen by a receive handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Update,
    Request,
    Lifecycle,
}

/// Geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Inhibition state transition announced by the lock manager.
#[derive(Debug, Clone, PartialEq)]
pub struct InhibitChange {
    pub old: bool,
    pub new: bool,
    pub force: bool,
    pub app: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacklightRequest {
    /// Target level in `[0, 1]`.
    pub target: f64,
    pub smooth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub reset_timer: bool,
    pub capture_only: bool,
}

/// Topic-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Percentage(f64),
    Level(i32),
    Flag(bool),
    /// Unix timestamp in seconds.
    Time(u64),
    Location(Coordinates),
    Inhibit(InhibitChange),
    Backlight(BacklightRequest),
    Capture(CaptureRequest),
    /// Daily event time as `HH:MM`.
    Event(String),
}

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    topic: Topic,
    payload: Payload,
    sender: Option<ModuleId>,
}

impl Publication {
    /// Builds a publication; its class follows from the topic.
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self {
            topic,
            payload,
            sender: None,
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn class(&self) -> MessageClass {
        match self.topic.kind() {
            TopicKind::Update => MessageClass::Update,
            TopicKind::Request => MessageClass::Request,
        }
    }

    /// Module that published this message, if it came from a module.
    pub fn sender(&self) -> Option<ModuleId> {
        self.sender
    }

    pub(crate) fn with_sender(mut self, sender: Option<ModuleId>) -> Self {
        self.sender = sender;
        self
    }
}

/// Readiness notification for one of the module's sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub source: SourceId,
    pub kind: SourceKind,
}

/// What a receive handler is handed.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ready(Ready),
    Published(Publication),
}

impl Message {
    pub fn class(&self) -> MessageClass {
        match self {
            Message::Ready(_) => MessageClass::Lifecycle,
            Message::Published(p) => p.class(),
        }
    }

    pub fn topic(&self) -> Option<Topic> {
        match self {
            Message::Ready(_) => None,
            Message::Published(p) => Some(p.topic()),
        }
    }
}
