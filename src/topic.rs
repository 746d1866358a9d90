//! Topic registry: the closed set of bus topics and their names.
//!
//! Update topics carry broadcast state and are named after the D-Bus property
//! that mirrors them. Request topics are directed commands and are all
//! prefixed with `Req`, so broad update patterns never match them.

use std::fmt;

use regex::Regex;

use crate::error::TopicError;

/// Message class a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Update,
    Request,
}

/// Every topic known to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    AmbientBr,
    BlPct,
    KbdPct,
    DisplayState,
    AcState,
    DayTime,
    InEvent,
    Sunrise,
    Sunset,
    Temp,
    Inhibited,
    Location,
    ScreenComp,

    ReqBacklight,
    ReqCapture,
    ReqLocation,
    ReqSunrise,
    ReqSunset,
    ReqSimulate,
}

impl Topic {
    pub const ALL: [Topic; 19] = [
        Topic::AmbientBr,
        Topic::BlPct,
        Topic::KbdPct,
        Topic::DisplayState,
        Topic::AcState,
        Topic::DayTime,
        Topic::InEvent,
        Topic::Sunrise,
        Topic::Sunset,
        Topic::Temp,
        Topic::Inhibited,
        Topic::Location,
        Topic::ScreenComp,
        Topic::ReqBacklight,
        Topic::ReqCapture,
        Topic::ReqLocation,
        Topic::ReqSunrise,
        Topic::ReqSunset,
        Topic::ReqSimulate,
    ];

    /// Human-readable name, used for pattern matching and property emission.
    pub const fn name(self) -> &'static str {
        match self {
            Topic::AmbientBr => "AmbientBr",
            Topic::BlPct => "BlPct",
            Topic::KbdPct => "KbdPct",
            Topic::DisplayState => "DisplayState",
            Topic::AcState => "AcState",
            Topic::DayTime => "DayTime",
            Topic::InEvent => "InEvent",
            Topic::Sunrise => "Sunrise",
            Topic::Sunset => "Sunset",
            Topic::Temp => "Temp",
            Topic::Inhibited => "Inhibited",
            Topic::Location => "Location",
            Topic::ScreenComp => "ScreenComp",
            Topic::ReqBacklight => "ReqBacklight",
            Topic::ReqCapture => "ReqCapture",
            Topic::ReqLocation => "ReqLocation",
            Topic::ReqSunrise => "ReqSunrise",
            Topic::ReqSunset => "ReqSunset",
            Topic::ReqSimulate => "ReqSimulate",
        }
    }

    pub const fn kind(self) -> TopicKind {
        match self {
            Topic::ReqBacklight
            | Topic::ReqCapture
            | Topic::ReqLocation
            | Topic::ReqSunrise
            | Topic::ReqSunset
            | Topic::ReqSimulate => TopicKind::Request,
            _ => TopicKind::Update,
        }
    }

    pub const fn is_request(self) -> bool {
        matches!(self.kind(), TopicKind::Request)
    }

    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.name() == name)
    }

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Precompiled subscription filter: a bitmask over [`Topic::ALL`].
///
/// Patterns are evaluated once, against every topic name, when the filter is
/// built. Matching a published topic is then a single bit test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TopicSet(u32);

impl TopicSet {
    pub const EMPTY: TopicSet = TopicSet(0);

    /// Compiles a regular expression over topic names.
    ///
    /// # Example
    ///
    /// ```
    /// use lumind::topic::{Topic, TopicSet};
    ///
    /// let set = TopicSet::from_pattern("^Sun(rise|set)$").unwrap();
    /// assert!(set.contains(Topic::Sunrise));
    /// assert!(!set.contains(Topic::ReqSunrise));
    /// ```
    pub fn from_pattern(pattern: &str) -> Result<Self, TopicError> {
        let re = Regex::new(pattern).map_err(|e| TopicError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Topic::ALL
            .into_iter()
            .filter(|t| re.is_match(t.name()))
            .collect())
    }

    /// Every update topic.
    pub fn updates() -> Self {
        Topic::ALL.into_iter().filter(|t| !t.is_request()).collect()
    }

    pub fn only(topic: Topic) -> Self {
        TopicSet(topic.bit())
    }

    pub fn with(self, topic: Topic) -> Self {
        TopicSet(self.0 | topic.bit())
    }

    pub const fn contains(self, topic: Topic) -> bool {
        self.0 & topic.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Topic> {
        Topic::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<Topic> for TopicSet {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        iter.into_iter().fold(TopicSet::EMPTY, TopicSet::with)
    }
}
