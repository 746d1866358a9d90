//! Daytime module.
//!
//! Works out today's sunrise and sunset, either from the configured `HH:MM`
//! events or from the current location, and publishes whether it is day,
//! night, or inside the window around one of the two events. Its timer is
//! re-armed for the next boundary every time it fires.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use log::{debug, info};

use super::location;
use crate::{
    config::{DaytimeCfg, parse_event_time},
    graph::DependencyKind,
    kernel::{CheckContext, Dependency, Module, ModuleContext},
    message::{Coordinates, Message, Payload, Publication},
    reactor::SourceId,
    topic::{Topic, TopicSet},
};

pub const NAME: &str = "daytime";

const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const J2000: f64 = 2_451_545.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayTime {
    Day = 0,
    Night = 1,
}

/// Sunrise and sunset in UTC for the local solar day of `date`.
///
/// Uses the sunrise equation with the standard -0.833° horizon. Returns
/// `None` during polar day or polar night.
pub fn sun_events(date: NaiveDate, at: Coordinates) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp() as f64;
    let julian_day = midnight / 86_400.0 + UNIX_EPOCH_JD;
    let n = (julian_day - J2000 + 0.0008).ceil();

    let mean_noon = n - at.lon / 360.0;
    let anomaly = (357.5291 + 0.985_600_28 * mean_noon).rem_euclid(360.0).to_radians();
    let center = 1.9148 * anomaly.sin() + 0.0200 * (2.0 * anomaly).sin() + 0.0003 * (3.0 * anomaly).sin();
    let longitude = (anomaly.to_degrees() + center + 180.0 + 102.9372)
        .rem_euclid(360.0)
        .to_radians();
    let transit = J2000 + mean_noon + 0.0053 * anomaly.sin() - 0.0069 * (2.0 * longitude).sin();

    let sin_decl = longitude.sin() * 23.4397_f64.to_radians().sin();
    let cos_decl = (1.0 - sin_decl * sin_decl).sqrt();
    let lat = at.lat.to_radians();
    let cos_hour = ((-0.833_f64).to_radians().sin() - lat.sin() * sin_decl) / (lat.cos() * cos_decl);
    if !(-1.0..=1.0).contains(&cos_hour) {
        return None;
    }
    let half_day = cos_hour.acos().to_degrees() / 360.0;

    let to_utc = |jd: f64| DateTime::from_timestamp(((jd - UNIX_EPOCH_JD) * 86_400.0).round() as i64, 0);
    Some((to_utc(transit - half_day)?, to_utc(transit + half_day)?))
}

/// Sunrise and sunset for `date`: configured times win over computed ones.
pub fn events_on(
    date: NaiveDate,
    tz: FixedOffset,
    location: Option<Coordinates>,
    sunrise: Option<NaiveTime>,
    sunset: Option<NaiveTime>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let computed = location.and_then(|at| sun_events(date, at));
    let fixed = |time: NaiveTime| {
        tz.from_local_datetime(&date.and_time(time))
            .single()
            .map(|t| t.with_timezone(&Utc))
    };
    let rise = match sunrise {
        Some(time) => fixed(time)?,
        None => computed?.0,
    };
    let set = match sunset {
        Some(time) => fixed(time)?,
        None => computed?.1,
    };
    Some((rise, set))
}

/// Where `now` falls relative to the day's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub sunrise: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
    pub day_time: DayTime,
    pub in_event: bool,
    /// Next instant at which any of the above changes.
    pub next: DateTime<Utc>,
}

/// Once the window after today's sunset is over, tomorrow's events apply.
pub fn schedule(
    now: DateTime<FixedOffset>,
    window: TimeDelta,
    events: impl Fn(NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Option<Schedule> {
    let now_utc = now.with_timezone(&Utc);
    let half = window / 2;
    let today = now.date_naive();

    let (mut sunrise, mut sunset) = events(today)?;
    if now_utc >= sunset + half {
        (sunrise, sunset) = events(today.succ_opt()?)?;
    }

    let day_time = if sunrise <= now_utc && now_utc < sunset {
        DayTime::Day
    } else {
        DayTime::Night
    };
    let in_event = (now_utc - sunrise).abs() <= half || (now_utc - sunset).abs() <= half;
    let next = [
        sunrise - half,
        sunrise,
        sunrise + half,
        sunset - half,
        sunset,
        sunset + half,
    ]
    .into_iter()
    .filter(|boundary| *boundary > now_utc)
    .min()
    .unwrap_or(now_utc + TimeDelta::hours(1));

    Some(Schedule {
        sunrise,
        sunset,
        day_time,
        in_event,
        next,
    })
}

fn timestamp(t: DateTime<Utc>) -> u64 {
    u64::try_from(t.timestamp()).unwrap_or(0)
}

/// Source of the current wall-clock time.
pub trait Clock {
    fn now(&self) -> DateTime<FixedOffset>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

pub struct DaytimeModule<C: Clock> {
    cfg: DaytimeCfg,
    clock: C,
    sunrise: Option<NaiveTime>,
    sunset: Option<NaiveTime>,
    location: Option<Coordinates>,
    timer: Option<SourceId>,
    last: Option<Schedule>,
}

impl DaytimeModule<SystemClock> {
    pub fn new(cfg: &DaytimeCfg) -> Self {
        Self::with_clock(cfg, SystemClock)
    }
}

impl<C: Clock> DaytimeModule<C> {
    pub fn with_clock(cfg: &DaytimeCfg, clock: C) -> Self {
        Self {
            sunrise: cfg.sunrise.as_deref().and_then(parse_event_time),
            sunset: cfg.sunset.as_deref().and_then(parse_event_time),
            cfg: cfg.clone(),
            clock,
            location: None,
            timer: None,
            last: None,
        }
    }

    fn window(&self) -> TimeDelta {
        TimeDelta::seconds(self.cfg.event_duration_secs.min(12 * 3600) as i64)
    }

    fn needs_location(&self) -> bool {
        self.sunrise.is_none() || self.sunset.is_none()
    }

    /// Recomputes the schedule, publishes what changed and re-arms the timer.
    fn refresh(&mut self, ctx: &mut ModuleContext<'_>) {
        let now = self.clock.now();
        let tz = *now.offset();
        let (location, sunrise, sunset) = (self.location, self.sunrise, self.sunset);
        let computed = schedule(now, self.window(), |date| {
            events_on(date, tz, location, sunrise, sunset)
        });

        let Some(current) = computed else {
            let Some(timer) = self.timer else { return };
            if self.needs_location() && self.location.is_none() {
                debug!("waiting for a location");
                ctx.disarm(timer);
            } else {
                info!("the sun does not rise or set today, retrying in an hour");
                ctx.rearm(timer, Duration::from_secs(3600));
            }
            return;
        };

        self.publish_changes(&current, ctx);
        if let Some(timer) = self.timer {
            let wait = (current.next - now.with_timezone(&Utc))
                .to_std()
                .unwrap_or_default()
                .max(Duration::from_secs(1));
            ctx.rearm(timer, wait);
            debug!("next daytime change in {}s", wait.as_secs());
        }
        self.last = Some(current);
    }

    fn publish_changes(&self, current: &Schedule, ctx: &mut ModuleContext<'_>) {
        let last = self.last.as_ref();
        if last.map(|l| l.sunrise) != Some(current.sunrise) {
            ctx.publish(Publication::new(
                Topic::Sunrise,
                Payload::Time(timestamp(current.sunrise)),
            ));
        }
        if last.map(|l| l.sunset) != Some(current.sunset) {
            ctx.publish(Publication::new(
                Topic::Sunset,
                Payload::Time(timestamp(current.sunset)),
            ));
        }
        if last.map(|l| l.day_time) != Some(current.day_time) {
            info!("it is now {:?}", current.day_time);
            ctx.publish(Publication::new(
                Topic::DayTime,
                Payload::Level(current.day_time as i32),
            ));
        }
        if last.map(|l| l.in_event) != Some(current.in_event) {
            ctx.publish(Publication::new(Topic::InEvent, Payload::Flag(current.in_event)));
        }
    }

    fn set_event(&mut self, topic: Topic, payload: &Payload) -> Result<()> {
        let Payload::Event(value) = payload else {
            anyhow::bail!("{topic} without an event time");
        };
        let configured = if topic == Topic::ReqSunrise {
            &self.cfg.sunrise
        } else {
            &self.cfg.sunset
        };
        let time = if value.is_empty() {
            configured.as_deref().and_then(parse_event_time)
        } else {
            Some(
                parse_event_time(value)
                    .ok_or_else(|| anyhow::anyhow!("'{value}' is not a valid HH:MM time"))?,
            )
        };
        match topic {
            Topic::ReqSunrise => self.sunrise = time,
            _ => self.sunset = time,
        }
        Ok(())
    }
}

impl<C: Clock> Module for DaytimeModule<C> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::hard(location::NAME)]
    }

    fn evaluate(&self) -> bool {
        !self.cfg.disabled
    }

    fn check(&mut self, ctx: &mut CheckContext<'_>) -> bool {
        if !self.needs_location() {
            ctx.reclassify_own(location::NAME, DependencyKind::Soft);
        }
        true
    }

    fn init(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        ctx.subscribe_topics(
            TopicSet::only(Topic::Location)
                .with(Topic::ReqSunrise)
                .with(Topic::ReqSunset),
        );
        self.timer = Some(ctx.arm_timer(Duration::ZERO));
        if self.needs_location() && self.location.is_none() {
            ctx.publish(Publication::new(Topic::ReqLocation, Payload::Empty));
        }
        self.refresh(ctx);
        Ok(())
    }

    fn receive(&mut self, msg: &Message, ctx: &mut ModuleContext<'_>) -> Result<()> {
        match msg {
            Message::Ready(_) => {}
            Message::Published(p) => match (p.topic(), p.payload()) {
                (Topic::Location, Payload::Location(at)) => {
                    if self.location == Some(*at) {
                        return Ok(());
                    }
                    self.location = Some(*at);
                }
                (topic @ (Topic::ReqSunrise | Topic::ReqSunset), payload) => {
                    self.set_event(topic, payload)?;
                }
                (topic, _) => {
                    debug!("daytime ignores {topic}");
                    return Ok(());
                }
            },
        }
        self.refresh(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::LocationCfg,
        kernel::{
            Kernel, ModuleState,
            testing::{Inbox, ManualReactor, Recorder},
        },
        modules::location::LocationModule,
        reactor::SourceKind,
    };
    use pretty_assertions::assert_eq;
    use std::{cell::Cell, rc::Rc};

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        at(s).with_timezone(&Utc)
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn close(actual: DateTime<Utc>, expected: DateTime<Utc>, minutes: i64) -> bool {
        (actual - expected).abs() <= TimeDelta::minutes(minutes)
    }

    #[derive(Clone)]
    struct TestClock(Rc<Cell<DateTime<FixedOffset>>>);

    impl Clock for TestClock {
        fn now(&self) -> DateTime<FixedOffset> {
            self.0.get()
        }
    }

    fn fixed_events() -> impl Fn(NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        |date| events_on(date, FixedOffset::east_opt(0)?, None, Some(hm(7, 0)), Some(hm(19, 0)))
    }

    #[test]
    fn london_midsummer() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let (rise, set) = sun_events(date, Coordinates::new(51.5074, -0.1278)).unwrap();

        assert!(close(rise, utc("2024-06-21T03:43:00Z"), 5), "sunrise {rise}");
        assert!(close(set, utc("2024-06-21T20:21:00Z"), 5), "sunset {set}");
    }

    #[test]
    fn eastern_longitudes_use_their_own_solar_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let (rise, set) = sun_events(date, Coordinates::new(35.68, 139.69)).unwrap();

        assert!(close(rise, utc("2024-03-19T20:45:00Z"), 10), "sunrise {rise}");
        assert!(close(set, utc("2024-03-20T08:55:00Z"), 10), "sunset {set}");
    }

    #[test]
    fn polar_summer_has_no_events() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        assert_eq!(sun_events(date, Coordinates::new(78.22, 15.65)), None);
    }

    #[test]
    fn configured_times_override_computed_ones() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let london = Some(Coordinates::new(51.5074, -0.1278));

        let (rise, set) = events_on(date, tz, london, Some(hm(6, 30)), None).unwrap();
        assert_eq!(rise, utc("2024-06-21T04:30:00Z"));
        assert!(close(set, utc("2024-06-21T20:21:00Z"), 5));

        assert_eq!(events_on(date, tz, None, Some(hm(6, 30)), None), None);
    }

    #[test]
    fn midday_is_day_outside_events() {
        let s = schedule(at("2024-05-01T12:00:00Z"), TimeDelta::minutes(30), fixed_events()).unwrap();

        assert_eq!(s.day_time, DayTime::Day);
        assert!(!s.in_event);
        assert_eq!(s.next, utc("2024-05-01T18:45:00Z"));
    }

    #[test]
    fn just_before_sunrise_is_an_event_at_night() {
        let s = schedule(at("2024-05-01T06:50:00Z"), TimeDelta::minutes(30), fixed_events()).unwrap();

        assert_eq!(s.day_time, DayTime::Night);
        assert!(s.in_event);
        assert_eq!(s.next, utc("2024-05-01T07:00:00Z"));
    }

    #[test]
    fn after_the_sunset_window_tomorrow_applies() {
        let s = schedule(at("2024-05-01T20:00:00Z"), TimeDelta::minutes(30), fixed_events()).unwrap();

        assert_eq!(s.day_time, DayTime::Night);
        assert!(!s.in_event);
        assert_eq!(s.sunrise, utc("2024-05-02T07:00:00Z"));
        assert_eq!(s.next, utc("2024-05-02T06:45:00Z"));
    }

    struct Rig {
        kernel: Kernel<ManualReactor>,
        clock: Rc<Cell<DateTime<FixedOffset>>>,
        tap: Inbox,
    }

    impl Rig {
        fn new(daytime: DaytimeCfg, location: LocationCfg, now: &str) -> Self {
            let clock = Rc::new(Cell::new(at(now)));
            let (recorder, tap) = Recorder::new("tap", "^(Sunrise|Sunset|DayTime|InEvent)$");
            let fixed = daytime.has_fixed_events();

            let mut kernel = Kernel::new(ManualReactor::default());
            kernel
                .register(Box::new(DaytimeModule::with_clock(
                    &daytime,
                    TestClock(clock.clone()),
                )))
                .unwrap();
            kernel
                .register(Box::new(LocationModule::new(&location, fixed)))
                .unwrap();
            kernel.register(Box::new(recorder)).unwrap();
            kernel.start().unwrap();
            Self { kernel, clock, tap }
        }

        fn timer(&self) -> SourceId {
            self.kernel.sources_of(self.kernel.id_of(NAME).unwrap())[0]
        }

        fn topics(&self) -> Vec<Topic> {
            self.tap.borrow().iter().map(|p| p.topic()).collect()
        }

        fn last(&self, topic: Topic) -> Option<Payload> {
            self.tap
                .borrow()
                .iter()
                .rev()
                .find(|p| p.topic() == topic)
                .map(|p| p.payload().clone())
        }
    }

    fn fixed_cfg() -> DaytimeCfg {
        DaytimeCfg {
            sunrise: Some("07:00".into()),
            sunset: Some("19:00".into()),
            ..Default::default()
        }
    }

    fn no_cache() -> LocationCfg {
        LocationCfg {
            cache_file: Some("/nonexistent/lumind/location".into()),
            ..Default::default()
        }
    }

    #[test]
    fn fixed_events_run_without_location() {
        let rig = Rig::new(fixed_cfg(), no_cache(), "2024-05-01T12:00:00Z");

        assert_eq!(rig.kernel.state_of(location::NAME), Some(ModuleState::Disabled));
        assert_eq!(rig.kernel.state_of(NAME), Some(ModuleState::Running));
        assert_eq!(
            rig.topics(),
            vec![Topic::Sunrise, Topic::Sunset, Topic::DayTime, Topic::InEvent]
        );
        assert_eq!(rig.last(Topic::DayTime), Some(Payload::Level(0)));
        assert_eq!(
            rig.kernel.reactor().expiry(rig.timer()),
            Some(Duration::from_secs(6 * 3600 + 45 * 60))
        );
    }

    #[test]
    fn timer_moves_through_the_sunset_window() {
        let mut rig = Rig::new(fixed_cfg(), no_cache(), "2024-05-01T12:00:00Z");
        let before = rig.tap.borrow().len();

        rig.clock.set(at("2024-05-01T18:45:00Z"));
        rig.kernel.dispatch(rig.timer(), SourceKind::Timer);
        assert_eq!(rig.last(Topic::InEvent), Some(Payload::Flag(true)));
        assert_eq!(rig.tap.borrow().len(), before + 1);

        rig.clock.set(at("2024-05-01T19:00:00Z"));
        rig.kernel.dispatch(rig.timer(), SourceKind::Timer);
        assert_eq!(rig.last(Topic::DayTime), Some(Payload::Level(1)));
        assert_eq!(
            rig.kernel.reactor().expiry(rig.timer()),
            Some(Duration::from_secs(15 * 60))
        );
    }

    #[test]
    fn waits_for_a_location() {
        let mut rig = Rig::new(DaytimeCfg::default(), no_cache(), "2024-06-21T12:00:00Z");

        assert_eq!(rig.kernel.state_of(NAME), Some(ModuleState::Running));
        assert!(rig.topics().is_empty());
        assert_eq!(rig.kernel.reactor().expiry(rig.timer()), Some(Duration::ZERO));

        rig.kernel.publish(Publication::new(
            Topic::ReqLocation,
            Payload::Location(Coordinates::new(51.5074, -0.1278)),
        ));

        assert_eq!(rig.last(Topic::DayTime), Some(Payload::Level(0)));
        let Some(Payload::Time(sunset)) = rig.last(Topic::Sunset) else {
            panic!("no sunset published");
        };
        let sunset = DateTime::from_timestamp(sunset as i64, 0).unwrap();
        assert!(close(sunset, utc("2024-06-21T20:21:00Z"), 5));
    }

    #[test]
    fn configured_location_feeds_the_computation() {
        let location = LocationCfg {
            latitude: Some(51.5074),
            longitude: Some(-0.1278),
            ..no_cache()
        };
        let rig = Rig::new(DaytimeCfg::default(), location, "2024-06-21T02:00:00Z");

        assert_eq!(rig.kernel.state_of(location::NAME), Some(ModuleState::Running));
        assert_eq!(rig.last(Topic::DayTime), Some(Payload::Level(1)));
    }

    #[test]
    fn sunset_request_overrides_and_empty_restores() {
        let mut rig = Rig::new(fixed_cfg(), no_cache(), "2024-05-01T12:00:00Z");

        rig.kernel.publish(Publication::new(
            Topic::ReqSunset,
            Payload::Event("18:00".into()),
        ));
        assert_eq!(
            rig.last(Topic::Sunset),
            Some(Payload::Time(timestamp(utc("2024-05-01T18:00:00Z"))))
        );

        rig.kernel.publish(Publication::new(Topic::ReqSunset, Payload::Event("6pm".into())));
        rig.kernel
            .publish(Publication::new(Topic::ReqSunset, Payload::Event(String::new())));
        assert_eq!(
            rig.last(Topic::Sunset),
            Some(Payload::Time(timestamp(utc("2024-05-01T19:00:00Z"))))
        );
    }

    #[test]
    fn fixed_events_survive_a_disabled_location() {
        let location = LocationCfg {
            disabled: true,
            ..no_cache()
        };
        let rig = Rig::new(fixed_cfg(), location, "2024-05-01T12:00:00Z");

        assert_eq!(rig.kernel.state_of(location::NAME), Some(ModuleState::Disabled));
        assert_eq!(rig.kernel.state_of(NAME), Some(ModuleState::Running));
    }

    #[test]
    fn location_is_a_hard_requirement_otherwise() {
        let location = LocationCfg {
            disabled: true,
            ..no_cache()
        };
        let rig = Rig::new(DaytimeCfg::default(), location, "2024-05-01T12:00:00Z");

        assert_eq!(rig.kernel.state_of(NAME), Some(ModuleState::Disabled));
    }
}
