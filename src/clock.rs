use chrono::{Local, NaiveDate, NaiveDateTime};

use crate::config::EngineConfig;

/// Source of "today" for quota months, deadlines and audit timestamps.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Pinned clock, selected with `ACADEMYD_TODAY=YYYY-MM-DD`.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl FixedClock {
    pub fn at_date(date: NaiveDate) -> Option<Self> {
        date.and_hms_opt(12, 0, 0).map(Self)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

pub fn from_env() -> Box<dyn Clock> {
    let Ok(raw) = std::env::var("ACADEMYD_TODAY") else {
        return Box::new(SystemClock);
    };
    let fixed = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(FixedClock::at_date);
    match fixed {
        Some(clock) => {
            tracing::info!(today = %clock.today(), "using fixed clock");
            Box::new(clock)
        }
        None => {
            tracing::warn!(value = %raw, "ignoring invalid ACADEMYD_TODAY");
            Box::new(SystemClock)
        }
    }
}

/// Acting user, recorded on approvals, payments and enrollments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor(pub Option<String>);

impl Actor {
    pub fn id(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Capabilities threaded into every engine operation.
pub struct Ctx<'a> {
    pub clock: &'a dyn Clock,
    pub config: EngineConfig,
    pub actor: Actor,
}

impl<'a> Ctx<'a> {
    pub fn new(clock: &'a dyn Clock, config: EngineConfig, actor: Actor) -> Self {
        Self {
            clock,
            config,
            actor,
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor.id()
    }
}
