use chrono::{DateTime, Utc};

use super::calendar::{self, CalendarFields};

/// Rate of the hardware counter behind [`TickSource`]: one tick per microsecond.
pub const TICKS_PER_SECOND: u32 = 1_000_000;

/// Whole seconds in one period of the 32-bit tick counter (about 71.6 minutes).
///
/// The fractional part of the period is dropped, so every detected wrap loses
/// just under one second.
pub const WRAP_PERIOD_SECONDS: u32 = ((1u64 << 32) / TICKS_PER_SECOND as u64) as u32;

/// Free running, wrapping hardware tick counter.
pub trait TickSource {
    fn ticks(&self) -> u32;
}

impl<F: Fn() -> u32> TickSource for F {
    fn ticks(&self) -> u32 {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    last_raw_tick: u32,
    offset_seconds: u32,
}

impl ClockState {
    pub fn last_raw_tick(&self) -> u32 {
        self.last_raw_tick
    }

    pub fn offset_seconds(&self) -> u32 {
        self.offset_seconds
    }
}

/// Wall clock kept in software on top of a wrapping tick counter.
///
/// Wraps are only noticed when [`SoftwareClock::now`] sees a sample smaller than
/// the previous one. If more than one wrap period passes between two calls the
/// extra periods are lost and the clock falls behind by whole periods, so the
/// owner has to poll at least once per [`WRAP_PERIOD_SECONDS`].
pub struct SoftwareClock<T> {
    ticks: T,
    state: ClockState,
}

impl<T: TickSource> SoftwareClock<T> {
    pub fn new(ticks: T) -> Self {
        let last_raw_tick = ticks.ticks();
        Self {
            ticks,
            state: ClockState {
                last_raw_tick,
                offset_seconds: 0,
            },
        }
    }

    /// Steps the clock so that [`now`](Self::now) reads `now` at this instant.
    pub fn set_time(&mut self, now: u32) {
        let sample = self.ticks.ticks();
        self.state = ClockState {
            last_raw_tick: sample,
            offset_seconds: now.wrapping_sub(sample / TICKS_PER_SECOND),
        };
    }

    /// Current Unix time in seconds.
    pub fn now(&mut self) -> u32 {
        let sample = self.ticks.ticks();
        if sample < self.state.last_raw_tick {
            log::debug!("Tick counter wrapped");
            self.state.offset_seconds = self.state.offset_seconds.wrapping_add(WRAP_PERIOD_SECONDS);
        }
        self.state.last_raw_tick = sample;

        (sample / TICKS_PER_SECOND).wrapping_add(self.state.offset_seconds)
    }

    pub fn now_utc(&mut self) -> DateTime<Utc> {
        let now = self.now();
        DateTime::from_timestamp(now.into(), 0).unwrap_or_default()
    }

    pub fn breakdown_now(&mut self) -> CalendarFields {
        calendar::breakdown(self.now())
    }

    pub fn state(&self) -> ClockState {
        self.state
    }
}
