//! Core of the network desk clock: a software wall clock driven by a wrapping
//! tick counter, calendar breakdown, a minimal SNTP client and the over-the-air
//! self-update engine.
//!
//! Everything in here is hardware independent. The state machines are advanced
//! by event values and answer with the transport commands the firmware has to
//! execute, so the firmware binary only owns sockets, timers and flash drivers.
#![cfg_attr(not(test), no_std)]

mod utils;

pub mod config;
pub mod error;
pub mod ntp;
pub mod ota;
pub mod outbox;
pub mod system;

pub use error::{Error, Result};

/// Identifies one resolve/exchange cycle of a state machine.
///
/// Events tagged with an id other than the live session's are stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
