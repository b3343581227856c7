//! Minimal SNTP client.
//!
//! One request per session: resolve the server, send a bare client packet, take
//! the transmit timestamp of whatever answer arrives first. The originate
//! timestamp is not echoed or checked, so any datagram that reaches the socket
//! while a request is outstanding is accepted.

use core::net::{Ipv4Addr, SocketAddrV4};

use embassy_time::Duration;
use thiserror::Error;

use crate::{
    SessionId,
    config::NtpClientConfig,
    outbox::Outbox,
    system::time::{SoftwareClock, TickSource},
};

pub const NTP_PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
pub const NTP_TO_UNIX_OFFSET: u32 = 2_208_988_800;
const TRANSMIT_TIMESTAMP_OFFSET: usize = 40;
/// Leap indicator 0, version 4, mode 3 (client).
const CLIENT_REQUEST_FLAGS: u8 = 0b0010_0011;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NtpClientError {
    #[error("NTP server DNS request failed")]
    Resolution,
    #[error("NTP request timed out")]
    Timeout,
    #[error("NTP response too short ({0} bytes)")]
    ShortResponse(usize),
}

pub type NtpClientResult<T> = Result<T, NtpClientError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    Resolve {
        session: SessionId,
        host: &'static str,
    },
    Send {
        session: SessionId,
        server: SocketAddrV4,
        packet: [u8; NTP_PACKET_LEN],
    },
    ArmTimeout {
        session: SessionId,
        after: Duration,
    },
    DisarmTimeout {
        session: SessionId,
    },
    Release {
        session: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent<'a> {
    Resolved {
        session: SessionId,
        address: Option<Ipv4Addr>,
    },
    Received {
        session: SessionId,
        payload: &'a [u8],
    },
    TimedOut {
        session: SessionId,
    },
}

impl SyncEvent<'_> {
    pub fn session(&self) -> SessionId {
        match *self {
            Self::Resolved { session, .. }
            | Self::Received { session, .. }
            | Self::TimedOut { session } => session,
        }
    }
}

pub type SyncCommands = Outbox<SyncCommand, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The session moved on and waits for its next event.
    Pending,
    /// The clock was set to this Unix time.
    Synchronized(u32),
    Failed(NtpClientError),
    /// The event belonged to no live session.
    Ignored,
}

#[derive(Debug)]
pub struct SyncStep {
    pub commands: SyncCommands,
    pub outcome: SyncOutcome,
}

impl SyncStep {
    fn new(outcome: SyncOutcome) -> Self {
        Self {
            commands: SyncCommands::new(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    Resolving { session: SessionId },
    AwaitingResponse { session: SessionId },
}

pub struct TimeSyncClient {
    config: &'static NtpClientConfig,
    state: SyncState,
    last_session: SessionId,
}

impl TimeSyncClient {
    pub fn new(config: &'static NtpClientConfig) -> Self {
        Self {
            config,
            state: SyncState::Idle,
            last_session: SessionId::new(0),
        }
    }

    /// Session currently in flight, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self.state {
            SyncState::Idle => None,
            SyncState::Resolving { session } | SyncState::AwaitingResponse { session } => {
                Some(session)
            }
        }
    }

    /// Starts a new session, cancelling the one in flight.
    pub fn sync(&mut self) -> SyncCommands {
        let mut commands = SyncCommands::new();
        match self.state {
            SyncState::Idle => {}
            SyncState::Resolving { session } => {
                log::debug!("Dropping NTP session {session} waiting for DNS");
                commands.push(SyncCommand::Release { session });
            }
            SyncState::AwaitingResponse { session } => {
                log::debug!("Dropping NTP session {session} waiting for response");
                commands.push(SyncCommand::DisarmTimeout { session });
                commands.push(SyncCommand::Release { session });
            }
        }

        let session = self.last_session.next();
        self.last_session = session;
        self.state = SyncState::Resolving { session };

        log::info!("Sending DNS request for NTP server {}", self.config.server());
        commands.push(SyncCommand::Resolve {
            session,
            host: self.config.server(),
        });
        commands
    }

    pub fn handle<T: TickSource>(
        &mut self,
        event: SyncEvent<'_>,
        clock: &mut SoftwareClock<T>,
    ) -> SyncStep {
        if self.session() != Some(event.session()) {
            log::debug!("Ignoring NTP event for stale session {}", event.session());
            return SyncStep::new(SyncOutcome::Ignored);
        }

        match (self.state, event) {
            (SyncState::Resolving { session }, SyncEvent::Resolved { address, .. }) => {
                self.on_resolved(session, address)
            }
            (SyncState::AwaitingResponse { session }, SyncEvent::Received { payload, .. }) => {
                self.on_response(session, payload, clock)
            }
            (SyncState::AwaitingResponse { session }, SyncEvent::TimedOut { .. }) => {
                log::warn!("NTP timeout");
                self.finish(session, SyncOutcome::Failed(NtpClientError::Timeout))
            }
            (state, event) => {
                log::debug!("Ignoring NTP event {event:?} in state {state:?}");
                SyncStep::new(SyncOutcome::Ignored)
            }
        }
    }

    fn on_resolved(&mut self, session: SessionId, address: Option<Ipv4Addr>) -> SyncStep {
        let Some(address) = address else {
            log::warn!("NTP DNS request failed");
            return self.finish(session, SyncOutcome::Failed(NtpClientError::Resolution));
        };

        let server = SocketAddrV4::new(address, self.config.port());
        log::info!("Sending NTP request to {server}");
        self.state = SyncState::AwaitingResponse { session };

        let mut step = SyncStep::new(SyncOutcome::Pending);
        step.commands.push(SyncCommand::ArmTimeout {
            session,
            after: self.config.timeout(),
        });
        step.commands.push(SyncCommand::Send {
            session,
            server,
            packet: request_packet(),
        });
        step
    }

    fn on_response<T: TickSource>(
        &mut self,
        session: SessionId,
        payload: &[u8],
        clock: &mut SoftwareClock<T>,
    ) -> SyncStep {
        log::debug!("Got NTP response");
        let mut step = SyncStep::new(SyncOutcome::Pending);
        step.commands.push(SyncCommand::DisarmTimeout { session });

        let outcome = match unix_time_from_response(payload) {
            Ok(timestamp) => {
                clock.set_time(timestamp);
                let fields = crate::system::calendar::breakdown(timestamp);
                log::info!("{fields} ({timestamp})");
                SyncOutcome::Synchronized(timestamp)
            }
            Err(err) => {
                log::warn!("Bad NTP response: {err}");
                SyncOutcome::Failed(err)
            }
        };

        let released = self.finish(session, outcome);
        for command in released.commands {
            step.commands.push(command);
        }
        step.outcome = released.outcome;
        step
    }

    fn finish(&mut self, session: SessionId, outcome: SyncOutcome) -> SyncStep {
        self.state = SyncState::Idle;
        let mut step = SyncStep::new(outcome);
        step.commands.push(SyncCommand::Release { session });
        step
    }
}

/// An all zero request carrying only the client flags.
pub fn request_packet() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = CLIENT_REQUEST_FLAGS;
    packet
}

/// Seconds part of the transmit timestamp, moved to the Unix epoch.
pub fn unix_time_from_response(payload: &[u8]) -> NtpClientResult<u32> {
    let seconds = payload
        .get(TRANSMIT_TIMESTAMP_OFFSET..TRANSMIT_TIMESTAMP_OFFSET + 4)
        .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
        .ok_or(NtpClientError::ShortResponse(payload.len()))?;

    Ok(u32::from_be_bytes(seconds).wrapping_sub(NTP_TO_UNIX_OFFSET))
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 123);

    fn client() -> TimeSyncClient {
        TimeSyncClient::new(Box::leak(Box::new(NtpClientConfig::default())))
    }

    fn response_with(transmit_seconds: u32) -> [u8; NTP_PACKET_LEN] {
        let mut packet = [0u8; NTP_PACKET_LEN];
        packet[0] = 0b0010_0100;
        packet[40..44].copy_from_slice(&transmit_seconds.to_be_bytes());
        packet
    }

    fn resolve(client: &mut TimeSyncClient, clock: &mut SoftwareClock<impl TickSource>) -> SessionId {
        let commands = client.sync();
        let Some(SyncCommand::Resolve { session, .. }) = commands.iter().last().cloned() else {
            panic!("no resolve command in {commands:?}");
        };
        let step = client.handle(
            SyncEvent::Resolved {
                session,
                address: Some(SERVER_IP),
            },
            clock,
        );
        assert_eq!(step.outcome, SyncOutcome::Pending);
        session
    }

    #[test]
    fn request_packet_layout() {
        let packet = request_packet();
        assert_eq!(packet[0], 0x23);
        assert!(packet[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn converts_transmit_timestamp() {
        let value = 3_913_056_000u32;
        assert_eq!(
            unix_time_from_response(&response_with(value)),
            Ok(value - NTP_TO_UNIX_OFFSET)
        );
        assert_eq!(
            unix_time_from_response(&[0u8; 43]),
            Err(NtpClientError::ShortResponse(43))
        );
    }

    #[test]
    fn resolve_then_send_with_timeout() {
        let tick = Cell::new(0);
        let mut clock = SoftwareClock::new(|| tick.get());
        let mut client = client();

        let commands = client.sync();
        let session = client.session().unwrap();
        assert_eq!(
            commands.as_slice(),
            &[SyncCommand::Resolve {
                session,
                host: "uk.pool.ntp.org"
            }]
        );

        let step = client.handle(
            SyncEvent::Resolved {
                session,
                address: Some(SERVER_IP),
            },
            &mut clock,
        );
        assert_eq!(
            step.commands.as_slice(),
            &[
                SyncCommand::ArmTimeout {
                    session,
                    after: Duration::from_secs(5)
                },
                SyncCommand::Send {
                    session,
                    server: SocketAddrV4::new(SERVER_IP, 123),
                    packet: request_packet(),
                },
            ]
        );
    }

    #[test]
    fn response_sets_clock() {
        let tick = Cell::new(7 * 1_000_000);
        let mut clock = SoftwareClock::new(|| tick.get());
        let mut client = client();
        let session = resolve(&mut client, &mut clock);

        let value = 3_944_678_400u32;
        let response = response_with(value);
        let step = client.handle(
            SyncEvent::Received {
                session,
                payload: &response,
            },
            &mut clock,
        );

        assert_eq!(step.outcome, SyncOutcome::Synchronized(value - 2_208_988_800));
        assert_eq!(
            step.commands.as_slice(),
            &[
                SyncCommand::DisarmTimeout { session },
                SyncCommand::Release { session }
            ]
        );
        assert_eq!(clock.now(), value - 2_208_988_800);
        assert_eq!(client.session(), None);
    }

    #[test]
    fn dns_failure_releases_without_retry() {
        let tick = Cell::new(0);
        let mut clock = SoftwareClock::new(|| tick.get());
        let mut client = client();
        client.sync();
        let session = client.session().unwrap();

        let step = client.handle(
            SyncEvent::Resolved {
                session,
                address: None,
            },
            &mut clock,
        );
        assert_eq!(step.outcome, SyncOutcome::Failed(NtpClientError::Resolution));
        assert_eq!(step.commands.as_slice(), &[SyncCommand::Release { session }]);
        assert_eq!(client.session(), None);
    }

    #[test]
    fn timeout_releases_session_and_keeps_clock() {
        let tick = Cell::new(0);
        let mut clock = SoftwareClock::new(|| tick.get());
        clock.set_time(1_000);
        let mut client = client();
        let session = resolve(&mut client, &mut clock);

        let step = client.handle(SyncEvent::TimedOut { session }, &mut clock);
        assert_eq!(step.outcome, SyncOutcome::Failed(NtpClientError::Timeout));
        assert_eq!(step.commands.as_slice(), &[SyncCommand::Release { session }]);
        assert_eq!(clock.now(), 1_000);

        // A late answer finds no session.
        let response = response_with(3_944_678_400);
        let step = client.handle(
            SyncEvent::Received {
                session,
                payload: &response,
            },
            &mut clock,
        );
        assert_eq!(step.outcome, SyncOutcome::Ignored);
        assert_eq!(clock.now(), 1_000);
    }

    #[test]
    fn short_response_fails_session() {
        let tick = Cell::new(0);
        let mut clock = SoftwareClock::new(|| tick.get());
        let mut client = client();
        let session = resolve(&mut client, &mut clock);

        let step = client.handle(
            SyncEvent::Received {
                session,
                payload: &[0x24; 12],
            },
            &mut clock,
        );
        assert_eq!(
            step.outcome,
            SyncOutcome::Failed(NtpClientError::ShortResponse(12))
        );
        assert_eq!(
            step.commands.as_slice(),
            &[
                SyncCommand::DisarmTimeout { session },
                SyncCommand::Release { session }
            ]
        );
    }

    #[test]
    fn sync_cancels_outstanding_session() {
        let tick = Cell::new(0);
        let mut clock = SoftwareClock::new(|| tick.get());
        clock.set_time(1_000);
        let mut client = client();
        let old = resolve(&mut client, &mut clock);

        let commands = client.sync();
        let new = client.session().unwrap();
        assert_ne!(old, new);
        assert_eq!(
            commands.as_slice(),
            &[
                SyncCommand::DisarmTimeout { session: old },
                SyncCommand::Release { session: old },
                SyncCommand::Resolve {
                    session: new,
                    host: "uk.pool.ntp.org"
                },
            ]
        );

        // The old timeout firing late must not touch the new session.
        let step = client.handle(SyncEvent::TimedOut { session: old }, &mut clock);
        assert_eq!(step.outcome, SyncOutcome::Ignored);
        assert!(step.commands.is_empty());
        assert_eq!(client.session(), Some(new));
    }

    #[test]
    fn sync_while_resolving_releases_previous() {
        let mut client = client();
        client.sync();
        let old = client.session().unwrap();

        let commands = client.sync();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands.as_slice()[0], SyncCommand::Release { session: old });
    }
}
