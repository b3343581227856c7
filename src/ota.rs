//! Over-the-air self update.
//!
//! A session runs resolve, version check over HTTP/1.1, reconnect, image
//! download over HTTP/1.0 into the inactive slot, then finalize. The persistent
//! upgrade flag is `Started` for the whole session and is reset to `Idle` on
//! every path that does not end in a reboot.

pub mod http;
pub mod layout;
pub mod store;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

use core::net::{Ipv4Addr, SocketAddrV4};

use embedded_storage::nor_flash::{NorFlash, NorFlashErrorKind};
use thiserror::Error;

use self::{
    http::{HttpError, HttpRequest},
    layout::{FirmwareSlot, FlashLayout},
    store::{StoreError, UpgradeFlag, UpgradeFlagStore, UpgradeRecord},
    writer::SlotWriter,
};
use crate::{SessionId, config::UpgradeConfig, impl_from_variant, outbox::Outbox};

/// `MAJOR.MINOR` of a firmware build. Ordered major first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    major: u8,
    minor: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Version of the image being built, taken from the package version.
    pub fn running() -> Self {
        Self::new(
            env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        )
    }

    pub fn parse(text: &str) -> Option<Self> {
        let (major, minor) = text.trim().split_once('.')?;
        Some(Self::new(major.parse().ok()?, minor.parse().ok()?))
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }
}

impl core::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Why the TCP transport gave up on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Refused,
    Reset,
    TimedOut,
    NoRoute,
    Closed,
    Other,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    #[error("Upgrade already in progress")]
    Busy,
    #[error("Upgrade server DNS request failed")]
    Resolution,
    #[error("Connection failed: {0:?}")]
    Connection(TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] HttpError),
    #[error("Image of {length} bytes exceeds the {max} byte limit")]
    ImageTooLarge { length: u32, max: u32 },
    #[error("Connection closed after {received} of {expected} bytes")]
    PartialTransfer { received: u32, expected: u32 },
    #[error("Upgrade flag does not match the upgrade state")]
    FlagInconsistency,
    #[error("Flash error: {0:?}")]
    Flash(NorFlashErrorKind),
    #[error("Upgrade flag store error: {0}")]
    Store(#[from] StoreError),
}
impl_from_variant!(OtaError, Flash, NorFlashErrorKind);

pub type OtaResult<T> = Result<T, OtaError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeCommand {
    Resolve {
        session: SessionId,
        host: &'static str,
    },
    Connect {
        session: SessionId,
        server: SocketAddrV4,
    },
    /// Open the connection again to the server of the last `Connect`.
    Reconnect {
        session: SessionId,
    },
    Send {
        session: SessionId,
        request: HttpRequest,
    },
    Disconnect {
        session: SessionId,
    },
    Release {
        session: SessionId,
    },
    /// Select `slot` for the next boot and reset.
    Reboot {
        slot: FirmwareSlot,
    },
}

pub type UpgradeCommands = Outbox<UpgradeCommand, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEvent<'a> {
    Resolved {
        session: SessionId,
        address: Option<Ipv4Addr>,
    },
    Connected {
        session: SessionId,
    },
    Received {
        session: SessionId,
        data: &'a [u8],
    },
    Disconnected {
        session: SessionId,
    },
    ConnectionError {
        session: SessionId,
        error: TransportError,
    },
}

impl UpgradeEvent<'_> {
    pub fn session(&self) -> SessionId {
        match *self {
            Self::Resolved { session, .. }
            | Self::Connected { session }
            | Self::Received { session, .. }
            | Self::Disconnected { session }
            | Self::ConnectionError { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Pending,
    UpToDate,
    /// The image is in place and a reboot into `slot` was requested.
    Rebooting(FirmwareSlot),
    Failed(OtaError),
    Ignored,
}

#[derive(Debug)]
pub struct UpgradeStep {
    pub commands: UpgradeCommands,
    pub outcome: UpgradeOutcome,
}

impl UpgradeStep {
    fn new(outcome: UpgradeOutcome) -> Self {
        Self {
            commands: UpgradeCommands::new(),
            outcome,
        }
    }

    fn with(mut self, command: UpgradeCommand) -> Self {
        self.commands.push(command);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Resolving,
    CheckingVersion,
    Downloading,
    /// An outcome is decided, waiting for the connection to close.
    Closing,
}

/// What the flag says at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Idle,
    /// The new image in this slot is running; the flag was cleared.
    Upgraded(FirmwareSlot),
    /// An image was finished but the reset into it never happened.
    PendingReboot(FirmwareSlot),
}

#[derive(Debug)]
enum Stage {
    Resolving,
    Connecting,
    AwaitingVersion,
    /// Version connection is being closed before the image request.
    Switching,
    Reconnecting,
    AwaitingImage,
    Downloading(SlotWriter),
    Closing(UpgradeOutcome),
}

impl Stage {
    fn phase(&self) -> UpgradePhase {
        match self {
            Self::Resolving => UpgradePhase::Resolving,
            Self::Connecting | Self::AwaitingVersion => UpgradePhase::CheckingVersion,
            Self::Switching | Self::Reconnecting | Self::AwaitingImage | Self::Downloading(_) => {
                UpgradePhase::Downloading
            }
            Self::Closing(_) => UpgradePhase::Closing,
        }
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    slot: FirmwareSlot,
    stage: Stage,
}

pub struct UpdateEngine<F, S> {
    config: &'static UpgradeConfig,
    version: FirmwareVersion,
    layout: FlashLayout,
    active: FirmwareSlot,
    flash: F,
    store: S,
    session: Option<Session>,
    last_session: SessionId,
}

impl<F: NorFlash, S: UpgradeFlagStore> UpdateEngine<F, S> {
    pub fn new(
        config: &'static UpgradeConfig,
        version: FirmwareVersion,
        layout: FlashLayout,
        active: FirmwareSlot,
        flash: F,
        store: S,
    ) -> Self {
        Self {
            config,
            version,
            layout,
            active,
            flash,
            store,
            session: None,
            last_session: SessionId::new(0),
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn phase(&self) -> Option<UpgradePhase> {
        self.session.as_ref().map(|session| session.stage.phase())
    }

    pub fn active_slot(&self) -> FirmwareSlot {
        self.active
    }

    /// Slot being written by the live session.
    pub fn target_slot(&self) -> Option<FirmwareSlot> {
        self.session.as_ref().map(|session| session.slot)
    }

    pub fn bytes_received(&self) -> u32 {
        self.writer().map_or(0, SlotWriter::received)
    }

    pub fn content_length(&self) -> u32 {
        self.writer().map_or(0, SlotWriter::length)
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_parts(self) -> (F, S) {
        (self.flash, self.store)
    }

    fn writer(&self) -> Option<&SlotWriter> {
        match &self.session.as_ref()?.stage {
            Stage::Downloading(writer) => Some(writer),
            _ => None,
        }
    }

    /// Starts a session unless one is live or the persistent flag says
    /// `Started`.
    pub fn check_update(&mut self) -> OtaResult<UpgradeCommands> {
        if let Some(session) = &self.session {
            log::warn!("Upgrade session {} still running", session.id);
            return Err(OtaError::Busy);
        }
        if self.store.load()?.flag == UpgradeFlag::Started {
            log::warn!("Upgrade flag already set, not starting");
            return Err(OtaError::Busy);
        }

        let slot = self.active.other();
        self.store
            .store(UpgradeRecord::new(UpgradeFlag::Started, slot))?;

        let id = self.last_session.next();
        self.last_session = id;
        self.session = Some(Session {
            id,
            slot,
            stage: Stage::Resolving,
        });

        log::info!("Checking for upgrade at {}", self.config.host());
        let mut commands = UpgradeCommands::new();
        commands.push(UpgradeCommand::Resolve {
            session: id,
            host: self.config.host(),
        });
        Ok(commands)
    }

    pub fn handle(&mut self, event: UpgradeEvent<'_>) -> UpgradeStep {
        let Some(Session { id, slot, stage }) =
            self.session.take_if(|session| session.id == event.session())
        else {
            log::debug!("Ignoring upgrade event for stale session {}", event.session());
            return UpgradeStep::new(UpgradeOutcome::Ignored);
        };

        match (stage, event) {
            (
                Stage::Closing(outcome),
                UpgradeEvent::Disconnected { .. } | UpgradeEvent::ConnectionError { .. },
            ) => UpgradeStep::new(outcome).with(UpgradeCommand::Release { session: id }),
            (_, UpgradeEvent::ConnectionError { error, .. }) => {
                self.abort(id, slot, OtaError::Connection(error))
            }

            (Stage::Resolving, UpgradeEvent::Resolved { address, .. }) => {
                self.on_resolved(id, slot, address)
            }

            (Stage::Connecting, UpgradeEvent::Connected { .. }) => {
                match http::version_request(self.config) {
                    Ok(request) => {
                        self.resume(id, slot, Stage::AwaitingVersion)
                            .with(UpgradeCommand::Send { session: id, request })
                    }
                    Err(err) => self.close(id, slot, UpgradeOutcome::Failed(err.into())),
                }
            }
            (Stage::AwaitingVersion, UpgradeEvent::Received { data, .. }) => {
                self.on_version(id, slot, data)
            }
            (Stage::Connecting | Stage::AwaitingVersion, UpgradeEvent::Disconnected { .. }) => {
                self.abort(id, slot, HttpError::ConnectionClosed.into())
            }

            (Stage::Switching, UpgradeEvent::Disconnected { .. }) => {
                log::debug!("Reconnecting for slot {slot} image");
                self.resume(id, slot, Stage::Reconnecting)
                    .with(UpgradeCommand::Reconnect { session: id })
            }
            (Stage::Reconnecting, UpgradeEvent::Connected { .. }) => {
                match http::image_request(self.config, slot) {
                    Ok(request) => self
                        .resume(id, slot, Stage::AwaitingImage)
                        .with(UpgradeCommand::Send { session: id, request }),
                    Err(err) => self.close(id, slot, UpgradeOutcome::Failed(err.into())),
                }
            }
            (Stage::AwaitingImage, UpgradeEvent::Received { data, .. }) => {
                self.on_image_head(id, slot, data)
            }
            (Stage::Downloading(writer), UpgradeEvent::Received { data, .. }) => {
                self.append(id, slot, writer, data)
            }
            (Stage::Reconnecting | Stage::AwaitingImage, UpgradeEvent::Disconnected { .. }) => {
                self.abort(id, slot, HttpError::ConnectionClosed.into())
            }
            (Stage::Downloading(writer), UpgradeEvent::Disconnected { .. }) => self.abort(
                id,
                slot,
                OtaError::PartialTransfer {
                    received: writer.received(),
                    expected: writer.length(),
                },
            ),

            (stage, event) => {
                log::debug!("Ignoring upgrade event {event:?} in stage {stage:?}");
                self.session = Some(Session { id, slot, stage });
                UpgradeStep::new(UpgradeOutcome::Ignored)
            }
        }
    }

    /// Reads the flag left by the previous run.
    ///
    /// A `Started` flag means power was lost mid-session. It is reported and
    /// left alone; [`Self::clear_stale_flag`] clears it.
    pub fn inspect_boot_flag(&mut self) -> OtaResult<BootState> {
        if self.session.is_some() {
            return Err(OtaError::Busy);
        }

        let record = self.store.load()?;
        match record.flag {
            UpgradeFlag::Idle => Ok(BootState::Idle),
            UpgradeFlag::Finished if record.slot == self.active => {
                log::info!("Running upgraded firmware {} from slot {}", self.version, record.slot);
                self.store
                    .store(UpgradeRecord::new(UpgradeFlag::Idle, record.slot))?;
                Ok(BootState::Upgraded(record.slot))
            }
            UpgradeFlag::Finished => {
                log::info!("Firmware in slot {} finished but not booted", record.slot);
                Ok(BootState::PendingReboot(record.slot))
            }
            UpgradeFlag::Started => {
                log::warn!("Upgrade flag left started, upgrades blocked until cleared");
                Err(OtaError::FlagInconsistency)
            }
        }
    }

    pub fn clear_stale_flag(&mut self) -> OtaResult<()> {
        if self.session.is_some() {
            return Err(OtaError::Busy);
        }
        let record = self.store.load()?;
        self.store
            .store(UpgradeRecord::new(UpgradeFlag::Idle, record.slot))?;
        log::info!("Upgrade flag cleared");
        Ok(())
    }

    fn on_resolved(&mut self, id: SessionId, slot: FirmwareSlot, address: Option<Ipv4Addr>) -> UpgradeStep {
        let Some(address) = address else {
            return self.abort(id, slot, OtaError::Resolution);
        };

        let server = SocketAddrV4::new(address, self.config.port());
        log::info!("Connecting to upgrade server {server}");
        self.resume(id, slot, Stage::Connecting)
            .with(UpgradeCommand::Connect { session: id, server })
    }

    fn on_version(&mut self, id: SessionId, slot: FirmwareSlot, data: &[u8]) -> UpgradeStep {
        let remote = match http::parse_version_response(data, self.config.version_key()) {
            Ok(remote) => remote,
            Err(err) => return self.close(id, slot, UpgradeOutcome::Failed(err.into())),
        };

        log::info!("Got version {remote}; running {}", self.version);
        if remote <= self.version {
            return self.close(id, slot, UpgradeOutcome::UpToDate);
        }

        log::info!("Upgrading slot {slot} to {remote}");
        self.resume(id, slot, Stage::Switching)
            .with(UpgradeCommand::Disconnect { session: id })
    }

    fn on_image_head(&mut self, id: SessionId, slot: FirmwareSlot, data: &[u8]) -> UpgradeStep {
        let head = match http::parse_image_head(data) {
            Ok(head) => head,
            Err(err) => return self.close(id, slot, UpgradeOutcome::Failed(err.into())),
        };

        let max = self.layout.max_image_size();
        if head.content_length > max {
            let err = OtaError::ImageTooLarge {
                length: head.content_length,
                max,
            };
            return self.close(id, slot, UpgradeOutcome::Failed(err));
        }

        let writer = match SlotWriter::new::<F>(self.layout.slot(slot), head.content_length) {
            Ok(writer) => writer,
            Err(err) => return self.close(id, slot, UpgradeOutcome::Failed(err.into())),
        };
        log::info!("Downloading {} bytes into slot {slot}", head.content_length);
        self.append(id, slot, writer, head.body)
    }

    fn append(&mut self, id: SessionId, slot: FirmwareSlot, mut writer: SlotWriter, data: &[u8]) -> UpgradeStep {
        if writer.received() as usize + data.len() > writer.length() as usize {
            return self.close(id, slot, UpgradeOutcome::Failed(HttpError::BodyTooLong.into()));
        }
        if let Err(err) = writer.write(&mut self.flash, data) {
            return self.close(id, slot, UpgradeOutcome::Failed(err.into()));
        }

        if !writer.is_complete() {
            return self.resume(id, slot, Stage::Downloading(writer));
        }
        if let Err(err) = writer.finish(&mut self.flash) {
            return self.close(id, slot, UpgradeOutcome::Failed(err.into()));
        }
        self.finalize(id, slot)
    }

    /// Marks the image finished and asks for a reboot if the mark sticks.
    fn finalize(&mut self, id: SessionId, slot: FirmwareSlot) -> UpgradeStep {
        let finished = UpgradeRecord::new(UpgradeFlag::Finished, slot);
        if let Err(err) = self.store.store(finished) {
            log::error!("Storing upgrade flag failed: {err}");
        }

        let mut step = UpgradeStep::new(UpgradeOutcome::Pending)
            .with(UpgradeCommand::Disconnect { session: id })
            .with(UpgradeCommand::Release { session: id });

        match self.store.load() {
            Ok(record) if record == finished => {
                log::info!("Firmware written to slot {slot}, rebooting");
                step.commands.push(UpgradeCommand::Reboot { slot });
                step.outcome = UpgradeOutcome::Rebooting(slot);
            }
            _ => {
                step.outcome = UpgradeOutcome::Failed(OtaError::FlagInconsistency);
                self.reset_flag(slot);
                Self::report(step.outcome);
            }
        }
        step
    }

    fn resume(&mut self, id: SessionId, slot: FirmwareSlot, stage: Stage) -> UpgradeStep {
        self.session = Some(Session { id, slot, stage });
        UpgradeStep::new(UpgradeOutcome::Pending)
    }

    /// Ends the session on an open connection; the outcome is reported once
    /// the transport confirms the close.
    fn close(&mut self, id: SessionId, slot: FirmwareSlot, outcome: UpgradeOutcome) -> UpgradeStep {
        self.reset_flag(slot);
        Self::report(outcome);
        self.resume(id, slot, Stage::Closing(outcome))
            .with(UpgradeCommand::Disconnect { session: id })
    }

    /// Ends the session when there is no connection left to close.
    fn abort(&mut self, id: SessionId, slot: FirmwareSlot, err: OtaError) -> UpgradeStep {
        let outcome = UpgradeOutcome::Failed(err);
        self.reset_flag(slot);
        Self::report(outcome);
        UpgradeStep::new(outcome).with(UpgradeCommand::Release { session: id })
    }

    fn reset_flag(&mut self, slot: FirmwareSlot) {
        if let Err(err) = self.store.store(UpgradeRecord::new(UpgradeFlag::Idle, slot)) {
            log::error!("Resetting upgrade flag failed: {err}");
        }
    }

    fn report(outcome: UpgradeOutcome) {
        match outcome {
            UpgradeOutcome::UpToDate => log::info!("Firmware is up to date"),
            UpgradeOutcome::Failed(err) => log::warn!("Upgrade failed: {err}"),
            _ => {}
        }
    }
}
