//! The single event loop. It owns the clock and both state machines; the
//! transport tasks only ever see commands and answer with events.

use core::{future::pending, net::Ipv4Addr};

use embassy_futures::select::{Either4, select4};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::{Duration, Instant, Ticker, Timer};
use esp_storage::FlashStorage;
use heapless::Vec;
use net_dot_clock::{
    SessionId,
    config::Config,
    ntp::{NTP_PACKET_LEN, SyncCommand, SyncEvent, SyncOutcome, TimeSyncClient},
    ota::{
        BootState, TransportError, UpdateEngine, UpgradeCommand, UpgradeEvent, UpgradeOutcome,
        layout::FirmwareSlot,
        store::FlashUpgradeFlag,
    },
    system::time::SoftwareClock,
};

use crate::boot::OtaBootSelector;

/// Largest piece of a TCP stream handed to the update engine at once.
pub const CHUNK_LEN: usize = 1024;
const REBOOT_DELAY: Duration = Duration::from_millis(500);

pub static EVENTS: Channel<CriticalSectionRawMutex, Event, 4> = Channel::new();
pub static SYNC_COMMANDS: Channel<CriticalSectionRawMutex, SyncCommand, 8> = Channel::new();
pub static UPGRADE_COMMANDS: Channel<CriticalSectionRawMutex, UpgradeCommand, 8> = Channel::new();

pub enum Event {
    NetworkReady,
    NetworkLost,
    Sync(SyncMessage),
    Upgrade(UpgradeMessage),
}

pub enum SyncMessage {
    Resolved {
        session: SessionId,
        address: Option<Ipv4Addr>,
    },
    Received {
        session: SessionId,
        payload: Vec<u8, NTP_PACKET_LEN>,
    },
}

impl SyncMessage {
    fn as_event(&self) -> SyncEvent<'_> {
        match self {
            Self::Resolved { session, address } => SyncEvent::Resolved {
                session: *session,
                address: *address,
            },
            Self::Received { session, payload } => SyncEvent::Received {
                session: *session,
                payload,
            },
        }
    }
}

pub enum UpgradeMessage {
    Resolved {
        session: SessionId,
        address: Option<Ipv4Addr>,
    },
    Connected {
        session: SessionId,
    },
    Received {
        session: SessionId,
        data: Vec<u8, CHUNK_LEN>,
    },
    Disconnected {
        session: SessionId,
    },
    ConnectionError {
        session: SessionId,
        error: TransportError,
    },
}

impl UpgradeMessage {
    fn as_event(&self) -> UpgradeEvent<'_> {
        match self {
            Self::Resolved { session, address } => UpgradeEvent::Resolved {
                session: *session,
                address: *address,
            },
            Self::Connected { session } => UpgradeEvent::Connected { session: *session },
            Self::Received { session, data } => UpgradeEvent::Received {
                session: *session,
                data,
            },
            Self::Disconnected { session } => UpgradeEvent::Disconnected { session: *session },
            Self::ConnectionError { session, error } => UpgradeEvent::ConnectionError {
                session: *session,
                error: *error,
            },
        }
    }
}

/// Low 32 bits of the 1 MHz embassy time base.
pub fn hardware_ticks() -> u32 {
    Instant::now().as_micros() as u32
}

pub type Clock = SoftwareClock<fn() -> u32>;
pub type Engine = UpdateEngine<FlashStorage, FlashUpgradeFlag<FlashStorage>>;

pub struct Runtime {
    config: &'static Config,
    clock: Clock,
    time_sync: TimeSyncClient,
    upgrade: Engine,
    boot: OtaBootSelector,
    sync_deadline: Option<(SessionId, Instant)>,
    resync: Option<Ticker>,
    refresh_at: Instant,
}

impl Runtime {
    pub fn new(
        config: &'static Config,
        clock: Clock,
        upgrade: Engine,
        boot: OtaBootSelector,
    ) -> Self {
        Self {
            config,
            clock,
            time_sync: TimeSyncClient::new(config.ntp_client()),
            upgrade,
            boot,
            sync_deadline: None,
            resync: None,
            refresh_at: Instant::now(),
        }
    }

    /// Acts on the flag left by the previous run before any network traffic.
    pub async fn inspect_boot_flag(&mut self) {
        match self.upgrade.inspect_boot_flag() {
            Ok(BootState::PendingReboot(slot)) => self.reboot(slot).await,
            Ok(BootState::Upgraded(slot)) => {
                log::info!("Booted new firmware {} from slot {slot}", self.config.version())
            }
            Ok(BootState::Idle) => {}
            Err(err) => log::warn!("Boot flag inspection: {err}"),
        }
    }

    pub async fn run(mut self) -> ! {
        loop {
            let woken = select4(
                EVENTS.receive(),
                sync_timeout(self.sync_deadline),
                resync_due(&mut self.resync),
                Timer::at(self.refresh_at),
            )
            .await;

            match woken {
                Either4::First(event) => self.on_event(event).await,
                Either4::Second(session) => {
                    self.sync_deadline = None;
                    self.on_sync_event(SyncEvent::TimedOut { session }).await;
                }
                Either4::Third(()) => self.start_sync().await,
                Either4::Fourth(()) => self.refresh(),
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::NetworkReady => {
                self.start_sync().await;
                self.check_update().await;
                self.resync = Some(Ticker::every(self.config.ntp_client().query_period()));
            }
            Event::NetworkLost => self.resync = None,
            Event::Sync(message) => self.on_sync_event(message.as_event()).await,
            Event::Upgrade(message) => {
                let step = self.upgrade.handle(message.as_event());
                if let UpgradeOutcome::Failed(err) = step.outcome {
                    log::debug!("Upgrade session ended: {err}");
                }
                for command in step.commands {
                    self.execute_upgrade(command).await;
                }
            }
        }
    }

    async fn start_sync(&mut self) {
        for command in self.time_sync.sync() {
            self.execute_sync(command).await;
        }
    }

    async fn on_sync_event(&mut self, event: SyncEvent<'_>) {
        let step = self.time_sync.handle(event, &mut self.clock);
        for command in step.commands {
            self.execute_sync(command).await;
        }
        if let SyncOutcome::Synchronized(_) = step.outcome {
            self.refresh_at = Instant::now();
        }
    }

    async fn execute_sync(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::ArmTimeout { session, after } => {
                self.sync_deadline = Some((session, Instant::now() + after));
            }
            SyncCommand::DisarmTimeout { session } => {
                if matches!(self.sync_deadline, Some((armed, _)) if armed == session) {
                    self.sync_deadline = None;
                }
            }
            command => SYNC_COMMANDS.send(command).await,
        }
    }

    async fn check_update(&mut self) {
        match self.upgrade.check_update() {
            Ok(commands) => {
                for command in commands {
                    self.execute_upgrade(command).await;
                }
            }
            Err(err) => log::warn!("Upgrade check not started: {err}"),
        }
    }

    async fn execute_upgrade(&mut self, command: UpgradeCommand) {
        match command {
            UpgradeCommand::Reboot { slot } => self.reboot(slot).await,
            command => UPGRADE_COMMANDS.send(command).await,
        }
    }

    async fn reboot(&mut self, slot: FirmwareSlot) {
        // Let the transport close the connection first.
        Timer::after(REBOOT_DELAY).await;
        if let Err(err) = self.boot.select(slot) {
            log::error!("Selecting boot slot {slot} failed: {err}");
            return;
        }
        log::info!("Rebooting into slot {slot}");
        esp_hal::system::software_reset();
    }

    /// Minute display refresh. Reading the clock here also keeps it from
    /// missing tick counter wraps.
    fn refresh(&mut self) {
        let fields = self.clock.breakdown_now();
        log::info!("Time to display: {:02}:{:02}", fields.hour, fields.minute);
        self.refresh_at = Instant::now() + Duration::from_secs(60 - fields.second as u64);
    }
}

async fn sync_timeout(deadline: Option<(SessionId, Instant)>) -> SessionId {
    match deadline {
        Some((session, at)) => {
            Timer::at(at).await;
            session
        }
        None => pending().await,
    }
}

async fn resync_due(ticker: &mut Option<Ticker>) {
    match ticker {
        Some(ticker) => ticker.next().await,
        None => pending().await,
    }
}
