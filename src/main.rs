#![no_std]
#![no_main]

use core::convert::Infallible;

use embassy_executor::{SpawnError, Spawner};
use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use net_dot_clock::{
    config::{Config, NtpClientConfig, UpgradeConfig, WiFiConfig},
    mk_static,
    ota::{UpdateEngine, store::FlashUpgradeFlag},
    system::time::SoftwareClock,
};
use thiserror::Error;

use crate::{
    boot::{BootError, OtaBootSelector, Partitions},
    bsp::{Board, BoardError},
    runtime::Runtime,
    wifi::{WifiError, WifiInterface},
};

esp_bootloader_esp_idf::esp_app_desc!();

mod boot;
mod bsp;
mod runtime;
mod transport;
mod wifi;

#[derive(Debug, Error)]
enum MainError {
    #[error("Board error: {0}")]
    Board(#[from] BoardError),
    #[error("Boot error: {0}")]
    Boot(#[from] BootError),
    #[error("WiFi error: {0}")]
    Wifi(#[from] WifiError),
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),
    #[error("{0}")]
    Core(#[from] net_dot_clock::Error),
}

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) -> ! {
    let never = fallible_main(spawner)
        .await
        .inspect_err(|err| log::error!("Main failed: {err}"))
        .unwrap();
    match never {}
}

async fn fallible_main(spawner: Spawner) -> Result<Infallible, MainError> {
    esp_println::logger::init_logger_from_env();
    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(size: 72 * 1024);

    let mut board = Board::init(peripherals)?;
    let config: &'static Config = mk_static!(Config, build_config());
    log::info!("net-dot-clock {}", config.version());

    let mut flash = board.flash();
    let partitions = Partitions::read(&mut flash)?;
    let layout = partitions.flash_layout()?;
    let mut boot = OtaBootSelector::new(partitions, flash);
    let active = boot.active_slot()?;
    log::info!("Running from slot {active}");

    let upgrade = UpdateEngine::new(
        config.upgrade(),
        config.version(),
        layout,
        active,
        board.flash(),
        FlashUpgradeFlag::new(board.flash(), layout.upgrade_record_offset()),
    );
    let clock = SoftwareClock::new(runtime::hardware_ticks as fn() -> u32);
    let mut runtime = Runtime::new(config, clock, upgrade, boot);
    runtime.inspect_boot_flag().await;

    let wifi_interfaces = board
        .take_wifi_interfaces()
        .ok_or(net_dot_clock::Error::other("No WiFi interface"))?;
    let wifi_controller = board
        .take_wifi_controller()
        .ok_or(net_dot_clock::Error::other("No WiFi controller"))?;
    let wifi = WifiInterface::init(
        &spawner,
        board.rng(),
        wifi_interfaces,
        wifi_controller,
        config.wifi(),
    )?;

    spawner.spawn(transport::udp::sntp_task(wifi.stack()))?;
    spawner.spawn(transport::tcp::upgrade_task(wifi.stack()))?;

    runtime.run().await
}

/// Credentials and the update server are baked in at build time; the NTP
/// server and the version key can be overridden the same way.
fn build_config() -> Config {
    let mut upgrade = UpgradeConfig::new(env!("UPGRADE_HOST"), env!("UPGRADE_PATH"));
    if let Some(key) = option_env!("UPGRADE_VERSION_KEY") {
        upgrade = upgrade.with_version_key(key);
    }

    let config = Config::new(WiFiConfig::new(env!("SSID"), env!("PASSWORD")), upgrade);
    match option_env!("NTP_SERVER") {
        Some(server) => config.with_ntp_client(NtpClientConfig::new(server)),
        None => config,
    }
}
