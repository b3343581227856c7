use embassy_executor::{SpawnError, Spawner};
use embassy_net::{Runner, Stack, StackResources};
use embassy_time::{Duration, Ticker, Timer};
use esp_hal::rng::Rng;
use esp_wifi::wifi::{
    ClientConfiguration, Configuration, Interfaces, WifiController, WifiDevice, WifiEvent, WifiState,
};
use net_dot_clock::{config::WiFiConfig, mk_static};
use thiserror::Error;

use crate::runtime::{EVENTS, Event};

#[derive(Debug, Error)]
pub enum WifiError {
    #[error("Spawn error: {0}")]
    SpawnError(#[from] SpawnError),
}

pub type WifiResult<T> = Result<T, WifiError>;

pub struct WifiInterface {
    stack: Stack<'static>,
}

impl WifiInterface {
    /// Brings up the station interface. Association happens in the background;
    /// [`Event::NetworkReady`] is posted once an address is configured.
    pub fn init(
        spawner: &Spawner,
        rng: Rng,
        interfaces: Interfaces<'static>,
        controller: WifiController<'static>,
        config: &'static WiFiConfig,
    ) -> WifiResult<Self> {
        let wifi_interface = interfaces.sta;

        let net_config = embassy_net::Config::dhcpv4(Default::default());

        let seed = (rng.random() as u64) << 32 | rng.random() as u64;

        // DNS, UDP for SNTP and TCP for upgrades.
        let (stack, runner) = embassy_net::new(
            wifi_interface,
            net_config,
            mk_static!(StackResources<4>, StackResources::<4>::new()),
            seed,
        );

        spawner.spawn(connection(controller, config))?;
        spawner.spawn(net_task(runner))?;
        spawner.spawn(link_monitor(stack))?;

        Ok(Self { stack })
    }

    pub fn stack(&self) -> Stack<'static> {
        self.stack
    }
}

#[embassy_executor::task]
async fn connection(mut controller: WifiController<'static>, config: &'static WiFiConfig) {
    log::debug!("start connection task");
    log::debug!("Device capabilities: {:?}", controller.capabilities());
    loop {
        if esp_wifi::wifi::wifi_state() == WifiState::StaConnected {
            // wait until we're no longer connected
            controller.wait_for_event(WifiEvent::StaDisconnected).await;
            Timer::after(config.reconnect_timeout()).await
        }

        if !matches!(controller.is_started(), Ok(true)) {
            let client_config = Configuration::Client(ClientConfiguration {
                ssid: config.ssid().into(),
                password: config.password().into(),
                ..Default::default()
            });
            if let Err(err) = controller.set_configuration(&client_config) {
                log::error!("Setting WiFi config failed: {err:?}");
                Timer::after(config.reconnect_timeout()).await;
                continue;
            }

            log::info!("Starting wifi");
            if let Err(err) = controller.start_async().await {
                log::error!("Starting WiFi controller failed: {err:?}");
                Timer::after(config.reconnect_timeout()).await;
                continue;
            }
            log::info!("Wifi started!");
        }
        log::info!("About to connect to {}...", config.ssid());

        match controller.connect_async().await {
            Ok(_) => log::info!("Wifi connected!"),
            Err(e) => {
                log::error!("Failed to connect to wifi: {e:?}");
                Timer::after(config.reconnect_timeout()).await
            }
        }
    }
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

/// Turns link and DHCP state changes into network events.
#[embassy_executor::task]
async fn link_monitor(stack: Stack<'static>) {
    let mut ticker = Ticker::every(Duration::from_millis(500));
    let mut ready = false;
    loop {
        ticker.next().await;

        let address = stack
            .config_v4()
            .filter(|_| stack.is_link_up())
            .map(|config| config.address);
        match (ready, address) {
            (false, Some(address)) => {
                log::info!("Got IP: {address}");
                ready = true;
                EVENTS.send(Event::NetworkReady).await;
            }
            (true, None) => {
                log::warn!("Network lost");
                ready = false;
                EVENTS.send(Event::NetworkLost).await;
            }
            _ => {}
        }
    }
}
