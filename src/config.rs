use embassy_time::Duration;

use crate::ota::FirmwareVersion;

pub struct Config {
    wifi: WiFiConfig,
    ntp_client: NtpClientConfig,
    upgrade: UpgradeConfig,
    version: FirmwareVersion,
}

impl Config {
    pub fn new(wifi: WiFiConfig, upgrade: UpgradeConfig) -> Self {
        Self {
            wifi,
            ntp_client: Default::default(),
            upgrade,
            version: FirmwareVersion::running(),
        }
    }

    pub fn with_ntp_client(mut self, ntp_client: NtpClientConfig) -> Self {
        self.ntp_client = ntp_client;
        self
    }

    pub fn wifi(&self) -> &WiFiConfig {
        &self.wifi
    }

    pub fn ntp_client(&self) -> &NtpClientConfig {
        &self.ntp_client
    }

    pub fn upgrade(&self) -> &UpgradeConfig {
        &self.upgrade
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version
    }
}

pub struct WiFiConfig {
    ssid: &'static str,
    password: &'static str,
    reconnect_timeout: Duration,
}

impl WiFiConfig {
    pub fn new(ssid: &'static str, password: &'static str) -> Self {
        Self {
            ssid,
            password,
            reconnect_timeout: Duration::from_secs(5),
        }
    }

    pub fn ssid(&self) -> &'static str {
        self.ssid
    }

    pub fn password(&self) -> &'static str {
        self.password
    }

    pub fn reconnect_timeout(&self) -> Duration {
        self.reconnect_timeout
    }
}

pub struct NtpClientConfig {
    server: &'static str,
    port: u16,
    timeout: Duration,
    query_period: Duration,
}

impl NtpClientConfig {
    pub fn new(server: &'static str) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    pub fn server(&self) -> &'static str {
        self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// How long a request may stay unanswered before the session is dropped.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn query_period(&self) -> Duration {
        self.query_period
    }
}

impl Default for NtpClientConfig {
    fn default() -> Self {
        Self {
            server: "uk.pool.ntp.org",
            port: 123,
            timeout: Duration::from_secs(5),
            query_period: Duration::from_secs(60 * 60),
        }
    }
}

pub struct UpgradeConfig {
    host: &'static str,
    port: u16,
    path: &'static str,
    version_key: &'static str,
    user_agent: &'static str,
}

impl UpgradeConfig {
    /// `path` is the directory prefix on the server, including the trailing `/`.
    pub fn new(host: &'static str, path: &'static str) -> Self {
        Self {
            host,
            port: 80,
            path,
            version_key: "Upgrade-Version",
            user_agent: concat!("net-dot-clock/", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_version_key(mut self, version_key: &'static str) -> Self {
        self.version_key = version_key;
        self
    }

    pub fn host(&self) -> &'static str {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn version_key(&self) -> &'static str {
        self.version_key
    }

    pub fn user_agent(&self) -> &'static str {
        self.user_agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_keep_other_defaults() {
        let upgrade = UpgradeConfig::new("fw.example.net", "/clock/").with_version_key("X-Build");
        assert_eq!(upgrade.version_key(), "X-Build");
        assert_eq!(upgrade.port(), 80);

        let config = Config::new(WiFiConfig::new("ssid", "secret"), upgrade)
            .with_ntp_client(NtpClientConfig::new("time.example.net"));
        let ntp = config.ntp_client();
        assert_eq!(ntp.server(), "time.example.net");
        assert_eq!(ntp.port(), 123);
        assert_eq!(ntp.timeout(), Duration::from_secs(5));
        assert_eq!(ntp.query_period(), Duration::from_secs(3600));
        assert_eq!(config.upgrade().host(), "fw.example.net");
    }
}
