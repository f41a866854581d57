use crate::prelude::*;
use crate::planner::{DEFAULT_MAX_BLOCK_SIZE, MODBUS_MAX_READ};

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use serde_yaml;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverters: Vec<Inverter>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional path to append every snapshot to, one JSON object per line
    pub datalog_file: Option<String>,

    /// Optional register catalog; the built-in Deye hybrid catalog otherwise
    pub catalog_file: Option<String>,

    #[serde(default)]
    pub derived: Derived,
}

// Inverter {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    pub port: Option<u16>,
    /// Logger serial as printed on the stick, quoted or not.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub serial: u32,

    pub slave_id: Option<u8>,
    pub poll_interval_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_block_size: Option<u16>,
    pub backoff_initial_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub use_tcp_nodelay: Option<bool>,
    pub tcp_keepalive_secs: Option<u64>,
}
impl Inverter {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8899)
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id.unwrap_or(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(30))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.unwrap_or(10))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.unwrap_or(10))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(10))
    }

    pub fn max_block_size(&self) -> u16 {
        self.max_block_size.unwrap_or(DEFAULT_MAX_BLOCK_SIZE)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs.unwrap_or(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs.unwrap_or(60))
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }

    /// `None` when set to 0.
    pub fn tcp_keepalive(&self) -> Option<Duration> {
        match self.tcp_keepalive_secs.unwrap_or(60) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
} // }}}

// Derived {{{
/// Constants for the metrics computed from each snapshot.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Derived {
    /// kg of CO2 avoided per kWh of PV
    #[serde(default = "Derived::default_co2_factor")]
    pub co2_factor: f64,
    #[serde(default = "Derived::default_battery_capacity_kwh")]
    pub battery_capacity_kwh: f64,
    #[serde(default = "Derived::default_rated_cycles")]
    pub rated_cycles: f64,
}

impl Default for Derived {
    fn default() -> Self {
        Self {
            co2_factor: Self::default_co2_factor(),
            battery_capacity_kwh: Self::default_battery_capacity_kwh(),
            rated_cycles: Self::default_rated_cycles(),
        }
    }
}

impl Derived {
    fn default_co2_factor() -> f64 {
        0.256
    }

    fn default_battery_capacity_kwh() -> f64 {
        5.12
    }

    fn default_rated_cycles() -> f64 {
        6000.0
    }
} // }}}

#[derive(Clone)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn inverters(&self) -> Vec<Inverter> {
        self.config.inverters.clone()
    }

    pub fn enabled_inverters(&self) -> Vec<Inverter> {
        self.inverters().into_iter().filter(|i| i.enabled()).collect()
    }

    pub fn loglevel(&self) -> String {
        self.config.loglevel.clone()
    }

    pub fn datalog_file(&self) -> Option<String> {
        self.config.datalog_file.clone()
    }

    pub fn catalog_file(&self) -> Option<String> {
        self.config.catalog_file.clone()
    }

    pub fn derived(&self) -> Derived {
        self.config.derived.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config = Self::from_yaml(&content)?;

        info!("Configuration loaded successfully:");
        info!(
            "  Inverters: {} configured, {} enabled",
            config.inverters.len(),
            config.inverters.iter().filter(|i| i.enabled).count()
        );
        for (i, inv) in config.inverters.iter().enumerate() {
            info!("    Inverter[{}]:", i);
            info!("      Enabled: {}", inv.enabled);
            info!("      Host: {}:{}", inv.host, inv.port());
            info!("      Logger Serial: {}", inv.serial);
            info!("      Slave ID: {}", inv.slave_id());
            info!("      Poll Interval: {:?}", inv.poll_interval());
            info!("      Read Timeout: {:?}", inv.read_timeout());
            info!("      Write Timeout: {:?}", inv.write_timeout());
            info!("      Connect Timeout: {:?}", inv.connect_timeout());
            info!("      Max Block Size: {}", inv.max_block_size());
            info!("      Backoff: {:?} .. {:?}", inv.backoff_initial(), inv.backoff_max());
            info!("      TCP NoDelay: {}", inv.use_tcp_nodelay());
        }
        info!(
            "  Register Catalog: {}",
            config.catalog_file.as_deref().unwrap_or("built-in")
        );
        info!("  Datalog File: {}", config.datalog_file.as_deref().unwrap_or("disabled"));
        info!("  Log Level: {}", config.loglevel);

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (i, inv) in self.inverters.iter().enumerate() {
            if !inv.enabled {
                continue;
            }
            if inv.port() == 0 {
                bail!("inverter[{}].port must be between 1 and 65535", i);
            }
            if inv.host.is_empty() {
                bail!("inverter[{}].host cannot be empty", i);
            }
            if inv.serial == 0 {
                bail!("inverter[{}].serial cannot be 0", i);
            }
            if inv.read_timeout().is_zero() || inv.write_timeout().is_zero() || inv.connect_timeout().is_zero() {
                bail!("inverter[{}] timeouts must be at least 1 second", i);
            }
            if inv.poll_interval().is_zero() {
                bail!("inverter[{}].poll_interval_secs must be at least 1", i);
            }
            if !(1..=MODBUS_MAX_READ).contains(&inv.max_block_size()) {
                bail!(
                    "inverter[{}].max_block_size must be between 1 and {}",
                    i,
                    MODBUS_MAX_READ
                );
            }
            if inv.backoff_max() < inv.backoff_initial() {
                bail!("inverter[{}].backoff_max_secs is below backoff_initial_secs", i);
            }
        }

        if self.derived.battery_capacity_kwh <= 0.0 || self.derived.rated_cycles <= 0.0 {
            bail!("derived.battery_capacity_kwh and derived.rated_cycles must be positive");
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
