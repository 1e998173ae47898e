use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use clap::Parser;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "FRITZ2MQTT";

#[derive(Parser, Debug)]
#[command(version, about = "Fritz!Box call-monitor to MQTT bridge")]
pub struct Cli {
    /// Path to a TOML configuration file; environment variables override it.
    #[clap(long)]
    pub conf: Option<String>,
    /// Validate the configuration and exit.
    #[clap(long)]
    pub config_test: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
    pub broker: BrokerConfig,
    pub pbx: PbxConfig,
    pub app: AppConfig,
    pub db: DbConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
    pub qos: u8,
    pub retain: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// Connect timeout in seconds.
    pub connect_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PbxConfig {
    pub country_code: String,
    pub local_area_code: String,
    pub msn: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_file: Option<String>,
    /// IANA zone name used for record timestamps.
    pub timezone: String,
    pub call_history_size: usize,
    /// Delay in seconds before re-dialing the router after a lost connection.
    pub reconnect_delay: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DbConfig {
    pub data_dir: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: "fritz.box".to_string(),
            port: 1012,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "fritz2mqtt".to_string(),
            topic_prefix: "fritz/callmonitor".to_string(),
            qos: 1,
            retain: true,
            keep_alive: 60,
            connect_timeout: 30,
        }
    }
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            country_code: "49".to_string(),
            local_area_code: String::new(),
            msn: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            timezone: "Europe/Berlin".to_string(),
            call_history_size: 50,
            reconnect_delay: 10,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            broker: BrokerConfig::default(),
            pbx: PbxConfig::default(),
            app: AppConfig::default(),
            db: DbConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config.apply_env())
    }

    /// Builds a configuration from defaults and `FRITZ2MQTT_*` variables.
    pub fn from_env() -> Self {
        Config::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        env_set(&mut self.router.host, "ROUTER_HOST");
        env_parse(&mut self.router.port, "ROUTER_PORT");
        env_set(&mut self.broker.host, "BROKER_HOST");
        env_parse(&mut self.broker.port, "BROKER_PORT");
        env_set_opt(&mut self.broker.username, "BROKER_USERNAME");
        env_set_opt(&mut self.broker.password, "BROKER_PASSWORD");
        env_set(&mut self.broker.client_id, "BROKER_CLIENT_ID");
        env_set(&mut self.broker.topic_prefix, "BROKER_TOPIC_PREFIX");
        env_parse(&mut self.broker.qos, "BROKER_QOS");
        env_parse(&mut self.broker.retain, "BROKER_RETAIN");
        env_parse(&mut self.broker.keep_alive, "BROKER_KEEP_ALIVE");
        env_parse(&mut self.broker.connect_timeout, "BROKER_CONNECT_TIMEOUT");
        env_set(&mut self.pbx.country_code, "PBX_COUNTRY_CODE");
        env_set(&mut self.pbx.local_area_code, "PBX_LOCAL_AREA_CODE");
        if let Some(value) = env_lookup("PBX_MSN") {
            self.pbx.msn = value
                .split(',')
                .map(|msn| msn.trim().to_string())
                .filter(|msn| !msn.is_empty())
                .collect();
        }
        env_set(&mut self.app.log_level, "APP_LOG_LEVEL");
        env_set_opt(&mut self.app.log_file, "APP_LOG_FILE");
        env_set(&mut self.app.timezone, "APP_TIMEZONE");
        env_parse(&mut self.app.call_history_size, "APP_CALL_HISTORY_SIZE");
        env_parse(&mut self.app.reconnect_delay, "APP_RECONNECT_DELAY");
        env_set(&mut self.db.data_dir, "DB_DATA_DIR");
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.router.host.is_empty() {
            return Err(anyhow!("router host cannot be empty"));
        }
        if self.router.port == 0 {
            return Err(anyhow!("router port cannot be zero"));
        }
        if self.broker.host.is_empty() {
            return Err(anyhow!("broker host cannot be empty"));
        }
        if self.broker.port == 0 {
            return Err(anyhow!("broker port cannot be zero"));
        }
        if self.broker.qos > 2 {
            return Err(anyhow!("broker qos must be 0, 1 or 2, got {}", self.broker.qos));
        }
        if self.app.call_history_size == 0 {
            return Err(anyhow!("call history size must be greater than zero"));
        }
        self.timezone()?;
        if self.db.data_dir.is_empty() {
            return Err(anyhow!("database data directory cannot be empty"));
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.app
            .timezone
            .parse::<Tz>()
            .map_err(|_| anyhow!("invalid timezone: {}", self.app.timezone))
    }

    pub fn debug_topics_enabled(&self) -> bool {
        self.app.log_level.eq_ignore_ascii_case("debug")
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, key))
        .ok()
        .filter(|value| !value.is_empty())
}

fn env_set(target: &mut String, key: &str) {
    if let Some(value) = env_lookup(key) {
        *target = value;
    }
}

fn env_set_opt(target: &mut Option<String>, key: &str) {
    if let Some(value) = env_lookup(key) {
        *target = Some(value);
    }
}

fn env_parse<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Some(value) = env_lookup(key) {
        if let Ok(parsed) = value.parse::<T>() {
            *target = parsed;
        }
    }
}
