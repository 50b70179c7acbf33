use crate::transport::ServerAddress;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "OBS_REMOTE_";
pub const APP_DIR: &str = "ObsRemoteBridge";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub obs: ObsConfig,
    pub server: ServerConfig,
    pub presenter: PresenterConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObsConfig {
    pub address: String,
    pub password_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub metrics_interval_ms: u64,
    pub auto_connect: bool,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:4455".to_string(),
            password_key: None,
            connect_timeout_ms: 5000,
            metrics_interval_ms: 2000,
            auto_connect: false,
        }
    }
}

impl ObsConfig {
    pub fn server_address(&self) -> Result<ServerAddress, Box<dyn std::error::Error>> {
        Ok(self.address.parse()?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enable: bool,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            port: 7071,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PresenterConfig {
    pub tick_ms: u64,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self { tick_ms: 500 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unreadable config file"
                ),
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // OBS settings
        if let Ok(val) = env::var(format!("{}OBS_ADDRESS", ENV_PREFIX)) {
            self.obs.address = val;
        }
        if let Ok(val) = env::var(format!("{}OBS_PASSWORD_KEY", ENV_PREFIX)) {
            self.obs.password_key = Some(val);
        }
        if let Ok(val) = env::var(format!("{}OBS_CONNECT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.obs.connect_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}OBS_METRICS_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.obs.metrics_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}OBS_AUTO_CONNECT", ENV_PREFIX)) {
            self.obs.auto_connect = val.parse().unwrap_or(false);
        }

        // Control surface
        if let Ok(val) = env::var(format!("{}SERVER_ENABLE", ENV_PREFIX)) {
            self.server.enable = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        if let Ok(val) = env::var(format!("{}PRESENTER_TICK_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.presenter.tick_ms = ms;
            }
        }

        if let Ok(val) = env::var(format!("{}VAULT_PATH", ENV_PREFIX)) {
            self.vault.path = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if let Err(err) = self.obs.server_address() {
            return Err(format!("obs.address is invalid: {err}").into());
        }
        if self.obs.connect_timeout_ms < 100 {
            return Err("obs.connect_timeout_ms must be >= 100".into());
        }
        if self.obs.metrics_interval_ms < 250 {
            return Err("obs.metrics_interval_ms must be >= 250".into());
        }
        if self.server.enable && self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.presenter.tick_ms == 0 {
            return Err("presenter.tick_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

pub fn app_data_dir() -> PathBuf {
    let base = env::var("APPDATA")
        .or_else(|_| env::var("XDG_CONFIG_HOME"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join(APP_DIR)
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    app_data_dir().join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
