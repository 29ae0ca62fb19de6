use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

fn default_prefer_local() -> bool {
    true
}

fn default_local_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    8
}

fn default_base_retry_delay_secs() -> u64 {
    1
}

fn default_max_retry_delay_secs() -> u64 {
    300
}

/// Engine configuration, loaded from `config.toml` and supplied to the
/// broker by whatever shell embeds it (CLI, tray daemon, desktop app).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// When set, the local service is the sole first connection attempt,
    /// even if its last probe failed.
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,
    #[serde(default = "default_local_url")]
    pub local_url: String,
    /// Cloud relay base URL. The relay candidate is only built when this is set.
    pub cloud_relay_url: Option<String>,
    #[serde(default)]
    pub enable_public_tunnel: bool,
    pub public_tunnel_url: Option<String>,
    /// Bearer token for the tunnel ingress. The local transport never sees it.
    pub public_tunnel_auth_token: Option<String>,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    /// `None` retries forever; `Some(n)` stops after n failed cycles per candidate.
    pub max_retry_attempts: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefer_local: default_prefer_local(),
            local_url: default_local_url(),
            cloud_relay_url: None,
            enable_public_tunnel: false,
            public_tunnel_url: None,
            public_tunnel_auth_token: None,
            health_check_interval_secs: default_health_check_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            base_retry_delay_secs: default_base_retry_delay_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            max_retry_attempts: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, Box<dyn std::error::Error>> {
        let config_path = Self::get_config_path();
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            // First run: write the defaults out.
            let config = Config::default();
            config.save_to_path(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from_path(config_path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let config_path = Self::get_config_path();
        self.save_to_path(&config_path)
    }

    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(config_path, contents)?;
        Ok(())
    }

    fn get_config_path() -> PathBuf {
        let proj_dirs = ProjectDirs::from("org", "llmlink", "llmlink")
            .expect("Failed to determine config directory");
        proj_dirs.config_dir().join("config.toml")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.base_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}
