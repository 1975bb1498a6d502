/*
* VM Lifecycle Manager Configuration
* ----------------------------------
* @project: vm-lifecycle-manager
*
* Hierarchical configuration (lowest to highest priority):
*
* 1. Hardcoded defaults (generate_default_config)
* 2. config/default.toml (optional, because fresh checkouts exist)
* 3. config/local.toml (optional, ur machine-specific secrets live here)
* 4. --config <file> from the command line
* 5. Environment variables, VM_MANAGER__SECTION__KEY (SCREAMING_SNAKE_CASE gang)
*
* Nothing in here is a process-wide singleton: the loaded Settings struct is
* handed to whoever needs it. Pass it around like a hot potato.
*/

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
    pub metrics: MetricsSettings,
    pub limits: LimitsSettings,
    pub simulation: SimulationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// `debug` exposes internal error details to clients, `release` does not.
    pub mode: String,
    pub api_prefix: String,
    pub request_timeout_secs: u64,
    pub body_limit_bytes: usize,
    pub cors: CorsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsSettings {
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Empty keeps everything in memory; `sqlite:` URLs go through sqlx.
    pub url: String,
    pub max_connections: u32,
    pub seed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub enabled: bool,
    pub api_key_header: String,
    // config drops empty arrays from the defaults layer.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSettings {
    pub max_cpu_cores: u32,
    pub max_ram_mb: u32,
    pub max_disk_gb: u32,
    pub max_vms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub stats: StatsRanges,
}

/// Bounds for the synthetic telemetry. Pure simulation knobs, tweak freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRanges {
    pub cpu_percent: PercentRange,
    pub ram_percent: PercentRange,
    pub disk_percent: PercentRange,
    pub max_rx_delta_bytes: u64,
    pub max_tx_delta_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PercentRange {
    pub min: f64,
    pub max: f64,
}

impl PercentRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn is_valid(&self) -> bool {
        self.min >= 0.0 && self.max <= 100.0 && self.min < self.max
    }
}

impl Default for StatsRanges {
    fn default() -> Self {
        Self {
            cpu_percent: PercentRange::new(10.0, 90.0),
            ram_percent: PercentRange::new(20.0, 90.0),
            disk_percent: PercentRange::new(10.0, 60.0),
            max_rx_delta_bytes: 1024 * 1024,
            max_tx_delta_bytes: 512 * 1024,
        }
    }
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_cpu_cores: 64,
            max_ram_mb: 262_144,
            max_disk_gb: 10_240,
            max_vms: 1000,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst: 200,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        generate_default_config()
    }
}

impl Settings {
    /// Loads `config/default.toml` + `config/local.toml` (both optional) on
    /// top of the defaults. `CONFIG_PATH` moves the directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        let config = Self::base_builder()?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(Self::environment())
            .build()?;

        Self::finish(config)
    }

    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        let config = Self::base_builder()?
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?;

        Self::finish(config)
    }

    fn base_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = Config::try_from(&generate_default_config())?;
        Ok(Config::builder().add_source(defaults))
    }

    fn environment() -> Environment {
        Environment::with_prefix("VM_MANAGER")
            .prefix_separator("__")
            .separator("__")
    }

    fn finish(config: Config) -> Result<Self, ConfigError> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message("server.port must be non-zero".into()));
        }
        if !self.server.api_prefix.starts_with('/') {
            return Err(ConfigError::Message(
                "server.api_prefix must start with '/'".into(),
            ));
        }
        let limits = &self.limits;
        if limits.max_cpu_cores == 0
            || limits.max_ram_mb == 0
            || limits.max_disk_gb == 0
            || limits.max_vms == 0
        {
            return Err(ConfigError::Message("limits must all be non-zero".into()));
        }
        if self.auth.enabled && self.auth.api_keys.is_empty() {
            return Err(ConfigError::Message(
                "auth.enabled requires at least one entry in auth.api_keys".into(),
            ));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.requests_per_second == 0 || self.rate_limit.burst == 0)
        {
            return Err(ConfigError::Message(
                "rate_limit.requests_per_second and rate_limit.burst must be non-zero".into(),
            ));
        }
        let stats = &self.simulation.stats;
        for (name, range) in [
            ("cpu_percent", stats.cpu_percent),
            ("ram_percent", stats.ram_percent),
            ("disk_percent", stats.disk_percent),
        ] {
            if !range.is_valid() {
                return Err(ConfigError::Message(format!(
                    "simulation.stats.{} must satisfy 0 <= min < max <= 100",
                    name
                )));
            }
        }
        if stats.max_rx_delta_bytes == 0 || stats.max_tx_delta_bytes == 0 {
            return Err(ConfigError::Message(
                "simulation.stats network deltas must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn is_debug(&self) -> bool {
        matches!(self.server.mode.as_str(), "debug" | "development")
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        server: ServerSettings {
            host: "0.0.0.0".to_string(),
            port: 8080,
            mode: "debug".to_string(),
            api_prefix: "/api/v1".to_string(),
            request_timeout_secs: 30,
            body_limit_bytes: 1024 * 1024,
            cors: CorsSettings {
                allow_origins: vec!["*".to_string()],
            },
        },
        database: DatabaseSettings {
            url: String::new(),
            max_connections: 5,
            seed: false,
        },
        logging: LoggingSettings {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
        auth: AuthSettings {
            enabled: false,
            api_key_header: "X-API-Key".to_string(),
            api_keys: Vec::new(),
        },
        rate_limit: RateLimitSettings::default(),
        metrics: MetricsSettings {
            enabled: true,
            path: "/metrics".to_string(),
        },
        limits: LimitsSettings::default(),
        simulation: SimulationSettings::default(),
    }
}
