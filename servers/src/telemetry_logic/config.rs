use clap::{Parser, ValueEnum};
use lib_common::telemetry::{ControlBounds, EngineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_telemetry.conf";

/// Where readings are persisted.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite database file at `dbPath`.
    Sqlite,
    /// Process memory only; history is lost on restart.
    Memory,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Realtime sensor telemetry server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TELEMETRY_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMETRY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TELEMETRY_STORAGE", value_enum, help = "Storage backend for readings.")]
    pub storage: Option<StorageBackend>,

    #[clap(long, env = "TELEMETRY_DB_PATH", help = "SQLite database file.")]
    pub db_path: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_GENERATION_PERIOD_MS", help = "Milliseconds between generated readings.")]
    pub generation_period_ms: Option<u64>,

    #[clap(long, env = "TELEMETRY_TRIM_PERIOD_MS", help = "Milliseconds between retention trims.")]
    pub trim_period_ms: Option<u64>,

    #[clap(long, env = "TELEMETRY_RETENTION", help = "Readings kept by each retention trim.")]
    pub retention: Option<usize>,

    #[clap(long, env = "TELEMETRY_HISTORY_LEN", help = "Readings returned by the history endpoint.")]
    pub history_len: Option<usize>,

    #[clap(long, env = "TELEMETRY_REPLAY_LEN", help = "Readings replayed to a new subscriber.")]
    pub replay_len: Option<usize>,

    #[clap(long, env = "TELEMETRY_FANOUT_CAPACITY", help = "Readings buffered between generator and fanout.")]
    pub fanout_capacity: Option<usize>,

    #[clap(long, env = "TELEMETRY_SPEED_MIN", help = "Lowest allowed speed.")]
    pub speed_min: Option<f64>,

    #[clap(long, env = "TELEMETRY_SPEED_MAX", help = "Highest allowed speed.")]
    pub speed_max: Option<f64>,

    #[clap(long, env = "TELEMETRY_SPEED_INITIAL", help = "Speed at startup.")]
    pub speed_initial: Option<f64>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub storage: StorageBackend,
    pub db_path: PathBuf,
    pub engine: EngineConfig,
}

impl Config {
    fn defaults() -> Self {
        let engine = EngineConfig::default();
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            storage: Some(StorageBackend::Sqlite),
            db_path: Some(PathBuf::from("./data/sensors.db")),
            generation_period_ms: Some(engine.generation_period_ms),
            trim_period_ms: Some(engine.trim_period_ms),
            retention: Some(engine.retention),
            history_len: Some(engine.history_len),
            replay_len: Some(engine.replay_len),
            fanout_capacity: Some(engine.fanout_capacity),
            speed_min: Some(engine.control.min),
            speed_max: Some(engine.control.max),
            speed_initial: Some(engine.control.initial),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            storage: other.storage.or(self.storage),
            db_path: other.db_path.or(self.db_path),
            generation_period_ms: other.generation_period_ms.or(self.generation_period_ms),
            trim_period_ms: other.trim_period_ms.or(self.trim_period_ms),
            retention: other.retention.or(self.retention),
            history_len: other.history_len.or(self.history_len),
            replay_len: other.replay_len.or(self.replay_len),
            fanout_capacity: other.fanout_capacity.or(self.fanout_capacity),
            speed_min: other.speed_min.or(self.speed_min),
            speed_max: other.speed_max.or(self.speed_max),
            speed_initial: other.speed_initial.or(self.speed_initial),
        }
    }

    fn resolve(self) -> Settings {
        let engine = EngineConfig::default();
        let control = ControlBounds {
            min: self.speed_min.unwrap_or(engine.control.min),
            max: self.speed_max.unwrap_or(engine.control.max),
            initial: self.speed_initial.unwrap_or(engine.control.initial),
        };

        Settings {
            port: self.port.unwrap_or(8080),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            storage: self.storage.unwrap_or(StorageBackend::Sqlite),
            db_path: self.db_path.unwrap_or_else(|| PathBuf::from("./data/sensors.db")),
            engine: EngineConfig {
                generation_period_ms: self.generation_period_ms.unwrap_or(engine.generation_period_ms),
                trim_period_ms: self.trim_period_ms.unwrap_or(engine.trim_period_ms),
                retention: self.retention.unwrap_or(engine.retention),
                history_len: self.history_len.unwrap_or(engine.history_len),
                replay_len: self.replay_len.unwrap_or(engine.replay_len),
                fanout_capacity: self.fanout_capacity.unwrap_or(engine.fanout_capacity),
                control,
            },
        }
    }
}

/// A message raised while loading settings, logged once the logger is up.
pub type Notice = (log::Level, String);

/// Defaults, overridden by the JSON config file, overridden by environment
/// variables and command-line arguments.
pub fn load_config() -> (Settings, Vec<Notice>) {
    load_config_from(Config::parse())
}

pub fn load_config_from(cli: Config) -> (Settings, Vec<Notice>) {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut notices = Vec::new();
    let mut current = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path, &mut notices) {
        current = current.merge(file_config);
    }

    (current.merge(cli).resolve(), notices)
}

fn read_config_file(path: &Path, notices: &mut Vec<Notice>) -> Option<Config> {
    if !path.exists() {
        notices.push((
            log::Level::Info,
            format!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display()),
        ));
        return None;
    }

    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            notices.push((
                log::Level::Warn,
                format!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e),
            ));
            return None;
        }
    };

    match serde_json::from_str::<Config>(&config_str) {
        Ok(file_config) => Some(file_config),
        Err(e) => {
            notices.push((
                log::Level::Warn,
                format!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e),
            ));
            None
        }
    }
}
