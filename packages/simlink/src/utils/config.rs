// packages/simlink/src/utils/config.rs
//! Layered configuration
//!
//! Sources, lowest precedence first: built-in defaults, `simlink.{yaml,toml,json}`
//! in the working directory, the file named by `SIMLINK_CONFIG`, then
//! `SIMLINK__SECTION__KEY` environment variables.
//!
//! `engine.settings` keys keep the spelling of the file they came from; keys
//! that only appear in environment variables arrive lower-cased.

use crate::container::state::HistoryCombining;
use crate::orchestrator::settings::SimulationSettings;
use crate::utils::errors::{Result, SimlinkError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Extensions probed for a config file named without one
const CONFIG_EXTENSIONS: [&str; 4] = ["yaml", "yml", "json", "toml"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimlinkConfig {
    pub engine: EngineSettings,
    pub channel: ChannelSettings,
    pub container: ContainerSettings,
    pub logging: LoggingSettings,
}

/// Simulation engine subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Program to launch (path or name looked up in PATH)
    pub program: String,

    /// Fixed arguments placed before the rendered settings
    pub args: Vec<String>,

    /// Working directory for the engine
    pub work_dir: Option<PathBuf>,

    /// Stream the engine's stdout to ours
    pub show_output: bool,

    /// Configuration record handed to the engine
    pub settings: SimulationSettings,

    /// Grace period before escalating to signals on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: "simlink-mock-engine".to_string(),
            args: vec![],
            work_dir: None,
            show_output: false,
            settings: SimulationSettings::default(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl EngineSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Shared region and wait bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Directory holding region files
    pub shm_dir: PathBuf,

    /// How long to wait for the engine to expose its region
    pub attach_timeout_ms: u64,

    /// Upper bound on any single blocking handoff
    pub peer_timeout_ms: u64,

    /// Sleep between polls once spinning is exhausted
    pub poll_interval_us: u64,

    /// How often a waiter checks peer liveness
    pub liveness_interval_ms: u64,

    /// Answer the engine's init request right after attaching
    pub init_handshake: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            attach_timeout_ms: 10_000,
            peer_timeout_ms: 30_000,
            poll_interval_us: 100,
            liveness_interval_ms: 10,
            init_handshake: true,
        }
    }
}

impl ChannelSettings {
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Decision container tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Reproducibility stream id
    pub stream: u64,

    /// Number of recent SNR samples kept per entity
    pub history_range: usize,

    /// How the SNR window is reduced in per-entity summaries
    pub history_combining: HistoryCombining,

    /// Smoothing factor of the per-entity moving averages
    pub ewma_alpha: f64,

    /// Id the agent answers the engine's init request with
    pub manager_id: u8,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            stream: 100,
            history_range: 5,
            history_combining: HistoryCombining::Average,
            ewma_alpha: 0.25,
            manager_id: 1,
        }
    }
}

/// Logging and metrics output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when RUST_LOG is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Print the Prometheus rendering of all metrics at exit
    pub print_metrics: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            print_metrics: false,
        }
    }
}

impl SimlinkConfig {
    /// Load configuration from all layered sources
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(File::with_name("simlink").required(false));
        let mut files = candidate_files("simlink");

        if let Ok(path) = std::env::var("SIMLINK_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
            files.extend(candidate_files(&path));
        }

        let mut config: SimlinkConfig = builder
            .add_source(
                Environment::with_prefix("SIMLINK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.restore_settings_case(&files);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config: SimlinkConfig = Config::builder()
            .add_source(File::from(path).required(true))
            .build()?
            .try_deserialize()?;

        config.restore_settings_case(&[path.to_path_buf()]);
        config.validate()?;
        Ok(config)
    }

    fn restore_settings_case(&mut self, files: &[PathBuf]) {
        let keys: Vec<String> = files.iter().flat_map(|f| raw_settings_keys(f)).collect();
        if keys.is_empty() {
            return;
        }
        let settings = std::mem::take(&mut self.engine.settings);
        self.engine.settings = settings.with_key_case(keys.iter().map(String::as_str));
    }

    /// Reject settings the run cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.engine.program.trim().is_empty() {
            return Err(SimlinkError::ConfigError("engine.program is empty".into()));
        }
        if self.channel.attach_timeout_ms == 0 || self.channel.peer_timeout_ms == 0 {
            return Err(SimlinkError::ConfigError(
                "channel timeouts must be greater than zero".into(),
            ));
        }
        if self.channel.liveness_interval_ms == 0 {
            return Err(SimlinkError::ConfigError(
                "channel.liveness_interval_ms must be greater than zero".into(),
            ));
        }
        if self.container.history_range == 0 {
            return Err(SimlinkError::ConfigError(
                "container.history_range must be at least 1".into(),
            ));
        }
        let alpha = self.container.ewma_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(SimlinkError::ConfigError(format!(
                "container.ewma_alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        Ok(())
    }
}

/// Existing files `File::with_name(name)` may resolve to
fn candidate_files(name: &str) -> Vec<PathBuf> {
    let path = PathBuf::from(name);
    if path.is_file() {
        return vec![path];
    }
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| PathBuf::from(format!("{}.{}", name, ext)))
        .filter(|candidate| candidate.is_file())
        .collect()
}

/// `engine.settings` keys spelled as in `path`; empty if unreadable
fn raw_settings_keys(path: &Path) -> Vec<String> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to re-read {:?} for settings keys: {}", path, e);
            return Vec::new();
        }
    };

    let keys = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str::<toml::Table>(&text).ok().and_then(|table| {
            table
                .get("engine")
                .and_then(|engine| engine.get("settings"))
                .and_then(|settings| settings.as_table())
                .map(|settings| settings.keys().cloned().collect())
        }),
        _ => serde_yaml::from_str::<serde_yaml::Value>(&text).ok().and_then(|value| {
            value
                .get("engine")
                .and_then(|engine| engine.get("settings"))
                .and_then(|settings| settings.as_mapping())
                .map(|settings| {
                    settings
                        .keys()
                        .filter_map(|key| key.as_str().map(str::to_string))
                        .collect()
                })
        }),
    };
    keys.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::settings::SettingValue;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimlinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.container.stream, 100);
        assert_eq!(config.channel.peer_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_bad_alpha() {
        let mut config = SimlinkConfig::default();
        config.container.ewma_alpha = 0.0;
        assert!(config.validate().is_err());

        config.container.ewma_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = SimlinkConfig::default();
        config.channel.peer_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(SimlinkError::ConfigError(_))));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "engine:\n  program: ./engine\n  show_output: true\n  settings:\n    verbose: false\n    devices: 4\n    side_length: 1000.5\n    policy: hold\ncontainer:\n  stream: 7"
        )
        .unwrap();

        let config = SimlinkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.program, "./engine");
        assert!(config.engine.show_output);
        assert_eq!(config.container.stream, 7);
        assert_eq!(config.container.history_range, 5);

        let settings = &config.engine.settings;
        assert_eq!(settings.get("verbose"), Some(&SettingValue::Flag(false)));
        assert_eq!(settings.get("devices"), Some(&SettingValue::Count(4)));
        assert_eq!(settings.number("side_length"), Some(1000.5));
        assert_eq!(settings.text("policy"), Some("hold"));
    }

    #[test]
    fn test_camel_case_settings_pass_through() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "engine:\n  settings:\n    nDevices: 4\n    adrEnabled: true\n    crashAtStep: 2\n    maxRandomLossDB: 10.5"
        )
        .unwrap();

        let config = SimlinkConfig::from_file(file.path()).unwrap();
        let settings = &config.engine.settings;
        assert_eq!(settings.count("nDevices"), Some(4));
        assert_eq!(settings.flag("adrEnabled"), Some(true));
        assert_eq!(settings.count("crashAtStep"), Some(2));
        assert_eq!(
            settings.to_args(),
            vec![
                "--adrEnabled=true",
                "--crashAtStep=2",
                "--maxRandomLossDB=10.5",
                "--nDevices=4",
            ]
        );
    }

    #[test]
    fn test_camel_case_settings_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nprogram = \"./engine\"\n\n[engine.settings]\nnGateways = 2\nadrType = \"LorawanRlAdr\""
        )
        .unwrap();

        let config = SimlinkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.settings.count("nGateways"), Some(2));
        assert_eq!(config.engine.settings.text("adrType"), Some("LorawanRlAdr"));
    }

    #[test]
    fn test_candidate_files_cover_extensions() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("simlink");
        std::fs::write(dir.path().join("simlink.yml"), "engine: {}\n").unwrap();

        let found = candidate_files(&base.to_string_lossy());
        assert_eq!(found, vec![dir.path().join("simlink.yml")]);
        assert!(candidate_files(&dir.path().join("absent").to_string_lossy()).is_empty());
    }
}
