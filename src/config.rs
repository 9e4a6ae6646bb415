use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::acquisition::{DEFAULT_DARK_PROGRAM, DEFAULT_EXP_PROGRAM};
use crate::error::CcdError;
use crate::header::HeaderOverrides;
use crate::stand::{DEFAULT_OFF_PROGRAM, DEFAULT_SETUP_PROGRAM};
use crate::voltage::{Rail, nominal_defaults, parse_rail_map};

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataConfig,
    pub acquisition: AcquisitionConfig,
    pub voltages: VoltageConfig,
    pub header: HeaderOverrides,
    pub logging: LoggingConfig,
    pub journal: JournalConfig,
    pub sequence: SequenceConfig,
    pub stand: StandConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Where images are written
    pub directory: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub exp_program: String,
    pub dark_program: String,
    /// Directory holding the stand executables; `PATH` lookup when unset
    pub bin_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct VoltageConfig {
    /// Push the defaults to the controller before the first run
    pub apply_on_start: bool,
    /// Rail name -> volts
    pub defaults: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub buffer_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SequenceConfig {
    pub state_file: PathBuf,
    pub auto_increment: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StandConfig {
    pub reset_on_start: bool,
    pub power_off_on_exit: bool,
    pub setup_program: String,
    pub off_program: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./"),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            exp_program: DEFAULT_EXP_PROGRAM.to_string(),
            dark_program: DEFAULT_DARK_PROGRAM.to_string(),
            bin_dir: None,
        }
    }
}

impl Default for VoltageConfig {
    fn default() -> Self {
        Self {
            apply_on_start: false,
            defaults: nominal_defaults()
                .into_iter()
                .map(|(rail, volts)| (rail.header_key().to_lowercase(), volts))
                .collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./logs"),
            buffer_size: 10,
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("./seqnum.json"),
            auto_increment: true,
        }
    }
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            reset_on_start: false,
            power_off_on_exit: false,
            setup_program: DEFAULT_SETUP_PROGRAM.to_string(),
            off_program: DEFAULT_OFF_PROGRAM.to_string(),
        }
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.directory.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "data.directory must not be empty".to_string(),
            ));
        }
        if self.journal.buffer_size == 0 {
            return Err(ConfigError::Message(
                "journal.buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.acquisition.exp_program.trim().is_empty()
            || self.acquisition.dark_program.trim().is_empty()
        {
            return Err(ConfigError::Message(
                "acquisition programs must not be empty".to_string(),
            ));
        }

        let rails = self
            .rail_defaults()
            .map_err(|e| ConfigError::Message(format!("Invalid voltages.defaults: {}", e)))?;
        if let Some((rail, volts)) = rails.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Message(format!(
                "voltages.defaults: {} is not a finite voltage ({})",
                rail, volts
            )));
        }
        Ok(())
    }

    pub fn rail_defaults(&self) -> Result<BTreeMap<Rail, f64>, CcdError> {
        parse_rail_map(&self.voltages.defaults)
    }
}

/// Environment overrides, e.g. CCDCTRL_DATA__DIRECTORY=/data/ccd
fn environment() -> Environment {
    Environment::with_prefix("CCDCTRL")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    build_config(config_path, environment())
}

fn build_config(
    config_path: Option<&Path>,
    environment: Environment,
) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["ccd-expose.toml", "config/ccd-expose.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    let app_config = builder
        .add_source(environment)
        .build()?
        .try_deserialize::<AppConfig>()?;
    app_config.validate()?;
    Ok(app_config)
}

/// Like [`load_config`], but falls back to defaults when no path was given
/// and nothing loadable was found. An explicit path must load.
///
/// The reason for a fallback is handed back so it can be logged once the
/// logger is running.
pub fn load_config_or_default(
    config_path: Option<&Path>,
) -> Result<(AppConfig, Option<ConfigError>), ConfigError> {
    match load_config(config_path) {
        Ok(config) => Ok((config, None)),
        Err(e) if config_path.is_some() => Err(e),
        Err(e) => Ok((AppConfig::default(), Some(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Illumination;

    fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stand.toml");
        std::fs::write(&path, text).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        let rails = config.rail_defaults().unwrap();
        assert_eq!(rails.len(), 10);
        assert_eq!(rails[&Rail::ParLo], -8.0);
        assert_eq!(config.acquisition.exp_program, "exp_acq");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let (_dir, path) = write_config(
            r#"
[data]
directory = "/data/sta3800"

[header]
tstand = "BNL1"
illumination = { source = "filter", name = "550LP" }

[voltages.defaults]
vod = 24.5
"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.data.directory, PathBuf::from("/data/sta3800"));
        assert_eq!(config.header.tstand.as_deref(), Some("BNL1"));
        assert_eq!(
            config.header.illumination,
            Some(Illumination::Filter {
                name: "550LP".to_string()
            })
        );
        assert_eq!(config.journal.buffer_size, 10);
        assert_eq!(config.rail_defaults().unwrap()[&Rail::Vod], 24.5);
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let missing = Path::new("/nonexistent/ccd-expose.toml");
        assert!(load_config(Some(missing)).is_err());
        assert!(load_config_or_default(Some(missing)).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let (_dir, path) = write_config("[data]\ndirectory = \"/data/file\"\n");
        let vars: ::config::Map<String, String> = [
            ("CCDCTRL_DATA__DIRECTORY", "/data/env"),
            ("CCDCTRL_JOURNAL__BUFFER_SIZE", "25"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = build_config(Some(&path), environment().source(Some(vars))).unwrap();
        assert_eq!(config.data.directory, PathBuf::from("/data/env"));
        assert_eq!(config.journal.buffer_size, 25);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let (_dir, path) = write_config("[journal]\nbuffer_size = 0\n");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_unknown_rail_rejected() {
        let mut config = AppConfig::default();
        config.voltages.defaults.insert("vv9".to_string(), 1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dump_round_trips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(text.contains("[stand]"));
        let (_dir, path) = write_config(&text);
        assert_eq!(load_config(Some(&path)).unwrap(), AppConfig::default());
    }
}
