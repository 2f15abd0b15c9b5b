use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use log::{LevelFilter, error};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::constants::*;
use crate::token::soft::SoftTokenConfig;

#[cfg(feature = "hsm")]
use crate::token::pkcs11::Pkcs11ProviderConfig;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(HSMGATE_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value '{}' for log level in env var {}, using 'info'",
                        level, HSMGATE_ENV_LOG_LEVEL
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }
    fn log_type() -> LogType {
        LogType::Stderr
    }
    fn log_file() -> PathBuf {
        PathBuf::from("./hsmgate.log")
    }
    fn syslog_facility() -> String {
        "daemon".to_string()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for hsmgate.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// # Loading and checking
impl Config {
    /// Reads the configuration file and verifies it.
    pub fn create(config_file: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_config(config_file)?;
        config.verify()?;
        Ok(config)
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(file).map_err(|e| {
            ConfigError::Other(format!("Cannot read config file '{}': {}", file.display(), e))
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let c: Config = toml::from_str(data)?;
        Ok(c)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();

        for provider in &self.providers {
            match provider {
                ProviderConfig::Soft(soft) => {
                    if !ids.insert(soft.id.as_str()) {
                        return Err(ConfigError::Other(format!("Duplicate provider id '{}'", soft.id)));
                    }
                    if soft.flags.login_required()
                        && !soft.flags.protected_authentication_path()
                        && soft.pin.is_none()
                    {
                        return Err(ConfigError::Other(format!(
                            "Soft provider '{}' requires a login but has no pin",
                            soft.id
                        )));
                    }
                }
                #[cfg(feature = "hsm")]
                ProviderConfig::Pkcs11(pkcs11) => {
                    if !ids.insert(pkcs11.name.as_str()) {
                        return Err(ConfigError::Other(format!(
                            "Duplicate provider name '{}'",
                            pkcs11.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("Syslog is only supported on Unix systems")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from(HSMGATE_APP));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => Err(ConfigError::Other(format!("Cannot connect to syslog: {}", err))),
        }
    }

    /// Creates the fern dispatcher with the configured levels.
    ///
    /// The runtime and prompt libraries are capped at warn.
    fn fern_logger(&self) -> fern::Dispatch {
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("tokio", framework_level)
            .level_for("mio", framework_level)
            .level_for("rpassword", framework_level)
            .level_for("cryptoki", framework_level)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            providers: vec![],
        }
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ ProviderConfig ------------------------------------------------

/// The definition of a provider, or a group of providers for a PKCS#11
/// library with several slots.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Soft(SoftTokenConfig),

    #[cfg(feature = "hsm")]
    Pkcs11(Pkcs11ProviderConfig),
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                string
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn should_parse_default_config_file() {
        let c = Config::create(Path::new("./defaults/hsmgate.conf")).unwrap();

        assert_eq!(c.log_type, LogType::Stderr);
        assert_eq!(c.providers.len(), 1);
        match &c.providers[0] {
            ProviderConfig::Soft(soft) => {
                assert_eq!(soft.id, "soft0");
                assert!(soft.flags.login_required());
            }
            #[allow(unreachable_patterns)]
            other => panic!("unexpected provider: {:?}", other),
        }
    }

    #[test]
    fn should_read_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            log_level = "debug"
            log_type = "file"

            [[providers]]
            type = "soft"
            id = "p1"
            label = "Token A"
            flags = ["login_required", "protected_authentication_path"]
            "#
        )
        .unwrap();

        let c = Config::create(file.path()).unwrap();
        assert_eq!(c.log_level, LevelFilter::Debug);
        assert_eq!(c.log_type, LogType::File);
        assert_eq!(c.log_file, PathBuf::from("./hsmgate.log"));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let res = Config::read_config(&dir.path().join("nope.conf"));
        assert!(matches!(res, Err(ConfigError::Other(_))));
    }

    #[test]
    fn duplicate_provider_ids_are_refused() {
        let c = Config::parse(
            r#"
            [[providers]]
            type = "soft"
            id = "p1"
            label = "Token A"

            [[providers]]
            type = "soft"
            id = "p1"
            label = "Token B"
            "#,
        )
        .unwrap();

        assert!(c.verify().is_err());
    }

    #[test]
    fn interactive_soft_provider_needs_pin() {
        let c = Config::parse(
            r#"
            [[providers]]
            type = "soft"
            id = "p1"
            label = "Token A"
            flags = ["login_required"]
            "#,
        )
        .unwrap();

        assert!(c.verify().is_err());
    }

    #[test]
    fn unknown_log_type_is_refused() {
        assert!(Config::parse(r#"log_type = "journal""#).is_err());
    }

    #[test]
    fn should_set_correct_log_levels() {
        use log::Level as LL;

        fn void_logger(config: &str) -> Box<dyn log::Log> {
            let c = Config::parse(config).unwrap();
            let void_output = fern::Output::writer(Box::new(io::sink()), "");
            let (_, void_logger) = c.fern_logger().chain(void_output).into_log();
            void_logger
        }

        fn enabled(log: &dyn log::Log, target: &str, level: LL) -> bool {
            log.enabled(&log::Metadata::builder().target(target).level(level).build())
        }

        let log = void_logger(r#"log_level = "debug""#);
        assert!(enabled(log.as_ref(), "hsmgate::auth", LL::Debug));
        assert!(!enabled(log.as_ref(), "hsmgate::auth", LL::Trace));
        assert!(enabled(log.as_ref(), "tokio", LL::Warn));
        assert!(!enabled(log.as_ref(), "tokio", LL::Info));

        let log = void_logger(r#"log_level = "error""#);
        assert!(enabled(log.as_ref(), "hsmgate::dispatch", LL::Error));
        assert!(!enabled(log.as_ref(), "hsmgate::dispatch", LL::Warn));
        assert!(!enabled(log.as_ref(), "tokio", LL::Warn));
    }
}
