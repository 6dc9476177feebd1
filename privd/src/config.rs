//! Daemon configuration.

use crate::error::Error;
use serde_derive::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

/// Default path of the configuration file.
pub const CONFIG_PATH: &str = "/etc/privd/privd.toml";

/// Configuration of the daemon, created once at startup.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the local channel.
    pub socket_path: PathBuf,
    /// Path of the PID file.
    pub pid_file: PathBuf,
    /// Maximum time an identity-scoped call may take.
    #[serde(with = "seconds")]
    pub run_as_timeout: Duration,
    /// Interval of the launcher liveness probe.
    #[serde(with = "seconds")]
    pub probe_interval: Duration,
    /// Owner of the channel after startup.
    pub socket_user: Option<String>,
    /// Group of the channel after startup.
    pub socket_group: Option<String>,
    /// External program that applies network configuration.
    pub network_helper: PathBuf,
    /// Length of the test read from block devices.
    pub device_read_size: usize,
    /// Logging options.
    pub log: privd_log::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/privd/privd.sock".into(),
            pid_file: "/var/run/privd/privd.pid".into(),
            run_as_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(2),
            socket_user: Some("vdsm".to_string()),
            socket_group: Some("kvm".to_string()),
            network_helper: "/usr/libexec/privd/network-helper".into(),
            device_read_size: 4096,
            log: Default::default(),
        }
    }
}

impl Config {
    /// Load the configuration, a missing file returns the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content)?;
        if config.device_read_size == 0 {
            return Err(Error::InvalidArgument("device_read_size must not be 0".into()));
        }
        Ok(config)
    }
}

/// Durations as fractional seconds.
mod seconds {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(de::Error::custom("duration must be positive"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use std::{io::Write, time::Duration};

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.run_as_timeout, Duration::from_secs(60));
        assert_eq!(config.device_read_size, 4096);
    }

    #[test]
    fn test_parse() {
        let config = Config::parse(
            r#"
            socket_path = "/tmp/privd.sock"
            run_as_timeout = 0.5
            probe_interval = 1
            socket_group = "qemu"

            [log]
            foreground = true
            filter = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_path.to_str(), Some("/tmp/privd.sock"));
        assert_eq!(config.run_as_timeout, Duration::from_millis(500));
        assert_eq!(config.probe_interval, Duration::from_secs(1));
        assert_eq!(config.socket_user.as_deref(), Some("vdsm"));
        assert_eq!(config.socket_group.as_deref(), Some("qemu"));
        assert!(config.log.foreground);
        assert_eq!(config.log.filter.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid() {
        assert!(Config::parse("run_as_timeout = -1").is_err());
        assert!(Config::parse("unknown_key = 1").is_err());
        assert!(Config::parse("device_read_size = 0").is_err());
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(Config::load(&missing).unwrap(), Config::default());

        let path = dir.path().join("privd.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "pid_file = \"/tmp/privd.pid\"").unwrap();
        assert_eq!(
            Config::load(&path).unwrap().pid_file.to_str(),
            Some("/tmp/privd.pid")
        );
    }
}
