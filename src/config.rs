use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Root of the application directory of the reference deployment.
const APP_DIR: &str = "/home/vcap/app";

pub const NATS_HOSTS_ENV: &str = "NATS_HOSTS";
pub const NATS_PASSWORD_ENV: &str = "NATS_PASSWORD";
pub const LOCAL_ADDRESS_ENV: &str = "CF_INSTANCE_IP";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path:?} failed, {err}")]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("parse config {path:?} failed, {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: serde_yaml::Error,
    },
    #[error("no bus hosts configured, set `bus.hosts` or {NATS_HOSTS_ENV}")]
    NoBusHosts,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("ttl {ttl:?} must be longer than render_interval {interval:?}")]
    TtlTooShort { ttl: Duration, interval: Duration },
}

/// Certificate files the agent uses when scraping targets. They are written
/// into the rendered config verbatim.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsFiles {
    fn default() -> Self {
        let certs = Path::new(APP_DIR).join("certs");

        Self {
            ca: certs.join("scrape_ca.crt"),
            cert: certs.join("scrape.crt"),
            key: certs.join("scrape.key"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BusTlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Hosts of the bus servers, each is reached at `port`.
    pub hosts: Vec<String>,

    pub port: u16,

    pub user: String,

    pub password: Option<String>,

    /// Subject scrape targets are announced on.
    pub topic: String,

    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Fixed delay between reconnect attempts, reconnects never give up.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    pub tls: Option<BusTlsConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            hosts: vec![],
            port: 4222,
            user: "nats".to_string(),
            password: None,
            topic: "metrics.scrape_targets".to_string(),
            ping_interval: Duration::from_secs(20),
            reconnect_delay: Duration::from_millis(100),
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory the rendered config lives in, it must not exist at startup.
    pub config_dir: PathBuf,

    /// File name of the rendered config inside `config_dir`.
    pub output_file: String,

    /// Pid file written by the agent.
    pub pid_file: PathBuf,

    pub tls: TlsFiles,

    /// Address of this instance, targets on this host are never scraped.
    pub local_address: Option<String>,

    #[serde(with = "humantime_serde")]
    pub render_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub evict_interval: Duration,

    /// Maximum age of an announcement before it is evicted.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    pub bus: BusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: Path::new(APP_DIR).join("telegraf.d"),
            output_file: "inputs.conf".to_string(),
            pid_file: Path::new(APP_DIR).join("telegraf.pid"),
            tls: TlsFiles::default(),
            local_address: None,
            render_interval: Duration::from_secs(15),
            evict_interval: Duration::from_secs(15),
            ttl: Duration::from_secs(45),
            bus: BusConfig::default(),
        }
    }
}

impl Config {
    /// Load the config file if any, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            err,
        })?;

        Self::from_yaml(&content).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Config, serde_yaml::Error> {
        // an empty document means "all defaults"
        if content.trim().is_empty() {
            return Ok(Config::default());
        }

        serde_yaml::from_str(content)
    }

    /// Environment wins over the file. Empty values are treated as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(hosts) = lookup(NATS_HOSTS_ENV) {
            self.bus.hosts = hosts
                .lines()
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        if let Some(password) = lookup(NATS_PASSWORD_ENV) {
            self.bus.password = Some(password);
        }

        if let Some(address) = lookup(LOCAL_ADDRESS_ENV) {
            self.local_address = Some(address.trim().to_string());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.hosts.is_empty() {
            return Err(ConfigError::NoBusHosts);
        }

        for (name, interval) in [
            ("render_interval", self.render_interval),
            ("evict_interval", self.evict_interval),
            ("ttl", self.ttl),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.ttl <= self.render_interval {
            return Err(ConfigError::TtlTooShort {
                ttl: self.ttl,
                interval: self.render_interval,
            });
        }

        Ok(())
    }

    #[inline]
    pub fn output_path(&self) -> PathBuf {
        self.config_dir.join(&self.output_file)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();

        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_yaml("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(
            config.output_path(),
            PathBuf::from("/home/vcap/app/telegraf.d/inputs.conf")
        );
        assert_eq!(config.pid_file, PathBuf::from("/home/vcap/app/telegraf.pid"));
        assert_eq!(config.tls.ca, PathBuf::from("/home/vcap/app/certs/scrape_ca.crt"));
        assert_eq!(config.ttl, Duration::from_secs(45));
        assert_eq!(config.bus.topic, "metrics.scrape_targets");
        assert_eq!(config.bus.reconnect_delay, Duration::from_millis(100));
    }

    #[test]
    fn parse() {
        let config = Config::from_yaml(
            r#"
config_dir: /tmp/agent.d
output_file: scrape.conf
pid_file: /tmp/agent.pid
render_interval: 5s
ttl: 1m
bus:
  hosts:
  - 10.0.1.1
  ping_interval: 30s
  tls:
    ca_file: /etc/bus/ca.crt
"#,
        )
        .unwrap();

        assert_eq!(config.output_path(), PathBuf::from("/tmp/agent.d/scrape.conf"));
        assert_eq!(config.render_interval, Duration::from_secs(5));
        assert_eq!(config.evict_interval, Duration::from_secs(15));
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.bus.hosts, vec!["10.0.1.1".to_string()]);
        assert_eq!(config.bus.port, 4222);
        assert_eq!(config.bus.ping_interval, Duration::from_secs(30));
        assert_eq!(
            config.bus.tls.as_ref().and_then(|tls| tls.ca_file.clone()),
            Some(PathBuf::from("/etc/bus/ca.crt"))
        );
        config.validate().unwrap();
    }

    #[test]
    fn unknown_field() {
        let err = Config::from_yaml("render_intreval: 5s\n").unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn env_overrides() {
        let mut config = Config::default();
        config.bus.hosts = vec!["from-file".to_string()];

        config.apply_env(env(&[
            (NATS_HOSTS_ENV, "10.0.1.1\n10.0.1.2\n\n"),
            (NATS_PASSWORD_ENV, "secret"),
            (LOCAL_ADDRESS_ENV, "10.0.0.9"),
        ]));

        assert_eq!(
            config.bus.hosts,
            vec!["10.0.1.1".to_string(), "10.0.1.2".to_string()]
        );
        assert_eq!(config.bus.password.as_deref(), Some("secret"));
        assert_eq!(config.local_address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn empty_env_ignored() {
        let mut config = Config::default();
        config.bus.hosts = vec!["from-file".to_string()];

        config.apply_env(env(&[(NATS_HOSTS_ENV, ""), (LOCAL_ADDRESS_ENV, " ")]));

        assert_eq!(config.bus.hosts, vec!["from-file".to_string()]);
        assert_eq!(config.local_address, None);
    }

    #[test]
    fn validate() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::NoBusHosts)));

        let mut config = Config::default();
        config.bus.hosts = vec!["10.0.1.1".to_string()];
        config.validate().unwrap();

        config.evict_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("evict_interval"))
        ));

        config.evict_interval = Duration::from_secs(15);
        config.ttl = Duration::from_secs(15);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TtlTooShort { .. })
        ));
    }
}
