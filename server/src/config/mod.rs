//! Configuration of `contraviderd`: a TOML file whose keys can be
//! overridden with `CONTRAVIDER_*` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use contravider_providers::{BaseUrl, Profiles, SystemConfig};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};
use tokio_listener::ListenerAddress;
use tracing::Level;

mod env;

pub const DEFAULT_CONFIG_FILE: &str = "contraviderd.toml";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read config file {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("invalid config file {0:?}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("invalid value {value:?} in {name}: {reason}")]
    Env {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("unable to resolve {0:?}: {1}")]
    Resolve(String, #[source] std::io::Error),

    #[error("{0:?} resolves to no address")]
    NoAddress(String),

    #[error("invalid {key}: {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log: Log,
    pub web: Web,
    pub signing: Signing,
    pub providers: Providers,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Log {
    /// Additionally append to this file.
    pub file: Option<PathBuf>,
    #[serde_as(as = "DisplayFromStr")]
    pub level: Level,
    pub json: bool,
    /// Include source locations.
    pub source: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            file: None,
            level: Level::INFO,
            json: false,
            source: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Web {
    /// Host name or address to listen on. An absolute path listens on a
    /// unix domain socket, with `{port}` replaced.
    pub host: String,
    pub port: u16,
    /// Used to expand `{protocol}` in the base URL.
    pub protocol: String,
    /// Directory holding the profile aliases.
    pub root: PathBuf,
    /// PEM certificate chain. Together with `key_file`, HTTPS is served.
    pub cert_file: Option<PathBuf>,
    /// PEM private key of `cert_file`.
    pub key_file: Option<PathBuf>,
}

impl Default for Web {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8083,
            protocol: "https".into(),
            root: "web".into(),
            cert_file: None,
            key_file: None,
        }
    }
}

impl Web {
    /// Certificate and key file, if HTTPS is to be served.
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Signing {
    /// ASCII-armored OpenPGP secret key.
    pub key: PathBuf,
    /// Unlocks `key`, if it is protected.
    pub passphrase: Option<String>,
}

impl Default for Signing {
    fn default() -> Self {
        Self {
            key: "privatekey.asc".into(),
            passphrase: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Providers {
    pub git_url: String,
    pub base_url: String,
    pub workdir: PathBuf,
    pub result: PathBuf,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub update: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub git_timeout: Duration,
    pub default_branch: String,
    /// Deprecated, render unknown template parameters empty.
    pub lenient_templates: bool,
    pub profiles: Profiles,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            git_url: "https://github.com/csaf-testsuite/distribution.git".into(),
            base_url: "{protocol}://{host}:{port}/{profile}".into(),
            workdir: "checkout".into(),
            result: "results".into(),
            update: Duration::from_secs(5 * 60),
            git_timeout: Duration::from_secs(120),
            default_branch: "main".into(),
            lenient_templates: false,
            profiles: Profiles::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or from [DEFAULT_CONFIG_FILE]
    /// if it exists, then applies the environment overrides and validates
    /// the result.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks constraints between and on values serde can't express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.providers.update.is_zero() {
            return Err(Error::Invalid {
                key: "providers.update",
                reason: "the refresh interval must be at least one second",
            });
        }
        if self.providers.git_timeout.is_zero() {
            return Err(Error::Invalid {
                key: "providers.git_timeout",
                reason: "the timeout must be at least one second",
            });
        }
        if self.web.cert_file.is_some() != self.web.key_file.is_some() {
            return Err(Error::Invalid {
                key: "web.cert_file",
                reason: "cert_file and key_file must be set together",
            });
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| Error::Parse(path.to_path_buf(), e))
    }

    /// Overrides keys from the variables `lookup` returns.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        env::apply(self, lookup)
    }

    pub fn base_url(&self) -> BaseUrl {
        BaseUrl {
            template: self.providers.base_url.clone(),
            protocol: self.web.protocol.clone(),
            host: self.web.host.clone(),
            port: self.web.port,
        }
    }

    pub fn system_config(&self) -> SystemConfig {
        SystemConfig {
            web_root: self.web.root.clone(),
            result_root: self.providers.result.clone(),
            base_url: self.base_url(),
            update: self.providers.update,
            lenient_templates: self.providers.lenient_templates,
        }
    }

    /// The address to listen on, resolving host names.
    pub async fn listen_address(&self) -> Result<ListenerAddress, Error> {
        let host = &self.web.host;
        if Path::new(host).is_absolute() {
            return Ok(ListenerAddress::Path(
                host.replace("{port}", &self.web.port.to_string()).into(),
            ));
        }
        self.socket_address().await.map(ListenerAddress::Tcp)
    }

    /// The TCP address to listen on, resolving host names.
    pub async fn socket_address(&self) -> Result<SocketAddr, Error> {
        let host = &self.web.host;
        tokio::net::lookup_host((host.as_str(), self.web.port))
            .await
            .map_err(|e| Error::Resolve(host.clone(), e))?
            .next()
            .ok_or_else(|| Error::NoAddress(host.clone()))
    }
}
