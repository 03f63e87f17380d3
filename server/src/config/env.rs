use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::{Config, Error};

const LOG_FILE: &str = "CONTRAVIDER_LOG_FILE";
const LOG_LEVEL: &str = "CONTRAVIDER_LOG_LEVEL";
const LOG_JSON: &str = "CONTRAVIDER_LOG_JSON";
const LOG_SOURCE: &str = "CONTRAVIDER_LOG_SOURCE";
const WEB_HOST: &str = "CONTRAVIDER_WEB_HOST";
const WEB_PORT: &str = "CONTRAVIDER_WEB_PORT";
const WEB_PROTOCOL: &str = "CONTRAVIDER_WEB_PROTOCOL";
const WEB_ROOT: &str = "CONTRAVIDER_WEB_ROOT";
const WEB_CERT_FILE: &str = "CONTRAVIDER_WEB_CERT_FILE";
const WEB_KEY_FILE: &str = "CONTRAVIDER_WEB_KEY_FILE";
const SIGNING_KEY: &str = "CONTRAVIDER_SIGNING_KEY";
const SIGNING_PASSPHRASE: &str = "CONTRAVIDER_SIGNING_PASSPHRASE";
const PROVIDERS_GIT_URL: &str = "CONTRAVIDER_PROVIDERS_GIT_URL";
const PROVIDERS_BASE_URL: &str = "CONTRAVIDER_PROVIDERS_BASE_URL";
const PROVIDERS_WORKDIR: &str = "CONTRAVIDER_PROVIDERS_WORKDIR";
const PROVIDERS_RESULT: &str = "CONTRAVIDER_PROVIDERS_RESULT";
const PROVIDERS_UPDATE: &str = "CONTRAVIDER_PROVIDERS_UPDATE";

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T>(&self, name: &'static str) -> Result<Option<T>, Error>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(value) = (self.0)(name) else {
            return Ok(None);
        };
        value.trim().parse().map(Some).map_err(|e: T::Err| Error::Env {
            name,
            reason: e.to_string(),
            value,
        })
    }

    fn string(&self, name: &'static str, dst: &mut String) {
        if let Some(value) = (self.0)(name) {
            *dst = value;
        }
    }

    fn path(&self, name: &'static str, dst: &mut PathBuf) {
        if let Some(value) = (self.0)(name) {
            *dst = value.into();
        }
    }

    /// An empty value unsets the key.
    fn optional<T: From<String>>(&self, name: &'static str, dst: &mut Option<T>) {
        if let Some(value) = (self.0)(name) {
            *dst = (!value.is_empty()).then(|| value.into());
        }
    }

    fn set<T>(&self, name: &'static str, dst: &mut T) -> Result<(), Error>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.parsed(name)? {
            *dst = value;
        }
        Ok(())
    }
}

pub(super) fn apply<F>(cfg: &mut Config, lookup: F) -> Result<(), Error>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env(lookup);

    env.optional(LOG_FILE, &mut cfg.log.file);
    env.set(LOG_LEVEL, &mut cfg.log.level)?;
    env.set(LOG_JSON, &mut cfg.log.json)?;
    env.set(LOG_SOURCE, &mut cfg.log.source)?;

    env.string(WEB_HOST, &mut cfg.web.host);
    env.set(WEB_PORT, &mut cfg.web.port)?;
    env.string(WEB_PROTOCOL, &mut cfg.web.protocol);
    env.path(WEB_ROOT, &mut cfg.web.root);
    env.optional(WEB_CERT_FILE, &mut cfg.web.cert_file);
    env.optional(WEB_KEY_FILE, &mut cfg.web.key_file);

    env.path(SIGNING_KEY, &mut cfg.signing.key);
    env.optional(SIGNING_PASSPHRASE, &mut cfg.signing.passphrase);

    env.string(PROVIDERS_GIT_URL, &mut cfg.providers.git_url);
    env.string(PROVIDERS_BASE_URL, &mut cfg.providers.base_url);
    env.path(PROVIDERS_WORKDIR, &mut cfg.providers.workdir);
    env.path(PROVIDERS_RESULT, &mut cfg.providers.result);
    if let Some(seconds) = env.parsed::<u64>(PROVIDERS_UPDATE)? {
        cfg.providers.update = Duration::from_secs(seconds);
    }

    Ok(())
}
