use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use tablesink_core::metadata::DEFAULT_CACHE_TTL;
use tablesink_core::registry::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use tablesink_nats::{ClientConfig, NatsAuth};

use crate::error::{Error, Result};

const ENV_DSN: &str = "DSN";
const ENV_NATS_URL: &str = "TABLESINK_NATS_URL";
const ENV_NATS_USER: &str = "TABLESINK_NATS_USER";
const ENV_NATS_PASSWORD: &str = "TABLESINK_NATS_PASSWORD";
const ENV_NATS_TOKEN: &str = "TABLESINK_NATS_TOKEN";
const ENV_STREAM: &str = "TABLESINK_STREAM";
const ENV_CONSUMER: &str = "TABLESINK_CONSUMER";
const ENV_MONITOR_SUBJECT: &str = "TABLESINK_MONITOR_SUBJECT";
const ENV_CACHE_TTL_SECS: &str = "TABLESINK_CACHE_TTL_SECS";
const ENV_IDLE_TIMEOUT_SECS: &str = "TABLESINK_IDLE_TIMEOUT_SECS";
const ENV_SWEEP_INTERVAL_SECS: &str = "TABLESINK_SWEEP_INTERVAL_SECS";
const ENV_PANIC_TERMINAL: &str = "TABLESINK_PANIC_TERMINAL";
const ENV_NOTIFY_ON_ACK: &str = "TABLESINK_NOTIFY_ON_ACK";
const ENV_RETRY_LOOKUP_ERRORS: &str = "TABLESINK_RETRY_LOOKUP_ERRORS";

const DEFAULT_NATS_URL: &str = "localhost:4222";
const DEFAULT_STREAM: &str = "tablesink";
const DEFAULT_CONSUMER: &str = "tablesink";
const DEFAULT_MONITOR_SUBJECT: &str = "processor.monitor";

/// Process settings, read once from the environment at startup.
#[derive(Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) dsn: String,
    pub(crate) nats: ClientConfig,
    pub(crate) stream: String,
    pub(crate) consumer: String,
    pub(crate) monitor_subject: String,
    pub(crate) cache_ttl: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) panic_terminal: bool,
    pub(crate) notify_on_ack: bool,
    pub(crate) retry_lookup_errors: bool,
}

// credentials stay out of the logs
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("nats_url", &self.nats.url)
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .field("monitor_subject", &self.monitor_subject)
            .field("cache_ttl", &self.cache_ttl)
            .field("idle_timeout", &self.idle_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("panic_terminal", &self.panic_terminal)
            .field("notify_on_ack", &self.notify_on_ack)
            .field("retry_lookup_errors", &self.retry_lookup_errors)
            .finish_non_exhaustive()
    }
}

impl Settings {
    pub(crate) fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key == ENV_DSN || key.starts_with("TABLESINK_"))
            .collect();

        let get_var = |var: &str| {
            env_vars
                .get(var)
                .map(String::as_str)
                .filter(|val| !val.is_empty())
        };

        let dsn = get_var(ENV_DSN)
            .ok_or_else(|| Error::Config(format!("Environment variable {ENV_DSN} is not set")))?
            .to_string();

        let auth = match (
            get_var(ENV_NATS_USER),
            get_var(ENV_NATS_PASSWORD),
            get_var(ENV_NATS_TOKEN),
        ) {
            (Some(username), Some(password), None) => Some(NatsAuth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (None, None, Some(token)) => Some(NatsAuth::Token(token.to_string())),
            (None, None, None) => None,
            (_, _, Some(_)) => {
                return Err(Error::Config(format!(
                    "{ENV_NATS_TOKEN} cannot be combined with {ENV_NATS_USER}/{ENV_NATS_PASSWORD}"
                )));
            }
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_NATS_USER} and {ENV_NATS_PASSWORD} must be set together"
                )));
            }
        };

        Ok(Self {
            dsn,
            nats: ClientConfig {
                url: get_var(ENV_NATS_URL).unwrap_or(DEFAULT_NATS_URL).to_string(),
                auth,
            },
            stream: get_var(ENV_STREAM).unwrap_or(DEFAULT_STREAM).to_string(),
            consumer: get_var(ENV_CONSUMER).unwrap_or(DEFAULT_CONSUMER).to_string(),
            monitor_subject: get_var(ENV_MONITOR_SUBJECT)
                .unwrap_or(DEFAULT_MONITOR_SUBJECT)
                .to_string(),
            cache_ttl: parse_secs(ENV_CACHE_TTL_SECS, get_var(ENV_CACHE_TTL_SECS))?
                .unwrap_or(DEFAULT_CACHE_TTL),
            idle_timeout: parse_secs(ENV_IDLE_TIMEOUT_SECS, get_var(ENV_IDLE_TIMEOUT_SECS))?
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            sweep_interval: parse_secs(ENV_SWEEP_INTERVAL_SECS, get_var(ENV_SWEEP_INTERVAL_SECS))?
                .filter(|interval| !interval.is_zero())
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            panic_terminal: parse::<bool>(ENV_PANIC_TERMINAL, get_var(ENV_PANIC_TERMINAL))?
                .unwrap_or(true),
            notify_on_ack: parse::<bool>(ENV_NOTIFY_ON_ACK, get_var(ENV_NOTIFY_ON_ACK))?
                .unwrap_or(true),
            retry_lookup_errors: parse::<bool>(
                ENV_RETRY_LOOKUP_ERRORS,
                get_var(ENV_RETRY_LOOKUP_ERRORS),
            )?
            .unwrap_or(false),
        })
    }
}

fn parse<T: FromStr>(var: &str, value: Option<&str>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|value| {
            value
                .trim()
                .to_lowercase()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Invalid value {value:?} for {var} - {e}")))
        })
        .transpose()
}

fn parse_secs(var: &str, value: Option<&str>) -> Result<Option<Duration>> {
    Ok(parse::<u64>(var, value)?.map(Duration::from_secs))
}
