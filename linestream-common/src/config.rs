use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use gethostname::gethostname;
use tracing::warn;

use crate::log::LogError;
use crate::redis_log::RedisLog;

/// Connection settings of the log, shared by every service.
#[derive(Envconfig, Clone)]
pub struct LogConfig {
    #[envconfig(from = "REDIS_ADDR", default = "redis:6379")]
    pub redis_addr: String,

    #[envconfig(from = "REDIS_RESPONSE_TIMEOUT_MS", default = "5000")]
    pub redis_response_timeout: EnvMsDuration,

    #[envconfig(from = "REDIS_CONNECTION_TIMEOUT_MS", default = "5000")]
    pub redis_connection_timeout: EnvMsDuration,

    #[envconfig(from = "STREAM_NAME", default = "line_stream")]
    pub stream_name: NonEmptyString,
}

impl LogConfig {
    /// `REDIS_ADDR` is usually a bare host:port; a full redis URL is used as is.
    pub fn redis_url(&self) -> String {
        if self.redis_addr.contains("://") {
            self.redis_addr.clone()
        } else {
            format!("redis://{}", self.redis_addr)
        }
    }

    pub async fn connect(&self) -> Result<RedisLog, LogError> {
        RedisLog::with_config(
            &self.redis_url(),
            self.redis_response_timeout.0,
            self.redis_connection_timeout.0,
        )
        .await
    }
}

/// The name a worker uses within its consumer group: the explicit one if set, else the
/// hostname, else a name derived from the current time.
pub fn consumer_identity(explicit: Option<&str>) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|name| !name.is_empty()) {
        return name.to_owned();
    }

    match hostname() {
        Some(hostname) => hostname,
        None => format!("consumer-{}", chrono::Utc::now().timestamp()),
    }
}

fn hostname() -> Option<String> {
    match gethostname().into_string() {
        Ok(hostname) => {
            let hostname = hostname.trim();
            (!hostname.is_empty()).then(|| hostname.to_owned())
        }
        Err(e) => {
            warn!(error = ?e, "hostname is not valid UTF-8");
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
