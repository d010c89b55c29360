use envconfig::Envconfig;
use linestream_common::config::{consumer_identity, EnvMsDuration, LogConfig, NonEmptyString};
use linestream_common::WorkerSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(from = "HEALTH_PROBE_TIMEOUT_MS", default = "1000")]
    pub health_probe_timeout: EnvMsDuration,

    #[envconfig(from = "OUTPUT_PATH", default = "/data/output.txt")]
    pub output_path: String,

    #[envconfig(from = "SINK_FSYNC", default = "true")]
    pub sink_fsync: bool,

    #[envconfig(from = "GROUP_NAME", default = "cg1")]
    pub group_name: NonEmptyString,

    /// Defaults to the hostname.
    #[envconfig(from = "CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    #[envconfig(from = "CLAIM_COUNT", default = "1")]
    pub claim_count: usize,

    #[envconfig(from = "CLAIM_BLOCK_MS", default = "5000")]
    pub claim_block: EnvMsDuration,

    #[envconfig(from = "RECLAIM_INTERVAL_MS", default = "30000")]
    pub reclaim_interval: EnvMsDuration,

    #[envconfig(from = "RECLAIM_MIN_IDLE_MS", default = "60000")]
    pub reclaim_min_idle: EnvMsDuration,

    #[envconfig(from = "MAX_DELIVERIES", default = "10")]
    pub max_deliveries: u64,

    #[envconfig(nested = true)]
    pub log: LogConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            stream: self.log.stream_name.as_str().to_owned(),
            group: self.group_name.as_str().to_owned(),
            consumer: consumer_identity(self.consumer_name.as_deref()),
            claim_count: self.claim_count.max(1),
            block_timeout: self.claim_block.0,
            reclaim_interval: self.reclaim_interval.0,
            reclaim_min_idle: self.reclaim_min_idle.0,
            max_deliveries: self.max_deliveries.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        let settings = config.worker_settings();

        assert_eq!(config.output_path, "/data/output.txt");
        assert!(config.sink_fsync);
        assert_eq!(settings.stream, "line_stream");
        assert_eq!(settings.group, "cg1");
        assert!(!settings.consumer.is_empty());
        assert_eq!(settings.claim_count, 1);
        assert_eq!(settings.block_timeout, Duration::from_secs(5));
        assert_eq!(settings.reclaim_min_idle, Duration::from_secs(60));
        assert_eq!(settings.max_deliveries, 10);
    }

    #[test]
    fn test_worker_settings_overrides() {
        let env = HashMap::from([
            ("CONSUMER_NAME".to_owned(), "writer-2".to_owned()),
            ("GROUP_NAME".to_owned(), "archive".to_owned()),
            ("CLAIM_COUNT".to_owned(), "0".to_owned()),
            ("CLAIM_BLOCK_MS".to_owned(), "250".to_owned()),
            ("SINK_FSYNC".to_owned(), "false".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let settings = config.worker_settings();

        assert_eq!(settings.consumer, "writer-2");
        assert_eq!(settings.group, "archive");
        assert_eq!(settings.claim_count, 1);
        assert_eq!(settings.block_timeout, Duration::from_millis(250));
        assert!(!config.sink_fsync);
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let env = HashMap::from([("GROUP_NAME".to_owned(), "".to_owned())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
