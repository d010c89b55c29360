use envconfig::Envconfig;
use linestream_common::config::{EnvMsDuration, LogConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(from = "HEALTH_PROBE_TIMEOUT_MS", default = "1000")]
    pub health_probe_timeout: EnvMsDuration,

    #[envconfig(from = "INPUT_PATH", default = "/data/input.txt")]
    pub input_path: String,

    #[envconfig(nested = true)]
    pub log: LogConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:8080");
        assert_eq!(config.input_path, "/data/input.txt");
        assert_eq!(config.log.stream_name.as_str(), "line_stream");
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("BIND_PORT".to_owned(), "9000".to_owned()),
            ("INPUT_PATH".to_owned(), "/tmp/in.log".to_owned()),
            ("REDIS_ADDR".to_owned(), "localhost:6379".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:9000");
        assert_eq!(config.input_path, "/tmp/in.log");
        assert_eq!(config.log.redis_url(), "redis://localhost:6379");
    }
}
