/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::clientconn::Correlation;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SNCP";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: String,

    /// I/O threads, each with its own reactor.
    pub workers: usize,

    /// Threads for blocking filters and servlets.
    pub blocking_threads: usize,
    pub blocking_queue: usize,

    /// Below 1 means unlimited.
    pub maxconns: i64,

    pub buffer_size: usize,
    pub buffer_pool_max: usize,
    pub exchange_pool_max: usize,
    pub max_body: usize,
    pub read_timeout_ms: u64,
    pub tls_cert: String,
    pub tls_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::from("127.0.0.1:7070"),
            workers: 2,
            blocking_threads: 8,
            blocking_queue: 1024,
            maxconns: 0,
            buffer_size: 16 * 1024,
            buffer_pool_max: 256,
            exchange_pool_max: 256,
            max_body: 64 * 1024 * 1024,
            read_timeout_ms: 60_000,
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Certificate and key files, if both are set.
    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        if self.tls_cert.is_empty() || self.tls_key.is_empty() {
            return None;
        }

        Some((PathBuf::from(&self.tls_cert), PathBuf::from(&self.tls_key)))
    }
}

impl From<ServerConfig> for config::ValueKind {
    fn from(server: ServerConfig) -> Self {
        let mut properties = HashMap::new();
        properties.insert("listen".to_string(), config::Value::from(server.listen));
        properties.insert(
            "workers".to_string(),
            config::Value::from(server.workers as i64),
        );
        properties.insert(
            "blocking_threads".to_string(),
            config::Value::from(server.blocking_threads as i64),
        );
        properties.insert(
            "blocking_queue".to_string(),
            config::Value::from(server.blocking_queue as i64),
        );
        properties.insert("maxconns".to_string(), config::Value::from(server.maxconns));
        properties.insert(
            "buffer_size".to_string(),
            config::Value::from(server.buffer_size as i64),
        );
        properties.insert(
            "buffer_pool_max".to_string(),
            config::Value::from(server.buffer_pool_max as i64),
        );
        properties.insert(
            "exchange_pool_max".to_string(),
            config::Value::from(server.exchange_pool_max as i64),
        );
        properties.insert(
            "max_body".to_string(),
            config::Value::from(server.max_body as i64),
        );
        properties.insert(
            "read_timeout_ms".to_string(),
            config::Value::from(server.read_timeout_ms as i64),
        );
        properties.insert("tls_cert".to_string(), config::Value::from(server.tls_cert));
        properties.insert("tls_key".to_string(), config::Value::from(server.tls_key));

        Self::Table(properties)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,

    /// Zero disables request timeouts.
    pub request_timeout_ms: u64,

    /// Pooled connection slots.
    pub max_conns: usize,

    /// Requests in flight per connection.
    pub max_pipeline: usize,

    pub buffer_size: usize,
    pub max_body: usize,

    /// `sequential` leaves requests without ids and relies on the peer
    /// answering in order.
    pub correlation: Correlation,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 6_000,
            request_timeout_ms: 30_000,
            max_conns: 16,
            max_pipeline: 128,
            buffer_size: 16 * 1024,
            max_body: 64 * 1024 * 1024,
            correlation: Correlation::Id,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_ms > 0 {
            Some(Duration::from_millis(self.request_timeout_ms))
        } else {
            None
        }
    }
}

impl From<ClientConfig> for config::ValueKind {
    fn from(client: ClientConfig) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "connect_timeout_ms".to_string(),
            config::Value::from(client.connect_timeout_ms as i64),
        );
        properties.insert(
            "request_timeout_ms".to_string(),
            config::Value::from(client.request_timeout_ms as i64),
        );
        properties.insert(
            "max_conns".to_string(),
            config::Value::from(client.max_conns as i64),
        );
        properties.insert(
            "max_pipeline".to_string(),
            config::Value::from(client.max_pipeline as i64),
        );
        properties.insert(
            "buffer_size".to_string(),
            config::Value::from(client.buffer_size as i64),
        );
        properties.insert(
            "max_body".to_string(),
            config::Value::from(client.max_body as i64),
        );
        properties.insert(
            "correlation".to_string(),
            config::Value::from(client.correlation.as_str()),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogConfig {
    /// 0 (errors only) through 4 (trace).
    pub level: u8,

    /// Empty means standard output.
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: 2,
            file: String::new(),
        }
    }
}

impl From<LogConfig> for config::ValueKind {
    fn from(log: LogConfig) -> Self {
        let mut properties = HashMap::new();
        properties.insert("level".to_string(), config::Value::from(log.level as i64));
        properties.insert("file".to_string(), config::Value::from(log.file));

        Self::Table(properties)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

impl Settings {
    /// Defaults, overridden by the TOML file if given, overridden by
    /// `SNCP__SECTION__KEY` environment variables.
    pub fn new(config_file: Option<&Path>) -> Result<Settings, ConfigError> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);

        Self::with_env(config_file, env)
    }

    fn with_env(config_file: Option<&Path>, env: Environment) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server", ServerConfig::default())?
            .set_default("client", ClientConfig::default())?
            .set_default("log", LogConfig::default())?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config = builder.add_source(env).build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn no_env() -> Environment {
        Environment::with_prefix("SNCP_TEST_UNSET").separator(ENV_SEPARATOR)
    }

    #[test]
    fn defaults() {
        let settings = Settings::with_env(None, no_env()).unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.read_timeout(), Duration::from_secs(60));
        assert_eq!(settings.server.tls_files(), None);
        assert_eq!(
            settings.client.request_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn file_overrides() {
        let path = std::env::temp_dir().join(format!("sncp-config-{}.toml", std::process::id()));

        fs::write(
            &path,
            "[server]\nlisten = \"0.0.0.0:9000\"\nmaxconns = 5\n\n[log]\nlevel = 4\n",
        )
        .unwrap();

        let settings = Settings::with_env(Some(&path), no_env());

        fs::remove_file(&path).unwrap();

        let settings = settings.unwrap();

        assert_eq!(settings.server.listen, "0.0.0.0:9000");
        assert_eq!(settings.server.maxconns, 5);
        assert_eq!(settings.server.workers, ServerConfig::default().workers);
        assert_eq!(settings.log.level, 4);
        assert_eq!(settings.client, ClientConfig::default());
    }

    #[test]
    fn env_overrides() {
        let source = HashMap::from([
            ("SNCP__SERVER__WORKERS".to_string(), "7".to_string()),
            ("SNCP__CLIENT__REQUEST_TIMEOUT_MS".to_string(), "0".to_string()),
            ("SNCP__CLIENT__CORRELATION".to_string(), "sequential".to_string()),
        ]);

        let env = Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(Some(source));

        let settings = Settings::with_env(None, env).unwrap();

        assert_eq!(settings.server.workers, 7);
        assert_eq!(settings.client.request_timeout(), None);
        assert_eq!(settings.client.correlation, Correlation::Sequential);
    }

    #[test]
    fn missing_file() {
        let path = Path::new("no/such/file.toml");

        assert!(Settings::with_env(Some(path), no_env()).is_err());
    }
}
