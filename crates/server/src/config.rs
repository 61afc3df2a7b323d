use std::collections::HashMap;
use std::time::Duration;

use config::ConfigError;
use domain::DiscussionId;
use engine::SessionConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "THREADSYNC_";

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub session: SessionSettings,
    pub cache: CacheSettings,
    pub realtime: RealtimeSettings,
}

#[derive(Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: String,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
}

#[derive(Deserialize, Clone)]
pub struct SessionSettings {
    pub max_depth: usize,
    pub command_buffer: usize,
    pub signal_buffer: usize,
    pub reconnect_delay_ms: u64,
    /// Sessions unused this long, with no live event stream, are closed.
    pub idle_timeout_ms: u64,
    /// Open sessions kept at most; the least recently used go first.
    pub max_open: usize,
    pub sweep_interval_ms: u64,
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn session_config(&self, discussion_id: DiscussionId, viewer_id: &str) -> SessionConfig {
        SessionConfig {
            max_depth: self.max_depth,
            command_buffer: self.command_buffer,
            signal_buffer: self.signal_buffer,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            ..SessionConfig::new(discussion_id, viewer_id)
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct CacheSettings {
    pub author_capacity: usize,
    pub liked_capacity: usize,
}

#[derive(Deserialize, Clone)]
pub struct RealtimeSettings {
    /// Change events buffered per subscriber before it is cut off.
    pub buffer: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.cors_origins", "*")?
            .set_default("database.url", "sqlite://data/threadsync.db")?
            .set_default("session.max_depth", 3)?
            .set_default("session.command_buffer", 64)?
            .set_default("session.signal_buffer", 64)?
            .set_default("session.reconnect_delay_ms", 2000)?
            .set_default("session.idle_timeout_ms", 900_000)?
            .set_default("session.max_open", 10_000)?
            .set_default("session.sweep_interval_ms", 60_000)?
            .set_default("cache.author_capacity", 4096)?
            .set_default("cache.liked_capacity", 16384)?
            .set_default("realtime.buffer", 256)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::File::with_name(&format!("config.{}", run_mode)).required(false));

        for (key, value) in collect_env_vars(std::env::vars()) {
            builder = builder.set_override(key, value)?;
        }

        builder.build()?.try_deserialize()
    }
}

fn collect_env_vars(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .map(|(k, v)| {
            let new_key = k
                .trim_start_matches(ENV_PREFIX)
                .replace("__", ".")
                .to_lowercase();
            (new_key, v)
        })
        .collect()
}
