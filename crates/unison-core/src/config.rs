use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Well-known pub/sub channel every process subscribes to for schedule
/// changes. Must match across the whole fleet.
pub const SCHEDULE_CHANGE_CHANNEL: &str = "schedule_rules_changed";

/// Name hashed into the global leader advisory-lock key. Must match
/// across the whole fleet.
pub const LEADER_LOCK_NAME: &str = "unison_scheduler_leader";

/// Top-level config (unison.toml + UNISON_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnisonConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Postgres connection URL; ignored by the memory backend.
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Pub/sub channel name for schedule change notifications.
    #[serde(default = "default_channel")]
    pub channel: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            channel: default_channel(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Shared Postgres store — required for multi-process deployments.
    #[default]
    Postgres,
    /// In-process store for single-process runs and tests. Provides the
    /// same contracts but no cross-process coordination.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Trigger evaluation cadence in seconds. Also the leader
    /// re-election retry interval, since every dispatch re-checks
    /// leadership.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

fn default_store_url() -> String {
    "postgres://localhost/unison".to_string()
}
fn default_channel() -> String {
    SCHEDULE_CHANGE_CHANNEL.to_string()
}
fn default_tick_secs() -> u64 {
    1
}

impl UnisonConfig {
    /// Load config from a TOML file with UNISON_* env var overrides.
    ///
    /// Checks in order: explicit path argument, then ~/.unison/unison.toml.
    /// Missing file is fine — defaults plus env vars apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: UnisonConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("UNISON_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.unison/unison.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = UnisonConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.store.channel, SCHEDULE_CHANGE_CHANNEL);
        assert_eq!(config.scheduler.tick_secs, 1);
    }

    #[test]
    fn toml_file_and_env_layer_over_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "unison.toml",
                r#"
                [store]
                backend = "memory"
                channel = "custom_channel"
                "#,
            )?;
            jail.set_env("UNISON_STORE_URL", "postgres://db/unison_test");

            let config: UnisonConfig = Figment::new()
                .merge(Toml::file("unison.toml"))
                .merge(Env::prefixed("UNISON_").split("_"))
                .extract()
                .expect("config should parse");

            assert_eq!(config.store.backend, StoreBackend::Memory);
            assert_eq!(config.store.channel, "custom_channel");
            assert_eq!(config.store.url, "postgres://db/unison_test");
            Ok(())
        });
    }
}
