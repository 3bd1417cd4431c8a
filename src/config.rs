use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::prober::RunnerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Single process, nothing shared.
    Memory,
    /// Shared with other instances through etcd.
    Etcd,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreKind,
    pub etcd_endpoints: Vec<String>,
    pub etcd_prefix: String,
    pub lock_ttl_secs: u64,
    pub lock_attempts: usize,
    pub prober_workers: usize,
    pub prober_tick_ms: u64,
    pub probe_timeout_ms: u64,
    pub port_max_retries: u32,
    pub details_max_retries: u32,
    pub port_offsets: Vec<u16>,
    pub cleaner_interval_secs: u64,
    pub server_retention_secs: i64,
    pub instance_retention_secs: i64,
    pub refresh_interval_secs: i64,
    pub refresh_active_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            etcd_endpoints: vec!["http://127.0.0.1:2379".into()],
            etcd_prefix: "/mastersrv".into(),
            lock_ttl_secs: 5,
            lock_attempts: 5,
            prober_workers: 8,
            prober_tick_ms: 250,
            probe_timeout_ms: 1000,
            port_max_retries: 3,
            details_max_retries: 3,
            port_offsets: vec![1, 2, 3, 4],
            cleaner_interval_secs: 60,
            server_retention_secs: 3600,
            instance_retention_secs: 600,
            refresh_interval_secs: 60,
            refresh_active_secs: 300,
        }
    }
}

impl Config {
    /// Defaults, then `mastersrv.toml`, then `mastersrv.json`, then
    /// `MASTERSRV_*` environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("mastersrv.toml"))
            .merge(Json::file("mastersrv.json"))
            .merge(Env::prefixed("MASTERSRV_"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.store == StoreKind::Etcd && config.etcd_endpoints.is_empty() {
            anyhow::bail!("store = \"etcd\" needs at least one etcd endpoint");
        }
        if config.port_offsets.is_empty() {
            anyhow::bail!("port_offsets must not be empty");
        }
        Ok(config)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            workers: self.prober_workers,
            tick: Duration::from_millis(self.prober_tick_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_interval_secs)
    }

    pub fn server_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.server_retention_secs)
    }

    pub fn instance_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.instance_retention_secs)
    }

    pub fn refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_interval_secs)
    }

    pub fn refresh_active(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_active_secs)
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_| {
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.store, StoreKind::Memory);
            assert_eq!(config.port_offsets, vec![1, 2, 3, 4]);
            assert_eq!(config.runner().tick, Duration::from_millis(250));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "mastersrv.toml",
                r#"
                store = "etcd"
                etcd_prefix = "/from-file"
                prober_workers = 2
                "#,
            )?;
            jail.set_env("MASTERSRV_PROBER_WORKERS", "16");
            jail.set_env(
                "MASTERSRV_ETCD_ENDPOINTS",
                "[\"http://etcd-0:2379\",\"http://etcd-1:2379\"]",
            );

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.store, StoreKind::Etcd);
            assert_eq!(config.etcd_prefix, "/from-file");
            assert_eq!(config.prober_workers, 16);
            assert_eq!(config.etcd_endpoints.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn rejects_empty_offsets() {
        Jail::expect_with(|jail| {
            jail.set_env("MASTERSRV_PORT_OFFSETS", "[]");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
