use serde_derive::{Deserialize, Serialize};

/// Server-wide tunables, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Inter-replica schema propagation delay. `0` disables the periodic
    /// schema-cache reloader.
    pub lease_millis: u64,

    /// Upper bound, in milliseconds, for the DDL worker's wake-up tick.
    pub worker_max_tick_interval_millis: u64,

    /// Upper bound, in milliseconds, for the schema-cache reloader's tick.
    pub reload_max_tick_interval_millis: u64,

    /// Address the RPC listener binds to.
    pub bind_addr: String,

    /// Directory the on-disk KV engine stores its log in.
    pub data_dir: String,

    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lease_millis: 200,
            worker_max_tick_interval_millis: 2_000,
            reload_max_tick_interval_millis: 2_000,
            bind_addr: "127.0.0.1:7878".to_string(),
            data_dir: "data/docdb".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn lease(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lease_millis)
    }

    pub fn worker_max_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.worker_max_tick_interval_millis)
    }

    pub fn reload_max_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reload_max_tick_interval_millis)
    }

    pub fn load(name: &str) -> anyhow::Result<Self> {
        Ok(confy::load(name, None)?)
    }
}
