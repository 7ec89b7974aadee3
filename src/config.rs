//! Environment-driven configuration, following the teacher's
//! `RateLimitConfig::from_env()` idiom (`rate_limit.rs`): a defaulted struct
//! with env-var overrides, parsed leniently (bad values keep the default).

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub nats_url: String,
    pub plugin_root: String,
    pub kv_sweep_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "rosey_bot.db".to_string(),
            nats_url: "nats://127.0.0.1:4222".to_string(),
            plugin_root: "plugins".to_string(),
            kv_sweep_interval_secs: 300,
            maintenance_interval_secs: 3600,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("ROSEY_DB_PATH") {
            config.db_path = val;
        }
        if let Ok(val) = env::var("ROSEY_NATS_URL") {
            config.nats_url = val;
        }
        if let Ok(val) = env::var("ROSEY_PLUGIN_ROOT") {
            config.plugin_root = val;
        }
        if let Ok(val) = env::var("ROSEY_KV_SWEEP_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.kv_sweep_interval_secs = n;
        }
        if let Ok(val) = env::var("ROSEY_MAINTENANCE_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.maintenance_interval_secs = n;
        }
        if let Ok(val) = env::var("ROSEY_LOG_LEVEL") {
            config.log_level = val;
        }

        config
    }
}
