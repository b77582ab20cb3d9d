use std::fmt::Debug;
use std::str::FromStr;

pub struct Config {
    pub port: u16,
    pub rate_limit_period_ms: i64,
    pub rate_limit_burst: u32,
    pub disable_rate_limit: bool,
    pub storage_type: String,
    pub block_dry_interval_ms: u64,
    pub disable_block_dry_interval: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_or("HTTP_PORT", 1452),
            rate_limit_period_ms: env_or("RATE_LIMIT_PERIOD_MS", 100),
            rate_limit_burst: env_or("RATE_LIMIT_BURST", 10),
            disable_rate_limit: env_or("DISABLE_RATE_LIMIT", false),
            storage_type: std::env::var("STORAGE_TYPE").unwrap_or_else(|_| "mem".into()),
            block_dry_interval_ms: env_or("BLOCK_DRY_INTERVAL_MS", 60_000),
            disable_block_dry_interval: env_or("DISABLE_BLOCK_DRY_INTERVAL", false),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Debug,
{
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("ignoring bad value for {key}: {err:?}");
                default
            }
        },
        Err(_) => default,
    }
}
