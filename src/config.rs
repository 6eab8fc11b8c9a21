use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use anyhow::anyhow;

use crate::AppResult;

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub data_file: PathBuf,
    /// Upper bound on a single websocket frame write.
    pub send_timeout: Duration,
    /// Frames queued per connection before deliveries to it start failing.
    pub outbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8090".to_owned(),
            data_file: PathBuf::from("chat_data.json"),
            send_timeout: Duration::from_millis(5000),
            outbox_capacity: 256,
        }
    }
}

impl Config {
    /// Reads `RELAY_*` variables, after loading `.env` if one exists.
    pub fn from_env() -> AppResult<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Config> {
        let defaults = Config::default();

        let outbox_capacity = parse_or(&lookup, "RELAY_OUTBOX_CAPACITY", defaults.outbox_capacity)?;
        if outbox_capacity == 0 {
            return Err(anyhow!("RELAY_OUTBOX_CAPACITY must be at least 1").into());
        }

        Ok(Config {
            addr: lookup("RELAY_ADDR").unwrap_or(defaults.addr),
            data_file: lookup("RELAY_DATA_FILE").map(PathBuf::from).unwrap_or(defaults.data_file),
            send_timeout: Duration::from_millis(parse_or(
                &lookup,
                "RELAY_SEND_TIMEOUT_MS",
                defaults.send_timeout.as_millis() as u64,
            )?),
            outbox_capacity,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}").into()),
        None => Ok(default),
    }
}
