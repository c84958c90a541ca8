use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub bus_capacity: usize,
    pub history_limit: i64,
}

impl Config {
    /// Read configuration from the environment. Call after `.env` is loaded.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let addr = lookup("COACH_CHAT_ADDR")
            .unwrap_or_else(|| "0.0.0.0:3000".into())
            .parse::<SocketAddr>()
            .context("COACH_CHAT_ADDR is not a valid socket address")?;

        // Defaults to ~/.coach-chat/chat.db
        let db_path = match lookup("COACH_CHAT_DB") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".coach-chat").join("chat.db")
            }
        };

        let bus_capacity = match lookup("COACH_CHAT_BUS_CAPACITY") {
            Some(raw) => raw
                .parse::<usize>()
                .context("COACH_CHAT_BUS_CAPACITY must be a positive integer")?,
            None => 100,
        };
        if bus_capacity == 0 {
            anyhow::bail!("COACH_CHAT_BUS_CAPACITY must be greater than zero");
        }

        let history_limit = match lookup("COACH_CHAT_HISTORY_LIMIT") {
            Some(raw) => raw
                .parse::<i64>()
                .context("COACH_CHAT_HISTORY_LIMIT must be an integer")?,
            None => 500,
        };
        if history_limit <= 0 {
            anyhow::bail!("COACH_CHAT_HISTORY_LIMIT must be greater than zero");
        }

        Ok(Self {
            addr,
            db_path,
            bus_capacity,
            history_limit,
        })
    }
}
