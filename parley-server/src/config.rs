use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound for establishing a provider connection.
    pub connect_timeout: Duration,
}

impl ServerConfig {
    /// Reads `PARLEY_BIND_ADDR` and `PARLEY_CONNECT_TIMEOUT_SECS`. Call
    /// `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("PARLEY_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("PARLEY_BIND_ADDR must be a socket address such as 127.0.0.1:3000")?;

        let connect_timeout = match lookup("PARLEY_CONNECT_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .context("PARLEY_CONNECT_TIMEOUT_SECS must be a whole number of seconds")?,
            None => DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        Ok(Self {
            bind_addr,
            connect_timeout: Duration::from_secs(connect_timeout),
        })
    }
}
