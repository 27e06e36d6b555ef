use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROTOCOL: &str = "spacebar";
pub const DEFAULT_INSTANCE: &str = "https://spacebar.chat/";
pub const DEFAULT_LANDING: &str = "/channels/@me";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub home_dir: PathBuf,
    pub protocol: String,
    pub default_instance: String,
    /// File path or http(s) URL of the instance directory feed.
    pub instances_feed: Option<String>,
    pub http_timeout: Duration,
    pub debounce: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let home_dir = value("SBAUTH_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                value("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".sbauth")
            });
        let http_timeout = value("SBAUTH_HTTP_TIMEOUT_SECS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        let debounce = value("SBAUTH_DEBOUNCE_MS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_DEBOUNCE_MS);

        Self {
            home_dir,
            protocol: value("SBAUTH_PROTOCOL").unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            default_instance: value("SBAUTH_DEFAULT_INSTANCE")
                .unwrap_or_else(|| DEFAULT_INSTANCE.to_string()),
            instances_feed: value("SBAUTH_INSTANCES"),
            http_timeout: Duration::from_secs(http_timeout),
            debounce: Duration::from_millis(debounce),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.home_dir.join("store")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }
}
