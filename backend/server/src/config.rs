use std::{env, fmt::Display, fs::read_to_string, io, path::PathBuf, str::FromStr};

use tracing::{info, warn};

use crate::{error::StartupError, recovery::RecoveryMode};

const SECRETS_DIR: &str = "/run/secrets";

pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub database_path: PathBuf,
    pub journal_path: PathBuf,
    pub journal_fsync: bool,
    pub recovery: RecoveryMode,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Config {
    pub fn load() -> Result<Self, StartupError> {
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;

        if let Some(password) = read_secret("REDIS_PASSWORD") {
            config.redis_url = with_password(&config.redis_url, &password);
        }

        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StartupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            port: try_load(&lookup, "RUST_PORT", "1111")?,
            redis_url: try_load(&lookup, "REDIS_URL", "redis://127.0.0.1:6379")?,
            database_path: try_load(&lookup, "FOOTPRINTS_DATABASE", "footprints.db")?,
            journal_path: try_load(&lookup, "FOOTPRINTS_JOURNAL", "footprints.journal")?,
            journal_fsync: try_load(&lookup, "FOOTPRINTS_JOURNAL_FSYNC", "false")?,
            recovery: try_load(&lookup, "FOOTPRINTS_RECOVERY", "rebuild")?,
            default_limit: try_load(&lookup, "FOOTPRINTS_DEFAULT_LIMIT", "10")?,
            max_limit: try_load(&lookup, "FOOTPRINTS_MAX_LIMIT", "50")?,
        };

        if config.max_limit == 0 || config.default_limit > config.max_limit {
            return Err(StartupError::Config(format!(
                "default limit {} must be within 1..={}",
                config.default_limit, config.max_limit
            )));
        }

        Ok(config)
    }

    /// Page size for a read, clamped to the configured maximum.
    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }
}

fn try_load<T, F>(lookup: &F, key: &str, default: &str) -> Result<T, StartupError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
            StartupError::Config(format!("{key}: {e}"))
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("{SECRETS_DIR}/{secret_name}");

    match read_to_string(&path) {
        Ok(secret) => Some(secret.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{secret_name} not provided");
            None
        }
        Err(e) => {
            warn!("Failed to read {secret_name} from file: {e}");
            None
        }
    }
}

/// Fold a password into a Redis URL unless it already carries credentials.
fn with_password(url: &str, password: &str) -> String {
    if let Some(rest) = url.strip_prefix("redis+unix://") {
        let separator = if rest.contains('?') { '&' } else { '?' };
        return format!("{url}{separator}pass={password}");
    }

    match url.split_once("://") {
        Some((scheme, rest)) if !rest.contains('@') => format!("{scheme}://:{password}@{rest}"),
        _ => url.to_string(),
    }
}
