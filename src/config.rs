//! Runtime configuration, read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `ADSELECT_PORT` | `3000` |
//! | `ADSELECT_DATABASE_URL` | `sqlite:adselect.db?mode=rwc` |
//! | `ADSELECT_INVENTORY_PATH` | unset |
//! | `ADSELECT_CACHE_TTL_SECS` | `30` |
//! | `ADSELECT_CACHE_MAX_ENTRIES` | `10000` |
//! | `ADSELECT_DEPENDENCY_TIMEOUT_MS` | `250` |
//! | `ADSELECT_OVERFETCH_FACTOR` | `3` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:adselect.db?mode=rwc";

/// Knobs of the selection protocol.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// How long a computed selection is reused. Keep it near one page render.
    pub cache_ttl: Duration,

    /// Deadline for each repository, store, or cache call.
    pub dependency_timeout: Duration,

    /// Candidates fetched per requested ad.
    pub overfetch_factor: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            dependency_timeout: Duration::from_millis(250),
            overfetch_factor: 3,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Inventory file loaded into the store at startup.
    pub inventory_path: Option<PathBuf>,
    pub cache_max_entries: usize,
    pub selection: SelectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            inventory_path: None,
            cache_max_entries: 10_000,
            selection: SelectionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();

        let cache_ttl_secs = parse_or(
            &lookup,
            "ADSELECT_CACHE_TTL_SECS",
            defaults.selection.cache_ttl.as_secs(),
        )?;
        let timeout_ms = parse_or(
            &lookup,
            "ADSELECT_DEPENDENCY_TIMEOUT_MS",
            defaults.selection.dependency_timeout.as_millis() as u64,
        )?;
        let overfetch_factor = parse_or(
            &lookup,
            "ADSELECT_OVERFETCH_FACTOR",
            defaults.selection.overfetch_factor,
        )?;
        if overfetch_factor == 0 {
            anyhow::bail!("ADSELECT_OVERFETCH_FACTOR must be at least 1");
        }

        Ok(Self {
            port: parse_or(&lookup, "ADSELECT_PORT", defaults.port)?,
            database_url: lookup("ADSELECT_DATABASE_URL").unwrap_or(defaults.database_url),
            inventory_path: lookup("ADSELECT_INVENTORY_PATH").map(PathBuf::from),
            cache_max_entries: parse_or(
                &lookup,
                "ADSELECT_CACHE_MAX_ENTRIES",
                defaults.cache_max_entries,
            )?,
            selection: SelectionConfig {
                cache_ttl: Duration::from_secs(cache_ttl_secs),
                dependency_timeout: Duration::from_millis(timeout_ms),
                overfetch_factor,
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_url, "sqlite:adselect.db?mode=rwc");
        assert!(config.inventory_path.is_none());
        assert_eq!(config.selection.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.selection.dependency_timeout, Duration::from_millis(250));
        assert_eq!(config.selection.overfetch_factor, 3);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ADSELECT_PORT", "8080"),
            ("ADSELECT_CACHE_TTL_SECS", "5"),
            ("ADSELECT_DEPENDENCY_TIMEOUT_MS", "100"),
            ("ADSELECT_INVENTORY_PATH", "/etc/adselect/inventory.json"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.selection.cache_ttl, Duration::from_secs(5));
        assert_eq!(config.selection.dependency_timeout, Duration::from_millis(100));
        assert_eq!(
            config.inventory_path,
            Some(PathBuf::from("/etc/adselect/inventory.json"))
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("ADSELECT_PORT", "http")])).is_err());
        assert!(Config::from_lookup(lookup(&[("ADSELECT_OVERFETCH_FACTOR", "0")])).is_err());
    }
}
