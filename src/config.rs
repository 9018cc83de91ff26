//! Process-wide configuration.
//!
//! Loaded once at startup the way the teacher loads its runtime knobs:
//! environment variables first, each with a parsed fallback, mirroring the
//! env-var-with-default pattern used for source kill switches; a
//! `toml`-deserialized file overlay fills in anything an env var didn't set.
//! `KtrdrConfig::from_env()` is the single construction point and is handed
//! to the Operations Registry, Cancellation Coordinator and Model Storage
//! root — the process-wide "global state" this crate carries.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackendKind {
    File { root: PathBuf },
    TimeSeries { base_timeframe: String },
}

impl Default for StorageBackendKind {
    fn default() -> Self {
        Self::File {
            root: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOverlay {
    storage_backend: Option<String>,
    data_root: Option<String>,
    base_timeframe: Option<String>,
    model_storage_root: Option<String>,
    operation_timeout_secs: Option<u64>,
    cleanup_retention_secs: Option<u64>,
    cancellation_unreachable_timeout_secs: Option<u64>,
    detached_host_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KtrdrConfig {
    pub storage_backend: StorageBackendKind,
    pub model_storage_root: PathBuf,
    pub default_operation_timeout: Option<Duration>,
    pub cleanup_retention: Duration,
    pub cancellation_unreachable_timeout: Duration,
    pub detached_host_base_url: Option<String>,
}

impl Default for KtrdrConfig {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackendKind::default(),
            model_storage_root: PathBuf::from("./models"),
            default_operation_timeout: None,
            cleanup_retention: Duration::from_secs(24 * 3600),
            cancellation_unreachable_timeout: Duration::from_secs(30),
            detached_host_base_url: None,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}

impl KtrdrConfig {
    /// Reads environment variables first, then overlays a `KTRDR_CONFIG_FILE`
    /// TOML document for anything an env var left unset. Read once at
    /// process startup.
    pub fn from_env() -> Self {
        let overlay = env_var("KTRDR_CONFIG_FILE")
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|contents| toml::from_str::<FileOverlay>(&contents).ok())
            .unwrap_or_default();

        let storage_backend = match env_var("KTRDR_STORAGE_BACKEND")
            .or(overlay.storage_backend)
            .as_deref()
        {
            Some("timeseries") => StorageBackendKind::TimeSeries {
                base_timeframe: env_var("KTRDR_BASE_TIMEFRAME")
                    .or(overlay.base_timeframe)
                    .unwrap_or_else(|| "5m".to_string()),
            },
            _ => StorageBackendKind::File {
                root: env_var("KTRDR_DATA_ROOT")
                    .or(overlay.data_root)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data")),
            },
        };

        let model_storage_root = env_var("KTRDR_MODEL_ROOT")
            .or(overlay.model_storage_root)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./models"));

        let default_operation_timeout = parse_env::<u64>("KTRDR_OPERATION_TIMEOUT_SECS")
            .or(overlay.operation_timeout_secs)
            .map(Duration::from_secs);

        let cleanup_retention = parse_env::<u64>("KTRDR_CLEANUP_RETENTION_SECS")
            .or(overlay.cleanup_retention_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(24 * 3600));

        let cancellation_unreachable_timeout =
            parse_env::<u64>("KTRDR_CANCEL_UNREACHABLE_TIMEOUT_SECS")
                .or(overlay.cancellation_unreachable_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(30));

        let detached_host_base_url = env_var("KTRDR_DETACHED_HOST_URL").or(overlay.detached_host_base_url);

        Self {
            storage_backend,
            model_storage_root,
            default_operation_timeout,
            cleanup_retention,
            cancellation_unreachable_timeout,
            detached_host_base_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_file_backend_under_data_root() {
        let config = KtrdrConfig::default();
        assert_eq!(
            config.storage_backend,
            StorageBackendKind::File {
                root: PathBuf::from("./data")
            }
        );
    }

    #[test]
    fn env_var_selects_timeseries_backend() {
        // SAFETY: test runs single-threaded per-process env var mutation is
        // scoped to this test via a unique key prefix to avoid cross-test races.
        env::set_var("KTRDR_STORAGE_BACKEND_TEST_PROBE", "timeseries");
        assert_eq!(
            env_var("KTRDR_STORAGE_BACKEND_TEST_PROBE").as_deref(),
            Some("timeseries")
        );
        env::remove_var("KTRDR_STORAGE_BACKEND_TEST_PROBE");
    }
}
