use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::core::TypeId;
use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::process::RemoteOptions;

/// Everything a Scheduler is built from, apart from the rules and the host.
///
/// Relative directories are resolved against `build_root`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub build_root: Utf8PathBuf,
    pub working_dir: Utf8PathBuf,
    pub local_store_dir: Utf8PathBuf,
    pub local_execution_root_dir: Utf8PathBuf,
    /// Globs relative to the build root, skipped by filesystem nodes and the
    /// watcher.
    pub ignore_patterns: Vec<String>,
    pub root_subject_types: Vec<TypeId>,
    pub execution_parallelism: usize,
    /// Async worker threads, `0` for one per core.
    pub worker_threads: usize,
    pub cleanup_local_dirs: bool,
    pub invalidation_delay_ms: u64,
    /// How long freshly written store content is safe from garbage
    /// collection.
    pub store_write_lease_secs: u64,
    pub release_batch_size: usize,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            build_root: Utf8PathBuf::from("."),
            working_dir: Utf8PathBuf::from("."),
            local_store_dir: Utf8PathBuf::from(".tasuki/store"),
            local_execution_root_dir: Utf8PathBuf::from(".tasuki/sandboxes"),
            ignore_patterns: vec![".git".to_string(), ".tasuki".to_string()],
            root_subject_types: Vec::new(),
            execution_parallelism: 4,
            worker_threads: 0,
            cleanup_local_dirs: true,
            invalidation_delay_ms: 10,
            store_write_lease_secs: crate::store::DEFAULT_LEASE.as_secs(),
            release_batch_size: 64,
            remote: RemoteConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub store_servers: Vec<String>,
    pub execution_server: Option<String>,
    pub instance_name: Option<String>,
    pub namespace: Option<String>,
    pub oauth_bearer_token_path: Option<Utf8PathBuf>,
    pub root_ca_certs_path: Option<Utf8PathBuf>,
    pub chunk_size_bytes: usize,
    pub upload_timeout_ms: u64,
    pub retries: usize,
    pub platform_properties: BTreeMap<String, String>,
    pub fallback_to_local: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            store_servers: Vec::new(),
            execution_server: None,
            instance_name: None,
            namespace: None,
            oauth_bearer_token_path: None,
            root_ca_certs_path: None,
            chunk_size_bytes: 1024 * 1024,
            upload_timeout_ms: 30_000,
            retries: 3,
            platform_properties: BTreeMap::new(),
            fallback_to_local: true,
        }
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        self.execution_server.is_some() || !self.store_servers.is_empty()
    }

    fn read(path: &Utf8Path) -> Result<Vec<u8>, ConfigError> {
        std::fs::read(path).map_err(|source| ConfigError::Credentials {
            path: path.to_owned(),
            source,
        })
    }

    /// Checks the settings for consistency and loads the credential files.
    pub(crate) fn options(&self) -> Result<RemoteOptions, ConfigError> {
        if self.execution_server.is_some() && self.store_servers.is_empty() {
            return Err(ConfigError::RemotePartial(
                "an execution server needs at least one store server".to_string(),
            ));
        }
        if self.execution_server.is_some() && self.oauth_bearer_token_path.is_none() {
            return Err(ConfigError::RemotePartial(
                "an execution server needs an oauth bearer token".to_string(),
            ));
        }
        if !self.is_configured() && (self.instance_name.is_some() || self.namespace.is_some()) {
            return Err(ConfigError::RemotePartial(
                "an instance name or namespace is set without any server".to_string(),
            ));
        }
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::RemotePartial("chunk size must be positive".to_string()));
        }

        let oauth_bearer_token = match &self.oauth_bearer_token_path {
            Some(path) => {
                let bytes = Self::read(path)?;
                Some(String::from_utf8_lossy(&bytes).trim().to_string())
            }
            None => None,
        };
        let root_ca_certs = match &self.root_ca_certs_path {
            Some(path) => Some(Self::read(path)?),
            None => None,
        };

        Ok(RemoteOptions {
            store_servers: self.store_servers.clone(),
            execution_server: self.execution_server.clone(),
            instance_name: self.instance_name.clone(),
            namespace: self.namespace.clone(),
            oauth_bearer_token,
            root_ca_certs,
            chunk_size_bytes: self.chunk_size_bytes,
            upload_timeout: Duration::from_millis(self.upload_timeout_ms),
            platform_properties: self.platform_properties.clone(),
        })
    }
}

impl SchedulerConfig {
    pub fn new(build_root: impl Into<Utf8PathBuf>) -> Self {
        let build_root = build_root.into();
        SchedulerConfig {
            working_dir: build_root.clone(),
            build_root,
            ..Default::default()
        }
    }

    pub(crate) fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.build_root.join(path)
        }
    }

    pub(crate) fn ignore(&self) -> Result<Vec<glob::Pattern>, ConfigError> {
        self.ignore_patterns
            .iter()
            .map(|pattern| glob::Pattern::new(pattern).map_err(ConfigError::from))
            .collect()
    }

    pub(crate) fn invalidation_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation_delay_ms)
    }

    pub(crate) fn store_write_lease(&self) -> Duration {
        Duration::from_secs(self.store_write_lease_secs)
    }

    /// Everything that can be checked without touching the host.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        self.ignore()?;
        Ok(())
    }
}

/// Whether `path`, relative to the build root, or any of its ancestors
/// matches an ignore pattern. Patterns are tried against both the relative
/// path and the bare name of each ancestor.
pub(crate) fn is_ignored(ignore: &[glob::Pattern], path: &Utf8Path) -> bool {
    path.ancestors()
        .filter(|p| !p.as_str().is_empty())
        .any(|p| {
            ignore.iter().any(|pattern| {
                pattern.matches(p.as_str()) || p.file_name().is_some_and(|name| pattern.matches(name))
            })
        })
}
