//! Control-plane configuration.
//!
//! Options come from a YAML file named by `SBXD_CONFIG` and from `SANDBOX_*`
//! environment variables. Both may coexist; a YAML value wins whenever it is
//! set and non-empty, then the environment variable, then the built-in
//! default. Accessors resolve one option at a time so the precedence is
//! applied uniformly.

use std::{collections::HashMap, time::Duration};

use sbxapi::CreateSandboxRequest;
use serde::Deserialize;

use crate::{utils::parse_duration, SbxdError, SbxdResult};

mod defaults;

pub use defaults::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The raw YAML configuration file. Every field is optional; zero values fall
/// through to the matching environment variable.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    image: String,
    volume_mode: String,
    cache_mode: String,
    cache_hostpath: String,
    cache_pvc_size: String,
    cache_pvc_storage_class: String,
    cache_pvc_access_mode: String,
    warm_pool_size: usize,
    warm_pool_autosize: bool,
    warm_pool_min: usize,
    warm_pool_max: usize,
    warm_control_namespace: String,
    idle_ttl: String,
    create_ready_timeout: String,
    cpu_request: String,
    mem_request: String,
    cpu_limit: String,
    mem_limit: String,
    allowed_hosts: Vec<String>,
    disallowed_hosts: Vec<String>,
    env: HashMap<String, String>,
    stream_mode: String,
    stream_sidecar_image: String,
    stream_endpoint: String,
    stream_events_dir: String,
    stream_buffer: usize,
    async_exec: Option<bool>,
    exec_status_retention: String,
    exec_timeout: String,
    exec_max_timeout: String,
}

/// Warm pool sizing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmPoolConfig {
    /// Fixed pool size when autosizing is off.
    pub size: usize,
    /// Lower clamp of the autosized pool.
    pub min: usize,
    /// Upper clamp of the autosized pool.
    pub max: usize,
    /// Whether the pool tracks recent create demand.
    pub autosize: bool,
    /// How long a claimed warm namespace may idle before it is reaped.
    pub idle_ttl: Duration,
}

/// Cache volume parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// `emptydir`, `hostpath` or `pvc`.
    pub mode: String,
    /// Host path backing the cache in `hostpath` mode.
    pub hostpath: String,
    /// PVC size in `pvc` mode.
    pub pvc_size: String,
    /// PVC storage class; empty for the cluster default.
    pub pvc_storage_class: String,
    /// PVC access mode.
    pub pvc_access_mode: String,
}

/// Output streaming parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// `control-plane` (output captured over the exec call) or `sidecar`
    /// (output redirected to event files and forwarded by the in-pod agent).
    pub mode: String,
    /// Image of the forwarder sidecar container.
    pub sidecar_image: String,
    /// Control-plane base URL the sidecar dials for ingest.
    pub endpoint: String,
    /// Directory holding per-exec event files inside the pod.
    pub events_dir: String,
    /// Ring buffer size of the stream hub.
    pub buffer: usize,
}

/// CPU and memory requests/limits for the sandbox container. Empty strings
/// leave the corresponding field unset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    /// CPU request, e.g. `250m`.
    pub cpu_request: String,
    /// Memory request, e.g. `256Mi`.
    pub mem_request: String,
    /// CPU limit.
    pub cpu_limit: String,
    /// Memory limit.
    pub mem_limit: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Config {
    /// Loads the configuration file named by `SBXD_CONFIG`, or the empty
    /// configuration when the variable is unset.
    pub fn load() -> SbxdResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV_VAR).unwrap_or_default();
        if path.is_empty() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Loads the configuration from a specific YAML file.
    pub fn load_from(path: &str) -> SbxdResult<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&data)
            .map_err(|e| SbxdError::Config(format!("parse {}: {}", path, e)))
    }

    /// The sandbox container image.
    pub fn image(&self) -> String {
        string_or(&self.image, "SANDBOX_IMAGE", DEFAULT_IMAGE)
    }

    /// The workspace volume mode.
    pub fn volume_mode(&self) -> String {
        string_or(&self.volume_mode, "SANDBOX_VOLUME_MODE", DEFAULT_VOLUME_MODE)
    }

    /// The namespace used for warm-pool bookkeeping.
    pub fn warm_control_namespace(&self) -> String {
        string_or(
            &self.warm_control_namespace,
            "SANDBOX_WARM_CONTROL_NAMESPACE",
            DEFAULT_WARM_CONTROL_NAMESPACE,
        )
    }

    /// Resolved warm pool parameters. Autosizing without an explicit upper
    /// bound clamps to 10.
    pub fn warm_pool(&self) -> WarmPoolConfig {
        let autosize = bool_or(
            self.warm_pool_autosize,
            "SANDBOX_WARM_POOL_AUTOSIZE",
            false,
        );
        let mut max = int_or(self.warm_pool_max, "SANDBOX_WARM_POOL_MAX", 0);
        if autosize && max == 0 {
            max = 10;
        }
        WarmPoolConfig {
            size: int_or(self.warm_pool_size, "SANDBOX_WARM_POOL_SIZE", 0),
            min: int_or(self.warm_pool_min, "SANDBOX_WARM_POOL_MIN", 0),
            max,
            autosize,
            idle_ttl: self.idle_ttl(),
        }
    }

    /// Resolved cache volume parameters.
    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            mode: string_or(&self.cache_mode, "SANDBOX_CACHE_MODE", DEFAULT_CACHE_MODE),
            hostpath: string_or(
                &self.cache_hostpath,
                "SANDBOX_CACHE_HOSTPATH",
                DEFAULT_CACHE_HOSTPATH,
            ),
            pvc_size: string_or(
                &self.cache_pvc_size,
                "SANDBOX_CACHE_PVC_SIZE",
                DEFAULT_CACHE_PVC_SIZE,
            ),
            pvc_storage_class: string_or(
                &self.cache_pvc_storage_class,
                "SANDBOX_CACHE_PVC_STORAGE_CLASS",
                "",
            ),
            pvc_access_mode: string_or(
                &self.cache_pvc_access_mode,
                "SANDBOX_CACHE_PVC_ACCESS_MODE",
                DEFAULT_CACHE_PVC_ACCESS_MODE,
            ),
        }
    }

    /// Cache parameters for one create request: request fields override the
    /// configured values where present.
    pub fn cache_for_request(&self, req: &CreateSandboxRequest) -> CacheConfig {
        let mut cfg = self.cache();
        if !req.cache_mode.is_empty() {
            cfg.mode = req.cache_mode.clone();
        }
        if !req.cache_pvc_size.is_empty() {
            cfg.pvc_size = req.cache_pvc_size.clone();
        }
        if !req.cache_pvc_storage_class.is_empty() {
            cfg.pvc_storage_class = req.cache_pvc_storage_class.clone();
        }
        if !req.cache_pvc_access_mode.is_empty() {
            cfg.pvc_access_mode = req.cache_pvc_access_mode.clone();
        }
        cfg
    }

    /// Resolved output streaming parameters.
    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            mode: string_or(&self.stream_mode, "SANDBOX_STREAM_MODE", DEFAULT_STREAM_MODE),
            sidecar_image: string_or(
                &self.stream_sidecar_image,
                "SANDBOX_STREAM_SIDECAR_IMAGE",
                "",
            ),
            endpoint: string_or(&self.stream_endpoint, "SANDBOX_STREAM_ENDPOINT", ""),
            events_dir: string_or(
                &self.stream_events_dir,
                "SANDBOX_STREAM_EVENTS_DIR",
                DEFAULT_STREAM_EVENTS_DIR,
            ),
            buffer: int_or(self.stream_buffer, "SANDBOX_STREAM_BUFFER", DEFAULT_STREAM_BUFFER),
        }
    }

    /// Resolved resource requests/limits for the sandbox container.
    pub fn resources(&self) -> ResourceConfig {
        ResourceConfig {
            cpu_request: string_or(&self.cpu_request, "SANDBOX_CPU_REQUEST", ""),
            mem_request: string_or(&self.mem_request, "SANDBOX_MEM_REQUEST", ""),
            cpu_limit: string_or(&self.cpu_limit, "SANDBOX_CPU_LIMIT", ""),
            mem_limit: string_or(&self.mem_limit, "SANDBOX_MEM_LIMIT", ""),
        }
    }

    /// How long a sandbox may sit without execs before the reaper deletes it.
    pub fn idle_ttl(&self) -> Duration {
        duration_or(&self.idle_ttl, "SANDBOX_IDLE_TTL", DEFAULT_IDLE_TTL)
    }

    /// How long the create readiness tracker waits for the pod.
    pub fn create_ready_timeout(&self) -> Duration {
        duration_or(
            &self.create_ready_timeout,
            "SANDBOX_CREATE_READY_TIMEOUT",
            DEFAULT_CREATE_READY_TIMEOUT,
        )
    }

    /// Whether execs default to asynchronous dispatch.
    pub fn async_exec_default(&self) -> bool {
        match self.async_exec {
            Some(v) => v,
            None => env_bool("SANDBOX_ASYNC_EXEC").unwrap_or(true),
        }
    }

    /// How long terminal exec records are retained.
    pub fn exec_status_retention(&self) -> Duration {
        duration_or(
            &self.exec_status_retention,
            "SANDBOX_EXEC_STATUS_RETENTION",
            DEFAULT_EXEC_STATUS_RETENTION,
        )
    }

    /// Default exec timeout applied when a request carries none. `None`
    /// means unlimited.
    pub fn exec_timeout(&self) -> Option<Duration> {
        optional_duration(&self.exec_timeout, "SANDBOX_EXEC_TIMEOUT")
    }

    /// Hard upper bound on any exec timeout. `None` means unbounded.
    pub fn exec_max_timeout(&self) -> Option<Duration> {
        optional_duration(&self.exec_max_timeout, "SANDBOX_EXEC_MAX_TIMEOUT")
    }

    /// The advisory allowed-host list from YAML or environment.
    pub fn allowed_hosts(&self) -> Vec<String> {
        if !self.allowed_hosts.is_empty() {
            return self.allowed_hosts.clone();
        }
        split_csv(&std::env::var("SANDBOX_ALLOWED_HOSTS").unwrap_or_default())
    }

    /// The advisory disallowed-host list from YAML or environment.
    pub fn disallowed_hosts(&self) -> Vec<String> {
        if !self.disallowed_hosts.is_empty() {
            return self.disallowed_hosts.clone();
        }
        split_csv(&std::env::var("SANDBOX_DISALLOWED_HOSTS").unwrap_or_default())
    }

    /// Environment variables injected into every sandbox container: the
    /// config `env` map merged with `SANDBOX_ENV_*` process variables.
    pub fn sandbox_env(&self) -> HashMap<String, String> {
        let mut envs: HashMap<String, String> = self
            .env
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, val) in std::env::vars() {
            if let Some(name) = key.strip_prefix(ENV_INJECT_PREFIX) {
                if !name.is_empty() {
                    envs.insert(name.to_string(), val);
                }
            }
        }
        envs
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits a comma-separated list, trimming whitespace and dropping empties.
pub fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Joins a list with commas.
pub fn join_csv(list: &[String]) -> String {
    list.join(",")
}

fn string_or(yaml: &str, env_key: &str, fallback: &str) -> String {
    if !yaml.is_empty() {
        return yaml.to_string();
    }
    match std::env::var(env_key) {
        Result::Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn int_or(yaml: usize, env_key: &str, fallback: usize) -> usize {
    if yaml != 0 {
        return yaml;
    }
    std::env::var(env_key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn bool_or(yaml: bool, env_key: &str, fallback: bool) -> bool {
    if yaml {
        return true;
    }
    env_bool(env_key).unwrap_or(fallback)
}

fn env_bool(env_key: &str) -> Option<bool> {
    let v = std::env::var(env_key).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn duration_or(yaml: &str, env_key: &str, fallback: Duration) -> Duration {
    optional_duration(yaml, env_key).unwrap_or(fallback)
}

fn optional_duration(yaml: &str, env_key: &str) -> Option<Duration> {
    if let Some(d) = parse_duration(yaml) {
        return Some(d);
    }
    std::env::var(env_key).ok().and_then(|v| parse_duration(&v))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_apply_when_everything_is_unset() {
        let cfg = Config::default();
        assert_eq!(cfg.image(), DEFAULT_IMAGE);
        assert_eq!(cfg.volume_mode(), DEFAULT_VOLUME_MODE);
        assert_eq!(cfg.cache().mode, DEFAULT_CACHE_MODE);
        assert_eq!(cfg.idle_ttl(), DEFAULT_IDLE_TTL);
        assert_eq!(cfg.stream().buffer, DEFAULT_STREAM_BUFFER);
        assert!(cfg.async_exec_default());
        assert_eq!(cfg.exec_timeout(), None);
        assert_eq!(cfg.exec_max_timeout(), None);
    }

    #[test]
    fn test_yaml_values_win() {
        let cfg = from_yaml(
            r#"
image: custom:latest
volume_mode: pvc
idle_ttl: 1s
warm_pool_size: 3
async_exec: false
exec_max_timeout: 2m
"#,
        );
        assert_eq!(cfg.image(), "custom:latest");
        assert_eq!(cfg.volume_mode(), "pvc");
        assert_eq!(cfg.idle_ttl(), Duration::from_secs(1));
        assert_eq!(cfg.warm_pool().size, 3);
        assert!(!cfg.async_exec_default());
        assert_eq!(cfg.exec_max_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_autosize_defaults_max_to_ten() {
        let cfg = from_yaml("warm_pool_autosize: true\nwarm_pool_min: 2\n");
        let pool = cfg.warm_pool();
        assert!(pool.autosize);
        assert_eq!(pool.min, 2);
        assert_eq!(pool.max, 10);
    }

    #[test]
    fn test_cache_for_request_overrides() {
        let cfg = from_yaml("cache_mode: hostpath\n");
        let req = CreateSandboxRequest {
            cache_mode: "pvc".to_string(),
            cache_pvc_size: "20Gi".to_string(),
            ..Default::default()
        };
        let cache = cfg.cache_for_request(&req);
        assert_eq!(cache.mode, "pvc");
        assert_eq!(cache.pvc_size, "20Gi");
        assert_eq!(cache.pvc_access_mode, DEFAULT_CACHE_PVC_ACCESS_MODE);
    }

    #[test]
    fn test_sandbox_env_merges_injected_process_env() {
        std::env::set_var("SANDBOX_ENV_SBX_CFG_TEST_TOKEN", "tok");
        let cfg = from_yaml("env:\n  FOO: bar\n");
        let env = cfg.sandbox_env();
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("SBX_CFG_TEST_TOKEN").map(String::as_str), Some("tok"));
        std::env::remove_var("SANDBOX_ENV_SBX_CFG_TEST_TOKEN");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbxd.yaml");
        std::fs::write(&path, "image: file:latest\nstream_buffer: 50\n").unwrap();

        let cfg = Config::load_from(&path.to_string_lossy()).unwrap();
        assert_eq!(cfg.image(), "file:latest");
        assert_eq!(cfg.stream().buffer, 50);

        assert!(Config::load_from("/nonexistent/sbxd.yaml").is_err());
    }

    #[test]
    fn test_split_and_join_csv() {
        assert_eq!(split_csv("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_csv("").is_empty());
        assert_eq!(join_csv(&["a".to_string(), "b".to_string()]), "a,b");
    }
}
