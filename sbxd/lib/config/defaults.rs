use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants: Defaults
//--------------------------------------------------------------------------------------------------

/// The default sandbox container image.
pub const DEFAULT_IMAGE: &str = "sandbox-base:dev";

/// The default workspace volume mode.
pub const DEFAULT_VOLUME_MODE: &str = "emptydir";

/// The default cache volume mode.
pub const DEFAULT_CACHE_MODE: &str = "emptydir";

/// The default host path backing the cache volume in `hostpath` mode.
pub const DEFAULT_CACHE_HOSTPATH: &str = "/var/lib/sbx-cache";

/// The default cache PVC size.
pub const DEFAULT_CACHE_PVC_SIZE: &str = "5Gi";

/// The default cache PVC access mode.
pub const DEFAULT_CACHE_PVC_ACCESS_MODE: &str = "ReadWriteOnce";

/// The default size of the workspace PVC in `pvc` volume mode.
pub const DEFAULT_WORKSPACE_PVC_SIZE: &str = "10Gi";

/// The namespace holding warm-pool bookkeeping objects.
pub const DEFAULT_WARM_CONTROL_NAMESPACE: &str = "sbx-warm-control";

/// How long an allocated sandbox may sit without execs before it is reaped.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(15 * 60);

/// How long the create readiness tracker waits for the pod.
pub const DEFAULT_CREATE_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long exec waits for the sandbox pod to become ready.
pub const DEFAULT_WAIT_READY: Duration = Duration::from_secs(20);

/// The default output streaming mode.
pub const DEFAULT_STREAM_MODE: &str = "control-plane";

/// Where exec event files are written inside the sandbox pod.
pub const DEFAULT_STREAM_EVENTS_DIR: &str = "/sbx-events";

/// How many events each sandbox's ring buffer retains.
pub const DEFAULT_STREAM_BUFFER: usize = 200;

/// How long terminal exec records are retained before the sweep drops them.
pub const DEFAULT_EXEC_STATUS_RETENTION: Duration = Duration::from_secs(30 * 60);

/// The sliding window over which warm-pool autosizing counts creates.
pub const WARM_WINDOW: Duration = Duration::from_secs(60);

/// The environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV_VAR: &str = "SBXD_CONFIG";

/// Prefix of process environment variables injected into every sandbox.
pub const ENV_INJECT_PREFIX: &str = "SANDBOX_ENV_";

//--------------------------------------------------------------------------------------------------
// Constants: Naming
//--------------------------------------------------------------------------------------------------

/// Prefix of every sandbox namespace.
pub const SANDBOX_NAMESPACE_PREFIX: &str = "sbx-";

/// Prefix of warm-pool namespaces; followed by the pool index.
pub const WARM_NAMESPACE_PREFIX: &str = "sbx-warm-";

/// Name of the single pod inside a sandbox namespace.
pub const SANDBOX_POD_NAME: &str = "sandbox";

/// Name of the command-execution container inside the sandbox pod.
pub const SANDBOX_CONTAINER_NAME: &str = "sandbox";

/// Name of the workspace PVC in `pvc` volume mode.
pub const WORKSPACE_PVC_NAME: &str = "workspace";

/// Name of the cache PVC in `pvc` cache mode.
pub const CACHE_PVC_NAME: &str = "cache";

//--------------------------------------------------------------------------------------------------
// Constants: Labels & Annotations
//--------------------------------------------------------------------------------------------------

/// Label marking a namespace as part of the warm pool.
pub const POOL_LABEL: &str = "sbx.pool";

/// Value of [`POOL_LABEL`] on warm namespaces.
pub const POOL_LABEL_WARM: &str = "warm";

/// Label carrying the warm lifecycle state.
pub const STATE_LABEL: &str = "sbx.state";

/// Warm state: the namespace exists but its pod is not ready yet.
pub const WARM_STATE_CREATING: &str = "creating";

/// Warm state: the pod is running and ready to be claimed.
pub const WARM_STATE_READY: &str = "ready";

/// Warm state: a create request claimed this namespace.
pub const WARM_STATE_CLAIMED: &str = "claimed";

/// Label a namespace can carry to opt out of idle reaping.
pub const ALLOCATED_LABEL: &str = "sbx.allocated";

/// Label recording the externally visible id of a claimed warm namespace.
pub const EXTERNAL_ID_LABEL: &str = "sbx.external_id";

/// Annotation holding the Unix-seconds time of the last exec, or `0`.
pub const LAST_EXEC_ANNOTATION: &str = "sbx.last_exec_at";

/// Annotation surfacing the advisory allowed-host list.
pub const ALLOWED_HOSTS_ANNOTATION: &str = "sbx.allowed_hosts";

/// Annotation surfacing the advisory disallowed-host list.
pub const DISALLOWED_HOSTS_ANNOTATION: &str = "sbx.disallowed_hosts";

/// Environment variable surfacing the allowed-host list to the workload.
pub const ALLOWED_HOSTS_ENV_VAR: &str = "SBX_ALLOWED_HOSTS";

/// Environment variable surfacing the disallowed-host list to the workload.
pub const DISALLOWED_HOSTS_ENV_VAR: &str = "SBX_DISALLOWED_HOSTS";
