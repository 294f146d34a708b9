//! Request and response bodies for the sandbox control-plane HTTP API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

//--------------------------------------------------------------------------------------------------
// Types: Sandboxes
//--------------------------------------------------------------------------------------------------

/// Request body for `POST /sandboxes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSandboxRequest {
    /// Sandbox id. Generated when empty; must be DNS-1123 compatible.
    pub id: String,

    /// Container image for the sandbox pod.
    pub image: String,

    /// Command to run as the pod entrypoint. Defaults to `sleep infinity`.
    pub command: Vec<String>,

    /// Workspace volume mode: `emptydir` or `pvc`.
    pub volume_mode: String,

    /// Cache volume mode: `emptydir`, `hostpath` or `pvc`.
    pub cache_mode: String,

    /// Requested size of the cache PVC, e.g. `5Gi`.
    pub cache_pvc_size: String,

    /// Storage class of the cache PVC.
    pub cache_pvc_storage_class: String,

    /// Access mode of the cache PVC, e.g. `ReadWriteOnce`.
    pub cache_pvc_access_mode: String,

    /// Extra environment variables injected into the sandbox container.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Hosts the workload is allowed to reach (advisory).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,

    /// Hosts the workload must not reach (advisory).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disallowed_hosts: Vec<String>,
}

/// Response body for `POST /sandboxes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    /// The sandbox id. For warm claims this is the warm namespace name.
    pub id: String,

    /// The namespace backing the sandbox.
    pub namespace: String,

    /// The name of the sandbox pod.
    pub pod_name: String,
}

/// Response body for `GET /sandboxes/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSandboxResponse {
    /// The sandbox id as given in the request path.
    pub id: String,

    /// The namespace backing the sandbox.
    pub namespace: String,

    /// The name of the sandbox pod.
    pub pod_name: String,

    /// Pod phase as reported by the orchestrator.
    pub phase: String,
}

/// Response body for `DELETE /sandboxes/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSandboxResponse {
    /// Always `"deleted"` on success.
    pub status: String,
}

/// One row of the `GET /sandboxes` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    /// The sandbox id (namespace name).
    pub id: String,

    /// The namespace backing the sandbox.
    pub namespace: String,

    /// Age since namespace creation, rendered like `45s`, `12m`, `3h`, `2d`.
    pub age: String,

    /// Namespace phase as reported by the orchestrator.
    pub state: String,

    /// Allocation marker; `"true"` unless the namespace is labeled otherwise.
    pub allocated: String,

    /// Last exec time, RFC 3339, or `-` when the sandbox never ran a command.
    pub last_exec_time: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Execs
//--------------------------------------------------------------------------------------------------

/// Request body for `POST /sandboxes/{id}/exec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    /// The command argv. Must be non-empty.
    pub command: Vec<String>,

    /// Whether to run asynchronously. Defaults to the server setting.
    pub r#async: Option<bool>,

    /// Per-exec timeout in seconds. Clamped to the server maximum.
    pub timeout_seconds: Option<u64>,
}

/// Response body for `POST /sandboxes/{id}/exec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecResponse {
    /// Collected stdout (sync execs only).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,

    /// Collected stderr (sync execs only).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,

    /// The exec id (async execs only).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exec_id: String,

    /// `running` for async dispatch, `completed` or `failed` for sync execs.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,

    /// Process exit code when the sync exec failed with a known code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// The lifecycle state of an exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// The command is running.
    Running,
    /// Cancellation was requested but the runner has not finished yet.
    Canceling,
    /// The command exited with code 0.
    Completed,
    /// The command failed or exited non-zero.
    Failed,
    /// The command was cancelled on request.
    Canceled,
    /// The command exceeded its deadline.
    TimedOut,
}

impl ExecStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecStatus::Completed | ExecStatus::Failed | ExecStatus::Canceled | ExecStatus::TimedOut
        )
    }
}

/// Response body for `GET /sandboxes/{id}/exec/{exec_id}` and the cancel
/// endpoint: a point-in-time snapshot of the exec record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecStatusResponse {
    /// The sandbox the exec ran in.
    pub sandbox_id: String,

    /// The exec id.
    pub exec_id: String,

    /// Current lifecycle state.
    pub status: ExecStatus,

    /// The timeout the exec was dispatched with, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_seconds: Option<u64>,

    /// Dispatch time, RFC 3339 with nanoseconds.
    pub started_at: String,

    /// Finalization time; set exactly when the status is terminal.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finished_at: String,

    /// Exit code, present only at terminal status when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,

    /// Error message for failed execs.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error: String,
}

/// Error body returned by every endpoint on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable description of what went wrong.
    pub error: String,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
