//! Capability surface over the external cluster orchestrator.
//!
//! The control logic only ever talks to the [`Orchestrator`] trait and its
//! cluster-agnostic records; the kube-backed implementation translates them
//! to Kubernetes objects. Concurrent warm-pool claims rely on
//! [`Orchestrator::update_namespace`] being conditional: an update against a
//! stale `resource_version` must fail with [`OrchestratorError::Conflict`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sbxapi::StdStream;
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

use crate::config::{CacheConfig, ResourceConfig, StreamConfig, LAST_EXEC_ANNOTATION};

mod error;
mod kube;

#[cfg(test)]
pub(crate) mod fake;

pub use error::*;
pub use self::kube::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A cluster-agnostic view of a namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceRecord {
    /// The namespace name.
    pub name: String,

    /// Namespace labels.
    pub labels: BTreeMap<String, String>,

    /// Namespace annotations.
    pub annotations: BTreeMap<String, String>,

    /// When the namespace was created.
    pub created_at: Option<DateTime<Utc>>,

    /// Namespace phase as reported by the cluster, e.g. `Active`.
    pub phase: String,

    /// Optimistic-concurrency token; conditional updates fail with
    /// [`OrchestratorError::Conflict`] when it is stale.
    pub resource_version: Option<String>,
}

/// A cluster-agnostic view of a pod.
#[derive(Debug, Clone, Default)]
pub struct PodRecord {
    /// The pod name.
    pub name: String,

    /// Pod phase, e.g. `Pending`, `Running`.
    pub phase: String,

    /// Whether the pod is Running and reports the Ready condition.
    pub ready: bool,
}

/// Parameters for a persistent volume claim.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PvcSpec {
    /// Requested storage size, e.g. `10Gi`.
    #[builder(setter(into))]
    pub size: String,

    /// Storage class; `None` selects the cluster default.
    #[builder(default)]
    pub storage_class: Option<String>,

    /// Access mode, e.g. `ReadWriteOnce` (also accepts `rwo`/`rwx`/`rox`).
    #[builder(default = "ReadWriteOnce".to_string(), setter(into))]
    pub access_mode: String,
}

/// Everything needed to materialize the single `sandbox` pod of a namespace.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SandboxPodSpec {
    /// Container image.
    #[builder(setter(into))]
    pub image: String,

    /// Entrypoint argv; empty means `sleep infinity`.
    #[builder(default)]
    pub command: Vec<String>,

    /// Workspace volume mode: `emptydir` or `pvc`.
    #[builder(setter(into))]
    pub volume_mode: String,

    /// Name of the workspace PVC when `volume_mode` is `pvc`.
    #[builder(default)]
    pub workspace_pvc: Option<String>,

    /// Cache volume parameters.
    pub cache: CacheConfig,

    /// Streaming parameters; sidecar mode adds the events volume and the
    /// forwarder container.
    pub stream: StreamConfig,

    /// Environment variables for the sandbox container, sorted by name.
    #[builder(default)]
    pub env: BTreeMap<String, String>,

    /// Pod labels.
    #[builder(default)]
    pub labels: BTreeMap<String, String>,

    /// Pod annotations.
    #[builder(default)]
    pub annotations: BTreeMap<String, String>,

    /// Resource requests and limits.
    #[builder(default)]
    pub resources: ResourceConfig,
}

/// One chunk of remote process output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Which stream the chunk came from.
    pub stream: StdStream,

    /// The chunk payload, lossily decoded as UTF-8.
    pub data: String,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The operations the control plane needs from the cluster.
///
/// Deadlines are applied by callers (`tokio::time::timeout`); cancelling an
/// in-flight call is done by dropping its future. `ensure_*` operations treat
/// `AlreadyExists` as success.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Creates the namespace if absent; otherwise merges the given labels and
    /// annotations, updating only when something changed.
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> OrchestratorResult<()>;

    /// Fetches one namespace.
    async fn get_namespace(&self, name: &str) -> OrchestratorResult<NamespaceRecord>;

    /// Conditionally replaces a namespace's labels and annotations. Fails
    /// with [`OrchestratorError::Conflict`] when the record's
    /// `resource_version` is stale.
    async fn update_namespace(&self, record: &NamespaceRecord) -> OrchestratorResult<()>;

    /// Lists namespaces, optionally filtered by a `k=v,k2=v2` label selector.
    async fn list_namespaces(&self, selector: Option<&str>)
        -> OrchestratorResult<Vec<NamespaceRecord>>;

    /// Deletes a namespace.
    async fn delete_namespace(&self, name: &str) -> OrchestratorResult<()>;

    /// Creates the PVC if absent; present PVCs are left untouched.
    async fn ensure_pvc(&self, namespace: &str, name: &str, spec: &PvcSpec)
        -> OrchestratorResult<()>;

    /// Creates the pod if absent; present pods are left untouched.
    async fn ensure_pod(
        &self,
        namespace: &str,
        name: &str,
        spec: &SandboxPodSpec,
    ) -> OrchestratorResult<()>;

    /// Fetches one pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> OrchestratorResult<PodRecord>;

    /// Runs a command inside a pod container, streaming output chunks into
    /// `sink`. A non-zero remote exit surfaces as
    /// [`OrchestratorError::ExitCode`].
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        sink: mpsc::Sender<OutputChunk>,
    ) -> OrchestratorResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PvcSpec {
    /// The PVC parameters for a sandbox's cache volume.
    pub fn for_cache(cache: &CacheConfig) -> Self {
        Self {
            size: cache.pvc_size.clone(),
            storage_class: (!cache.pvc_storage_class.is_empty())
                .then(|| cache.pvc_storage_class.clone()),
            access_mode: cache.pvc_access_mode.clone(),
        }
    }
}

impl NamespaceRecord {
    /// Returns a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Returns an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Parses the `sbx.last_exec_at` annotation. Returns `None` when the
    /// annotation is missing or malformed; `Some(0)` means "never".
    pub fn last_exec_unix(&self) -> Option<i64> {
        self.annotation(LAST_EXEC_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a label map satisfies a `k=v,k2=v2` equality selector.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').filter(|p| !p.is_empty()).all(|pair| {
        match pair.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => false,
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
