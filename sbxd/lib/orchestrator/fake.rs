//! In-memory [`Orchestrator`] used by unit tests. Mirrors the conditional
//! update semantics of the real cluster so claim races can be exercised.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{
    matches_selector, NamespaceRecord, Orchestrator, OrchestratorError, OrchestratorResult,
    OutputChunk, PodRecord, PvcSpec, SandboxPodSpec,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Scripted behavior for one `exec` invocation.
pub(crate) enum ExecBehavior {
    /// Emit the given chunks, then finish with the given result.
    Finish(Vec<OutputChunk>, OrchestratorResult<()>),
    /// Emit the given chunks, then block until the exec future is dropped.
    Hang(Vec<OutputChunk>),
}

#[derive(Default)]
struct FakeNamespace {
    record: NamespaceRecord,
    pods: BTreeMap<String, FakePod>,
    pvcs: BTreeMap<String, PvcSpec>,
}

struct FakePod {
    spec: SandboxPodSpec,
    phase: String,
    ready: bool,
}

/// The fake cluster.
#[derive(Default)]
pub(crate) struct FakeOrchestrator {
    namespaces: Mutex<BTreeMap<String, FakeNamespace>>,
    exec_script: Mutex<VecDeque<ExecBehavior>>,
    exec_calls: Mutex<Vec<(String, Vec<String>)>>,
    version_counter: Mutex<u64>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeOrchestrator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        let mut counter = self.version_counter.lock().unwrap();
        *counter += 1;
        counter.to_string()
    }

    /// Queues a behavior for the next `exec` call. Unscripted calls succeed
    /// with no output.
    pub(crate) fn push_exec(&self, behavior: ExecBehavior) {
        self.exec_script.lock().unwrap().push_back(behavior);
    }

    /// The `(namespace, argv)` of every exec so far.
    pub(crate) fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.exec_calls.lock().unwrap().clone()
    }

    /// Snapshot of one namespace record.
    pub(crate) fn namespace(&self, name: &str) -> Option<NamespaceRecord> {
        self.namespaces
            .lock()
            .unwrap()
            .get(name)
            .map(|ns| ns.record.clone())
    }

    /// All namespace names currently present.
    pub(crate) fn namespace_names(&self) -> Vec<String> {
        self.namespaces.lock().unwrap().keys().cloned().collect()
    }

    /// Whether the pod exists in the namespace.
    pub(crate) fn has_pod(&self, namespace: &str, pod: &str) -> bool {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .is_some_and(|ns| ns.pods.contains_key(pod))
    }

    /// The spec a pod was created with.
    pub(crate) fn pod_spec(&self, namespace: &str, pod: &str) -> Option<SandboxPodSpec> {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .and_then(|ns| ns.pods.get(pod))
            .map(|p| p.spec.clone())
    }

    /// Whether the PVC exists in the namespace.
    pub(crate) fn has_pvc(&self, namespace: &str, pvc: &str) -> bool {
        self.namespaces
            .lock()
            .unwrap()
            .get(namespace)
            .is_some_and(|ns| ns.pvcs.contains_key(pvc))
    }

    /// Flips a pod to Running and Ready (or back).
    pub(crate) fn set_pod_ready(&self, namespace: &str, pod: &str, ready: bool) {
        let mut namespaces = self.namespaces.lock().unwrap();
        if let Some(p) = namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.pods.get_mut(pod))
        {
            p.phase = if ready { "Running" } else { "Pending" }.to_string();
            p.ready = ready;
        }
    }

    /// Overwrites one annotation on a namespace, bypassing versioning.
    pub(crate) fn set_annotation(&self, namespace: &str, key: &str, value: &str) {
        let mut namespaces = self.namespaces.lock().unwrap();
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.record
                .annotations
                .insert(key.to_string(), value.to_string());
        }
    }

    /// Backdates a namespace's creation time.
    pub(crate) fn set_created_at(&self, namespace: &str, at: chrono::DateTime<Utc>) {
        let mut namespaces = self.namespaces.lock().unwrap();
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.record.created_at = Some(at);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> OrchestratorResult<()> {
        let version = self.next_version();
        let mut namespaces = self.namespaces.lock().unwrap();
        match namespaces.get_mut(name) {
            Some(ns) => {
                let mut updated = false;
                for (k, v) in labels {
                    if ns.record.labels.get(k) != Some(v) {
                        ns.record.labels.insert(k.clone(), v.clone());
                        updated = true;
                    }
                }
                for (k, v) in annotations {
                    if ns.record.annotations.get(k) != Some(v) {
                        ns.record.annotations.insert(k.clone(), v.clone());
                        updated = true;
                    }
                }
                if updated {
                    ns.record.resource_version = Some(version);
                }
            }
            None => {
                namespaces.insert(
                    name.to_string(),
                    FakeNamespace {
                        record: NamespaceRecord {
                            name: name.to_string(),
                            labels: labels.clone(),
                            annotations: annotations.clone(),
                            created_at: Some(Utc::now()),
                            phase: "Active".to_string(),
                            resource_version: Some(version),
                        },
                        ..Default::default()
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> OrchestratorResult<NamespaceRecord> {
        self.namespace(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn update_namespace(&self, record: &NamespaceRecord) -> OrchestratorResult<()> {
        let version = self.next_version();
        let mut namespaces = self.namespaces.lock().unwrap();
        let ns = namespaces
            .get_mut(&record.name)
            .ok_or_else(|| OrchestratorError::NotFound(record.name.clone()))?;
        if ns.record.resource_version != record.resource_version {
            return Err(OrchestratorError::Conflict(record.name.clone()));
        }
        ns.record.labels = record.labels.clone();
        ns.record.annotations = record.annotations.clone();
        ns.record.resource_version = Some(version);
        Ok(())
    }

    async fn list_namespaces(
        &self,
        selector: Option<&str>,
    ) -> OrchestratorResult<Vec<NamespaceRecord>> {
        let namespaces = self.namespaces.lock().unwrap();
        Ok(namespaces
            .values()
            .filter(|ns| match selector {
                Some(sel) => matches_selector(&ns.record.labels, sel),
                None => true,
            })
            .map(|ns| ns.record.clone())
            .collect())
    }

    async fn delete_namespace(&self, name: &str) -> OrchestratorResult<()> {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn ensure_pvc(
        &self,
        namespace: &str,
        name: &str,
        spec: &PvcSpec,
    ) -> OrchestratorResult<()> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| OrchestratorError::NotFound(namespace.to_string()))?;
        ns.pvcs.entry(name.to_string()).or_insert_with(|| spec.clone());
        Ok(())
    }

    async fn ensure_pod(
        &self,
        namespace: &str,
        name: &str,
        spec: &SandboxPodSpec,
    ) -> OrchestratorResult<()> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| OrchestratorError::NotFound(namespace.to_string()))?;
        ns.pods.entry(name.to_string()).or_insert_with(|| FakePod {
            spec: spec.clone(),
            phase: "Pending".to_string(),
            ready: false,
        });
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> OrchestratorResult<PodRecord> {
        let namespaces = self.namespaces.lock().unwrap();
        let pod = namespaces
            .get(namespace)
            .and_then(|ns| ns.pods.get(name))
            .ok_or_else(|| OrchestratorError::NotFound(format!("{}/{}", namespace, name)))?;
        Ok(PodRecord {
            name: name.to_string(),
            phase: pod.phase.clone(),
            ready: pod.ready,
        })
    }

    async fn exec(
        &self,
        namespace: &str,
        _pod: &str,
        _container: &str,
        command: &[String],
        sink: mpsc::Sender<OutputChunk>,
    ) -> OrchestratorResult<()> {
        self.exec_calls
            .lock()
            .unwrap()
            .push((namespace.to_string(), command.to_vec()));
        let behavior = self
            .exec_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExecBehavior::Finish(Vec::new(), Ok(())));
        match behavior {
            ExecBehavior::Finish(chunks, result) => {
                for chunk in chunks {
                    let _ = sink.send(chunk).await;
                }
                result
            }
            ExecBehavior::Hang(chunks) => {
                for chunk in chunks {
                    let _ = sink.send(chunk).await;
                }
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
