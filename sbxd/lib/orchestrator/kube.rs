//! Kubernetes-backed implementation of the [`Orchestrator`] trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{
        Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource, Namespace,
        ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Toleration, Volume,
        VolumeMount, VolumeResourceRequirements,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Status},
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, ObjectMeta, PostParams},
    Client,
};
use sbxapi::StdStream;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
};

use crate::config::{CACHE_PVC_NAME, SANDBOX_CONTAINER_NAME};

use super::{
    NamespaceRecord, OrchestratorError, OrchestratorResult, OutputChunk, PodRecord, PvcSpec,
    SandboxPodSpec,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An [`super::Orchestrator`] backed by a Kubernetes cluster.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KubeOrchestrator {
    /// Connects using the ambient environment: in-cluster service account
    /// when running inside a pod, kubeconfig otherwise.
    pub async fn connect() -> OrchestratorResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| OrchestratorError::Permanent(format!("kube client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl super::Orchestrator for KubeOrchestrator {
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> OrchestratorResult<()> {
        let api = self.namespaces();
        match api.get(name).await {
            Result::Ok(mut ns) => {
                let mut updated = false;
                if !labels.is_empty() {
                    let existing = ns.metadata.labels.get_or_insert_with(BTreeMap::new);
                    for (k, v) in labels {
                        if existing.get(k) != Some(v) {
                            existing.insert(k.clone(), v.clone());
                            updated = true;
                        }
                    }
                }
                if !annotations.is_empty() {
                    let existing = ns.metadata.annotations.get_or_insert_with(BTreeMap::new);
                    for (k, v) in annotations {
                        if existing.get(k) != Some(v) {
                            existing.insert(k.clone(), v.clone());
                            updated = true;
                        }
                    }
                }
                if updated {
                    api.replace(name, &PostParams::default(), &ns)
                        .await
                        .map_err(map_kube_error)?;
                }
                Ok(())
            }
            Err(err) => {
                let mapped = map_kube_error(err);
                if !mapped.is_not_found() {
                    return Err(mapped);
                }
                let ns = Namespace {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        labels: (!labels.is_empty()).then(|| labels.clone()),
                        annotations: (!annotations.is_empty()).then(|| annotations.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match api.create(&PostParams::default(), &ns).await {
                    Result::Ok(_) => Ok(()),
                    Err(err) => match map_kube_error(err) {
                        OrchestratorError::AlreadyExists(_) => Ok(()),
                        other => Err(other),
                    },
                }
            }
        }
    }

    async fn get_namespace(&self, name: &str) -> OrchestratorResult<NamespaceRecord> {
        let ns = self.namespaces().get(name).await.map_err(map_kube_error)?;
        Ok(namespace_to_record(&ns))
    }

    async fn update_namespace(&self, record: &NamespaceRecord) -> OrchestratorResult<()> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(record.name.clone()),
                labels: Some(record.labels.clone()),
                annotations: Some(record.annotations.clone()),
                resource_version: record.resource_version.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        self.namespaces()
            .replace(&record.name, &PostParams::default(), &ns)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn list_namespaces(
        &self,
        selector: Option<&str>,
    ) -> OrchestratorResult<Vec<NamespaceRecord>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        let list = self
            .namespaces()
            .list(&params)
            .await
            .map_err(map_kube_error)?;
        Ok(list.items.iter().map(namespace_to_record).collect())
    }

    async fn delete_namespace(&self, name: &str) -> OrchestratorResult<()> {
        self.namespaces()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn ensure_pvc(
        &self,
        namespace: &str,
        name: &str,
        spec: &PvcSpec,
    ) -> OrchestratorResult<()> {
        let api = self.pvcs(namespace);
        match api.get(name).await {
            Result::Ok(_) => return Ok(()),
            Err(err) => {
                let mapped = map_kube_error(err);
                if !mapped.is_not_found() {
                    return Err(mapped);
                }
            }
        }
        let pvc = build_pvc(name, spec);
        match api.create(&PostParams::default(), &pvc).await {
            Result::Ok(_) => Ok(()),
            Err(err) => match map_kube_error(err) {
                OrchestratorError::AlreadyExists(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn ensure_pod(
        &self,
        namespace: &str,
        name: &str,
        spec: &SandboxPodSpec,
    ) -> OrchestratorResult<()> {
        let api = self.pods(namespace);
        match api.get(name).await {
            Result::Ok(_) => return Ok(()),
            Err(err) => {
                let mapped = map_kube_error(err);
                if !mapped.is_not_found() {
                    return Err(mapped);
                }
            }
        }
        let pod = build_sandbox_pod(name, spec);
        match api.create(&PostParams::default(), &pod).await {
            Result::Ok(_) => Ok(()),
            Err(err) => match map_kube_error(err) {
                OrchestratorError::AlreadyExists(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> OrchestratorResult<PodRecord> {
        let pod = self
            .pods(namespace)
            .get(name)
            .await
            .map_err(map_kube_error)?;
        Ok(pod_to_record(&pod))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        sink: mpsc::Sender<OutputChunk>,
    ) -> OrchestratorResult<()> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(map_kube_error)?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status_fut = attached.take_status();
        tokio::join!(
            pump_output(stdout, StdStream::Stdout, sink.clone()),
            pump_output(stderr, StdStream::Stderr, sink),
        );

        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };
        let _ = attached.join().await;
        interpret_exec_status(status)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn pump_output(
    reader: Option<impl AsyncRead + Unpin>,
    stream: StdStream,
    sink: mpsc::Sender<OutputChunk>,
) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Result::Ok(0) | Err(_) => break,
            Result::Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                if sink.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Translates the exec termination status into the failure taxonomy. The
/// remote exit code rides in a `NonZeroExitCode` status cause.
fn interpret_exec_status(status: Option<Status>) -> OrchestratorResult<()> {
    let Some(status) = status else {
        return Ok(());
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.trim().parse::<i32>().ok());
        if let Some(code) = code {
            return Err(OrchestratorError::ExitCode { code });
        }
    }
    Err(OrchestratorError::Permanent(
        status.message.unwrap_or_else(|| "exec failed".to_string()),
    ))
}

fn map_kube_error(err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => OrchestratorError::NotFound(resp.message),
            409 if resp.reason == "AlreadyExists" => OrchestratorError::AlreadyExists(resp.message),
            409 => OrchestratorError::Conflict(resp.message),
            408 | 504 => OrchestratorError::Deadline,
            code if code >= 500 => OrchestratorError::Transient(resp.message),
            _ => OrchestratorError::Permanent(resp.message),
        },
        other => OrchestratorError::Transient(other.to_string()),
    }
}

fn namespace_to_record(ns: &Namespace) -> NamespaceRecord {
    NamespaceRecord {
        name: ns.metadata.name.clone().unwrap_or_default(),
        labels: ns.metadata.labels.clone().unwrap_or_default(),
        annotations: ns.metadata.annotations.clone().unwrap_or_default(),
        created_at: ns.metadata.creation_timestamp.as_ref().map(|t| t.0),
        phase: ns
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        resource_version: ns.metadata.resource_version.clone(),
    }
}

fn pod_to_record(pod: &Pod) -> PodRecord {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    let ready = phase == "Running"
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });
    PodRecord {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase,
        ready,
    }
}

fn build_pvc(name: &str, spec: &PvcSpec) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(spec.size.clone()));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![parse_access_mode(&spec.access_mode)]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            storage_class_name: spec.storage_class.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Normalizes an access mode; short forms `rwo`/`rwx`/`rox` are accepted,
/// anything unrecognized falls back to `ReadWriteOnce`.
fn parse_access_mode(val: &str) -> String {
    match val.trim().to_ascii_lowercase().as_str() {
        "readwritemany" | "rwx" => "ReadWriteMany".to_string(),
        "readonlymany" | "rox" => "ReadOnlyMany".to_string(),
        _ => "ReadWriteOnce".to_string(),
    }
}

/// Builds the sandbox pod: one `sandbox` container with cache and workspace
/// volumes, and in sidecar stream mode the shared events volume plus the
/// forwarder container.
fn build_sandbox_pod(name: &str, spec: &SandboxPodSpec) -> Pod {
    let command = if spec.command.is_empty() {
        vec!["sleep".to_string(), "infinity".to_string()]
    } else {
        spec.command.clone()
    };

    let mut volumes = vec![cache_volume(&spec.cache)];
    let mut mounts = vec![VolumeMount {
        name: CACHE_PVC_NAME.to_string(),
        mount_path: "/cache".to_string(),
        ..Default::default()
    }];

    if spec.volume_mode == "pvc" {
        volumes.push(Volume {
            name: "workspace".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: spec.workspace_pvc.clone().unwrap_or_default(),
                ..Default::default()
            }),
            ..Default::default()
        });
    } else {
        volumes.push(Volume {
            name: "workspace".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }
    mounts.push(VolumeMount {
        name: "workspace".to_string(),
        mount_path: "/workspace".to_string(),
        ..Default::default()
    });

    let sidecar = spec.stream.mode == "sidecar";
    if sidecar {
        volumes.push(Volume {
            name: "sbx-events".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "sbx-events".to_string(),
            mount_path: spec.stream.events_dir.clone(),
            ..Default::default()
        });
    }

    let mut containers = vec![Container {
        name: SANDBOX_CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        command: Some(command),
        env: env_vars(&spec.env),
        volume_mounts: Some(mounts),
        resources: resource_requirements(&spec.resources),
        ..Default::default()
    }];

    if sidecar && !spec.stream.sidecar_image.is_empty() {
        containers.push(Container {
            name: "stream".to_string(),
            image: Some(spec.stream.sidecar_image.clone()),
            env: Some(vec![
                EnvVar {
                    name: "SBX_STREAM_ENDPOINT".to_string(),
                    value: Some(spec.stream.endpoint.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "SBX_EVENTS_DIR".to_string(),
                    value: Some(spec.stream.events_dir.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "SBX_SANDBOX_ID".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.namespace".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: "sbx-events".to_string(),
                mount_path: spec.stream.events_dir.clone(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            annotations: (!spec.annotations.is_empty()).then(|| spec.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            tolerations: Some(vec![
                Toleration {
                    key: Some("node-role.kubernetes.io/control-plane".to_string()),
                    operator: Some("Exists".to_string()),
                    effect: Some("NoSchedule".to_string()),
                    ..Default::default()
                },
                Toleration {
                    key: Some("node.kubernetes.io/not-ready".to_string()),
                    operator: Some("Exists".to_string()),
                    effect: Some("NoSchedule".to_string()),
                    ..Default::default()
                },
            ]),
            containers,
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn cache_volume(cache: &crate::config::CacheConfig) -> Volume {
    match cache.mode.as_str() {
        "hostpath" => Volume {
            name: CACHE_PVC_NAME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: cache.hostpath.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        "pvc" => Volume {
            name: CACHE_PVC_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: CACHE_PVC_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        _ => Volume {
            name: CACHE_PVC_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

fn env_vars(env: &BTreeMap<String, String>) -> Option<Vec<EnvVar>> {
    if env.is_empty() {
        return None;
    }
    Some(
        env.iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect(),
    )
}

fn resource_requirements(resources: &crate::config::ResourceConfig) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    if !resources.cpu_request.is_empty() {
        requests.insert("cpu".to_string(), Quantity(resources.cpu_request.clone()));
    }
    if !resources.mem_request.is_empty() {
        requests.insert("memory".to_string(), Quantity(resources.mem_request.clone()));
    }
    if !resources.cpu_limit.is_empty() {
        limits.insert("cpu".to_string(), Quantity(resources.cpu_limit.clone()));
    }
    if !resources.mem_limit.is_empty() {
        limits.insert("memory".to_string(), Quantity(resources.mem_limit.clone()));
    }
    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
