use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use sbxapi::{
    CreateSandboxRequest, CreateSandboxResponse, ExecRequest, ExecResponse, GetSandboxResponse,
    SandboxStatus,
};
use tokio::time::interval;

use crate::{
    config::{
        join_csv, Config, ALLOCATED_LABEL, ALLOWED_HOSTS_ANNOTATION, ALLOWED_HOSTS_ENV_VAR,
        CACHE_PVC_NAME, DEFAULT_WAIT_READY, DEFAULT_WORKSPACE_PVC_SIZE,
        DISALLOWED_HOSTS_ANNOTATION, DISALLOWED_HOSTS_ENV_VAR, SANDBOX_NAMESPACE_PREFIX,
        SANDBOX_POD_NAME, WORKSPACE_PVC_NAME,
    },
    exec::{effective_timeout, ExecRegistry, ExecRunner},
    metrics::Metrics,
    orchestrator::{Orchestrator, OrchestratorError, PvcSpec, SandboxPodSpec},
    pool::WarmPool,
    stream::StreamHub,
    utils::{format_age, generate_sandbox_id, valid_sandbox_id},
    SbxdError, SbxdResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Deadline on the provisioning sequence of one create request.
const CREATE_DEADLINE: Duration = Duration::from_secs(20);

/// Deadline on status and listing reads.
const STATUS_DEADLINE: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The sandbox facade: coordinates the orchestrator, warm pool, exec
/// registry and runner behind the HTTP surface.
#[derive(Clone)]
pub struct SandboxManager {
    pub(super) orchestrator: Arc<dyn Orchestrator>,
    pub(super) pool: Arc<WarmPool>,
    pub(super) runner: ExecRunner,
    pub(super) config: Config,
    pub(super) metrics: Arc<Metrics>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxManager {
    /// Wires the facade over the shared components.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<ExecRegistry>,
        hub: Arc<StreamHub>,
        pool: Arc<WarmPool>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let runner = ExecRunner::new(orchestrator.clone(), registry, hub);
        Self {
            orchestrator,
            pool,
            runner,
            config,
            metrics,
        }
    }

    /// The configuration this manager resolves requests against.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a sandbox: claims a warm namespace when the request carries no
    /// id and the pool is enabled, otherwise provisions cold under a 20 s
    /// deadline. Kicks off the asynchronous readiness tracker on success.
    pub async fn create(&self, req: CreateSandboxRequest) -> SbxdResult<CreateSandboxResponse> {
        let requested_id = req.id.clone();
        let id = if req.id.is_empty() {
            generate_sandbox_id()
        } else {
            req.id.clone()
        };
        if !valid_sandbox_id(&id) {
            return Err(SbxdError::Validation(
                "id must be DNS-1123 compatible (lowercase letters, numbers, '-')".to_string(),
            ));
        }

        let image = if req.image.is_empty() {
            self.config.image()
        } else {
            req.image.clone()
        };
        let volume_mode = if req.volume_mode.is_empty() {
            self.config.volume_mode()
        } else {
            req.volume_mode.clone()
        };
        let cache = self.config.cache_for_request(&req);

        let mut env: BTreeMap<String, String> = self.config.sandbox_env().into_iter().collect();
        for (k, v) in &req.env {
            if !k.is_empty() {
                env.insert(k.clone(), v.clone());
            }
        }
        let allowed = if req.allowed_hosts.is_empty() {
            self.config.allowed_hosts()
        } else {
            req.allowed_hosts.clone()
        };
        let disallowed = if req.disallowed_hosts.is_empty() {
            self.config.disallowed_hosts()
        } else {
            req.disallowed_hosts.clone()
        };
        let mut annotations = BTreeMap::new();
        if !allowed.is_empty() {
            env.entry(ALLOWED_HOSTS_ENV_VAR.to_string())
                .or_insert_with(|| join_csv(&allowed));
            annotations.insert(ALLOWED_HOSTS_ANNOTATION.to_string(), join_csv(&allowed));
        }
        if !disallowed.is_empty() {
            env.entry(DISALLOWED_HOSTS_ENV_VAR.to_string())
                .or_insert_with(|| join_csv(&disallowed));
            annotations.insert(
                DISALLOWED_HOSTS_ANNOTATION.to_string(),
                join_csv(&disallowed),
            );
        }

        let mut namespace = sandbox_namespace(&id);
        let mut warm_claimed = false;
        if requested_id.is_empty() && self.pool.enabled() {
            if let Some(claimed) = self.pool.claim(&id).await? {
                namespace = claimed;
                warm_claimed = true;
            }
        }

        let workspace_pvc = (volume_mode == "pvc").then(|| WORKSPACE_PVC_NAME.to_string());
        let spec = SandboxPodSpec::builder()
            .image(image)
            .command(req.command.clone())
            .volume_mode(volume_mode.clone())
            .workspace_pvc(workspace_pvc.clone())
            .cache(cache.clone())
            .stream(self.config.stream())
            .env(env)
            .annotations(annotations.clone())
            .resources(self.config.resources())
            .build();

        let provision = async {
            self.orchestrator
                .ensure_namespace(&namespace, &BTreeMap::new(), &annotations)
                .await?;
            if let Some(pvc) = &workspace_pvc {
                self.orchestrator
                    .ensure_pvc(
                        &namespace,
                        pvc,
                        &PvcSpec::builder().size(DEFAULT_WORKSPACE_PVC_SIZE).build(),
                    )
                    .await?;
            }
            if cache.mode == "pvc" {
                self.orchestrator
                    .ensure_pvc(&namespace, CACHE_PVC_NAME, &PvcSpec::for_cache(&cache))
                    .await?;
            }
            self.orchestrator
                .ensure_pod(&namespace, SANDBOX_POD_NAME, &spec)
                .await
        };
        tokio::time::timeout(CREATE_DEADLINE, provision)
            .await
            .map_err(|_| SbxdError::Orchestrator(OrchestratorError::Deadline))??;

        self.metrics.record_create(warm_claimed);
        if self.pool.enabled() {
            self.pool.record_create();
        }
        self.track_ready_async(namespace.clone());

        let id = if warm_claimed { namespace.clone() } else { id };
        Ok(CreateSandboxResponse {
            id,
            namespace,
            pod_name: SANDBOX_POD_NAME.to_string(),
        })
    }

    /// Fetches one sandbox's pod phase.
    pub async fn status(&self, id: &str) -> SbxdResult<GetSandboxResponse> {
        let namespace = sandbox_namespace(id);
        let pod = tokio::time::timeout(
            STATUS_DEADLINE,
            self.orchestrator.get_pod(&namespace, SANDBOX_POD_NAME),
        )
        .await
        .map_err(|_| SbxdError::Orchestrator(OrchestratorError::Deadline))?
        .map_err(|err| SbxdError::NotFound(err.to_string()))?;
        Ok(GetSandboxResponse {
            id: id.to_string(),
            namespace,
            pod_name: pod.name,
            phase: pod.phase,
        })
    }

    /// Lists every sandbox namespace, sorted by id.
    pub async fn list(&self) -> SbxdResult<Vec<SandboxStatus>> {
        let namespaces = tokio::time::timeout(
            STATUS_DEADLINE,
            self.orchestrator.list_namespaces(None),
        )
        .await
        .map_err(|_| SbxdError::Orchestrator(OrchestratorError::Deadline))??;

        let now = Utc::now();
        let mut statuses: Vec<SandboxStatus> = namespaces
            .into_iter()
            .filter(|ns| ns.name.starts_with(SANDBOX_NAMESPACE_PREFIX))
            .map(|ns| {
                let allocated = match ns.label(ALLOCATED_LABEL) {
                    Some(v) if !v.is_empty() => v.to_string(),
                    _ => "true".to_string(),
                };
                let last_exec_time = match ns.last_exec_unix() {
                    Some(unix) if unix != 0 => chrono::DateTime::from_timestamp(unix, 0)
                        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                        .unwrap_or_else(|| "-".to_string()),
                    _ => "-".to_string(),
                };
                let age = ns
                    .created_at
                    .map(|created| (now - created).to_std().unwrap_or_default())
                    .unwrap_or_default();
                SandboxStatus {
                    id: ns.name.clone(),
                    namespace: ns.name,
                    age: format_age(age),
                    state: ns.phase,
                    allocated,
                    last_exec_time,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(statuses)
    }

    /// Deletes a sandbox namespace.
    pub async fn delete(&self, id: &str) -> SbxdResult<()> {
        let namespace = sandbox_namespace(id);
        tokio::time::timeout(CREATE_DEADLINE, self.orchestrator.delete_namespace(&namespace))
            .await
            .map_err(|_| SbxdError::Orchestrator(OrchestratorError::Deadline))??;
        self.metrics.record_delete();
        Ok(())
    }

    /// Dispatches an exec once the sandbox pod is ready.
    pub async fn exec(&self, id: &str, req: ExecRequest) -> SbxdResult<ExecResponse> {
        if req.command.is_empty() {
            return Err(SbxdError::Validation("command is required".to_string()));
        }
        let namespace = sandbox_namespace(id);
        self.wait_for_pod_ready(&namespace, DEFAULT_WAIT_READY)
            .await?;

        let use_async = req.r#async.unwrap_or_else(|| self.config.async_exec_default());
        if use_async {
            let timeout = effective_timeout(
                req.timeout_seconds,
                self.config.exec_timeout(),
                self.config.exec_max_timeout(),
            );
            let exec_id = self.runner.spawn_async(
                &namespace,
                req.command,
                timeout,
                req.timeout_seconds,
                &self.config.stream(),
            );
            self.metrics.record_exec();
            return Ok(ExecResponse {
                exec_id,
                status: "running".to_string(),
                ..Default::default()
            });
        }

        let resp = self.runner.run_sync(&namespace, &req.command).await?;
        self.metrics.record_exec();
        Ok(resp)
    }

    /// Polls until the sandbox pod is Running and Ready, surfacing every
    /// failure as a not-ready condition for the caller's 409.
    pub async fn wait_for_pod_ready(&self, namespace: &str, timeout: Duration) -> SbxdResult<()> {
        let poll = async {
            let mut tick = interval(Duration::from_millis(500));
            loop {
                tick.tick().await;
                match self
                    .orchestrator
                    .get_pod(namespace, SANDBOX_POD_NAME)
                    .await
                {
                    Result::Ok(pod) if pod.ready => return Result::Ok(()),
                    Result::Ok(_) => continue,
                    Err(err) => return Err(err),
                }
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Result::Ok(Result::Ok(())) => Ok(()),
            Result::Ok(Err(err)) => Err(SbxdError::NotReady(err.to_string())),
            Err(_) => Err(SbxdError::NotReady(
                "timed out waiting for pod readiness".to_string(),
            )),
        }
    }

    /// Tracks how long the new sandbox takes to become ready and records the
    /// latency, without holding up the create response.
    fn track_ready_async(&self, namespace: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let timeout = manager.config.create_ready_timeout();
            if manager
                .wait_for_pod_ready(&namespace, timeout)
                .await
                .is_ok()
            {
                manager
                    .metrics
                    .record_create_ready(start.elapsed().as_millis() as i64);
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a request-path id to its namespace: warm claims hand back the
/// namespace name itself, cold ids get the `sbx-` prefix.
pub fn sandbox_namespace(id: &str) -> String {
    if id.starts_with(SANDBOX_NAMESPACE_PREFIX) {
        id.to_string()
    } else {
        format!("{}{}", SANDBOX_NAMESPACE_PREFIX, id)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
