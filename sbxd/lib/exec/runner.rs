use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sbxapi::{ExecEvent, ExecResponse, ExecStatus};
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::{StreamConfig, LAST_EXEC_ANNOTATION, SANDBOX_CONTAINER_NAME, SANDBOX_POD_NAME},
    orchestrator::{Orchestrator, OrchestratorError, OutputChunk},
    stream::StreamHub,
    utils::generate_exec_id,
    SbxdResult,
};

use super::{wrap_for_sidecar, CancelHandle, ExecError, ExecRegistry};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives command executions against the orchestrator: the blocking sync
/// path and detached async execs tracked by the registry.
#[derive(Clone)]
pub struct ExecRunner {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<ExecRegistry>,
    hub: Arc<StreamHub>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecRunner {
    /// Creates a runner over the shared orchestrator, registry and hub.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<ExecRegistry>,
        hub: Arc<StreamHub>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            hub,
        }
    }

    /// Runs a command synchronously, folding its output into strings.
    ///
    /// A non-zero remote exit is not an error at this level: the response
    /// carries `status: "failed"` and the exit code. Transport and API
    /// failures propagate. Sync execs are not registered.
    pub async fn run_sync(&self, namespace: &str, command: &[String]) -> SbxdResult<ExecResponse> {
        let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
        let exec_fut = self
            .orchestrator
            .exec(namespace, SANDBOX_POD_NAME, SANDBOX_CONTAINER_NAME, command, tx);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let collect = async {
            while let Some(chunk) = rx.recv().await {
                match chunk.stream {
                    sbxapi::StdStream::Stdout => stdout.push_str(&chunk.data),
                    sbxapi::StdStream::Stderr => stderr.push_str(&chunk.data),
                }
            }
        };
        let (result, ()) = tokio::join!(exec_fut, collect);

        touch_last_exec(self.orchestrator.as_ref(), namespace).await;

        match result {
            Result::Ok(()) => Ok(ExecResponse {
                stdout,
                stderr,
                status: "completed".to_string(),
                ..Default::default()
            }),
            Err(OrchestratorError::ExitCode { code }) => Ok(ExecResponse {
                stdout,
                stderr,
                status: "failed".to_string(),
                exit_code: Some(code),
                ..Default::default()
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Dispatches a detached async exec and returns its id immediately.
    ///
    /// The exec runs on its own task with a fresh cancellation root; the
    /// caller's request lifetime never reaches it. `timeout` bounds the
    /// execution, `timeout_seconds` is what the record reports back.
    pub fn spawn_async(
        &self,
        namespace: &str,
        command: Vec<String>,
        timeout: Option<Duration>,
        timeout_seconds: Option<u64>,
        stream: &StreamConfig,
    ) -> String {
        let exec_id = generate_exec_id();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.registry.create_running(
            namespace,
            &exec_id,
            timeout_seconds,
            CancelHandle::new(cancel_tx),
        );
        self.hub.publish(ExecEvent::start(namespace, &exec_id));

        let sidecar = stream.mode == "sidecar";
        let command = if sidecar {
            wrap_for_sidecar(&exec_id, &command, &stream.events_dir)
        } else {
            command
        };

        let runner = self.clone();
        let namespace = namespace.to_string();
        let task_exec_id = exec_id.clone();
        tokio::spawn(async move {
            runner
                .drive(&namespace, &task_exec_id, command, timeout, cancel_rx, !sidecar)
                .await;
        });
        exec_id
    }

    /// Runs one async exec to completion: streams output, races the cancel
    /// handle and the deadline, finalizes the record, publishes the exit
    /// event, and touches the namespace's last-exec annotation.
    async fn drive(
        &self,
        namespace: &str,
        exec_id: &str,
        command: Vec<String>,
        timeout: Option<Duration>,
        mut cancel_rx: oneshot::Receiver<()>,
        publish_output: bool,
    ) {
        let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
        let exec_fut = self.orchestrator.exec(
            namespace,
            SANDBOX_POD_NAME,
            SANDBOX_CONTAINER_NAME,
            &command,
            tx,
        );
        tokio::pin!(exec_fut);

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut output_open = true;
        let result: Result<(), ExecError> = loop {
            tokio::select! {
                result = &mut exec_fut => break result.map_err(ExecError::from),
                chunk = rx.recv(), if output_open => match chunk {
                    Some(chunk) if publish_output => self.hub.publish(ExecEvent::output(
                        namespace,
                        exec_id,
                        chunk.stream,
                        chunk.data,
                    )),
                    Some(_) => {}
                    None => output_open = false,
                },
                _ = &mut deadline => break Err(ExecError::Deadline),
                _ = &mut cancel_rx => break Err(ExecError::Canceled),
            }
        };

        // Cancellation and timeout drop the in-flight call; whatever output
        // already arrived is still delivered.
        if publish_output {
            while let Result::Ok(chunk) = rx.try_recv() {
                self.hub
                    .publish(ExecEvent::output(namespace, exec_id, chunk.stream, chunk.data));
            }
        }

        let snapshot = self.registry.finish(namespace, exec_id, result.err());
        let exit_code = snapshot.as_ref().and_then(|snap| {
            snap.exit_code
                .or((snap.status == ExecStatus::Completed).then_some(0))
        });
        self.hub
            .publish(ExecEvent::exit(namespace, exec_id, exit_code));

        touch_last_exec(self.orchestrator.as_ref(), namespace).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The timeout an exec actually runs with: the request value, falling back
/// to the configured default, clamped by the configured maximum.
pub fn effective_timeout(
    requested_seconds: Option<u64>,
    default: Option<Duration>,
    max: Option<Duration>,
) -> Option<Duration> {
    let requested = requested_seconds.map(Duration::from_secs).or(default);
    match (requested, max) {
        (Some(timeout), Some(max)) => Some(timeout.min(max)),
        (Some(timeout), None) => Some(timeout),
        (None, max) => max,
    }
}

/// Best-effort bump of the namespace's `sbx.last_exec_at` annotation.
async fn touch_last_exec(orchestrator: &dyn Orchestrator, namespace: &str) {
    let result = async {
        let mut record = orchestrator.get_namespace(namespace).await?;
        record.annotations.insert(
            LAST_EXEC_ANNOTATION.to_string(),
            Utc::now().timestamp().to_string(),
        );
        orchestrator.update_namespace(&record).await
    }
    .await;
    if let Err(err) = result {
        tracing::debug!("update last exec for {}: {}", namespace, err);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sbxapi::{EventType, StdStream};
    use tokio::time::{timeout as await_timeout, Duration as TokioDuration};

    use crate::{
        config::Config,
        orchestrator::fake::{ExecBehavior, FakeOrchestrator},
        stream::Subscription,
    };

    use super::*;

    fn control_plane_stream() -> StreamConfig {
        Config::default().stream()
    }

    fn sidecar_stream() -> StreamConfig {
        StreamConfig {
            mode: "sidecar".to_string(),
            sidecar_image: "sbxstream:dev".to_string(),
            endpoint: "http://sbxd:8080".to_string(),
            events_dir: "/sbx-events".to_string(),
            buffer: 200,
        }
    }

    async fn setup(fake: Arc<FakeOrchestrator>) -> (ExecRunner, Arc<ExecRegistry>, Arc<StreamHub>) {
        fake.ensure_namespace("sbx-a", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        let registry = Arc::new(ExecRegistry::new(Duration::from_secs(1800)));
        let hub = Arc::new(StreamHub::new(200));
        let runner = ExecRunner::new(fake, registry.clone(), hub.clone());
        (runner, registry, hub)
    }

    async fn wait_for_exit(sub: &mut Subscription) -> Vec<ExecEvent> {
        let mut events = sub.snapshot.clone();
        while !events
            .iter()
            .any(|e| e.event_type == EventType::Exit)
        {
            let evt = await_timeout(TokioDuration::from_secs(2), sub.rx.recv())
                .await
                .expect("timed out waiting for exit event")
                .expect("hub channel closed");
            events.push(evt);
        }
        events
    }

    fn chunk(stream: StdStream, data: &str) -> OutputChunk {
        OutputChunk {
            stream,
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_sync_collects_output_and_touches_last_exec() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.push_exec(ExecBehavior::Finish(
            vec![chunk(StdStream::Stdout, "hi\n")],
            Ok(()),
        ));
        let (runner, _, _) = setup(fake.clone()).await;

        let resp = runner
            .run_sync("sbx-a", &["echo".to_string(), "hi".to_string()])
            .await
            .unwrap();
        assert_eq!(resp.stdout, "hi\n");
        assert_eq!(resp.stderr, "");
        assert_eq!(resp.status, "completed");

        let record = fake.namespace("sbx-a").unwrap();
        assert!(record.last_exec_unix().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_run_sync_nonzero_exit_reports_failed() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.push_exec(ExecBehavior::Finish(
            vec![chunk(StdStream::Stderr, "boom\n")],
            Err(OrchestratorError::ExitCode { code: 2 }),
        ));
        let (runner, _, _) = setup(fake).await;

        let resp = runner
            .run_sync("sbx-a", &["false".to_string()])
            .await
            .unwrap();
        assert_eq!(resp.status, "failed");
        assert_eq!(resp.exit_code, Some(2));
        assert_eq!(resp.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_async_exec_publishes_start_output_exit_in_order() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.push_exec(ExecBehavior::Finish(
            vec![
                chunk(StdStream::Stdout, "a\n"),
                chunk(StdStream::Stdout, "b\n"),
            ],
            Ok(()),
        ));
        let (runner, registry, hub) = setup(fake).await;
        let mut sub = hub.subscribe("sbx-a");

        let exec_id = runner.spawn_async(
            "sbx-a",
            vec!["bash".to_string(), "-lc".to_string(), "echo a; echo b".to_string()],
            None,
            None,
            &control_plane_stream(),
        );

        let events = wait_for_exit(&mut sub).await;
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::Start, EventType::Output, EventType::Output, EventType::Exit]
        );
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(events.iter().all(|e| e.exec_id == exec_id));
        assert_eq!(events.last().unwrap().exit_code, Some(0));

        let snap = registry.get("sbx-a", &exec_id).unwrap();
        assert_eq!(snap.status, ExecStatus::Completed);
        assert_eq!(snap.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_async_exec_timeout_classifies_timed_out() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.push_exec(ExecBehavior::Hang(Vec::new()));
        let (runner, registry, hub) = setup(fake).await;
        let mut sub = hub.subscribe("sbx-a");

        let exec_id = runner.spawn_async(
            "sbx-a",
            vec!["sleep".to_string(), "5".to_string()],
            Some(Duration::from_millis(50)),
            Some(1),
            &control_plane_stream(),
        );

        let events = wait_for_exit(&mut sub).await;
        assert_eq!(events.last().unwrap().exit_code, Some(124));

        let snap = registry.get("sbx-a", &exec_id).unwrap();
        assert_eq!(snap.status, ExecStatus::TimedOut);
        assert_eq!(snap.exit_code, Some(124));
        assert_eq!(snap.timeout_seconds, Some(1));
    }

    #[tokio::test]
    async fn test_async_exec_cancel_classifies_canceled() {
        let fake = Arc::new(FakeOrchestrator::new());
        fake.push_exec(ExecBehavior::Hang(Vec::new()));
        let (runner, registry, hub) = setup(fake).await;
        let mut sub = hub.subscribe("sbx-a");

        let exec_id = runner.spawn_async(
            "sbx-a",
            vec!["sleep".to_string(), "30".to_string()],
            None,
            None,
            &control_plane_stream(),
        );

        // Give the runner task a chance to start before cancelling.
        tokio::task::yield_now().await;
        let (snap, invoked) = registry.request_cancel("sbx-a", &exec_id).unwrap();
        assert!(invoked);
        assert_eq!(snap.status, ExecStatus::Canceling);

        let events = wait_for_exit(&mut sub).await;
        assert_eq!(events.last().unwrap().exit_code, None);

        let snap = registry.get("sbx-a", &exec_id).unwrap();
        assert_eq!(snap.status, ExecStatus::Canceled);
        assert_eq!(snap.exit_code, None);
        assert!(snap.error.is_empty());
    }

    #[tokio::test]
    async fn test_async_exec_sidecar_mode_wraps_command() {
        let fake = Arc::new(FakeOrchestrator::new());
        let (runner, _, hub) = setup(fake.clone()).await;
        let mut sub = hub.subscribe("sbx-a");

        let exec_id = runner.spawn_async(
            "sbx-a",
            vec!["echo".to_string(), "hi".to_string()],
            None,
            None,
            &sidecar_stream(),
        );
        wait_for_exit(&mut sub).await;

        let calls = fake.exec_calls();
        assert_eq!(calls.len(), 1);
        let argv = &calls[0].1;
        assert_eq!(&argv[..2], &["bash".to_string(), "-lc".to_string()]);
        assert!(argv[2].contains(&format!("/sbx-events/{}.exit", exec_id)));
        assert!(argv[2].contains("(echo hi)"));
    }

    #[test]
    fn test_effective_timeout() {
        let secs = Duration::from_secs;
        assert_eq!(effective_timeout(None, None, None), None);
        assert_eq!(effective_timeout(Some(5), None, None), Some(secs(5)));
        assert_eq!(effective_timeout(None, Some(secs(30)), None), Some(secs(30)));
        assert_eq!(
            effective_timeout(Some(90), None, Some(secs(60))),
            Some(secs(60))
        );
        assert_eq!(
            effective_timeout(Some(10), Some(secs(30)), Some(secs(60))),
            Some(secs(10))
        );
        assert_eq!(effective_timeout(None, None, Some(secs(60))), Some(secs(60)));
    }
}
