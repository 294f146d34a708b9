use std::{collections::HashMap, sync::Mutex, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sbxapi::{ExecStatus, ExecStatusResponse};
use thiserror::Error;
use tokio::{sync::oneshot, time::interval};

use crate::{config::DEFAULT_EXEC_STATUS_RETENTION, orchestrator::OrchestratorError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The typed error sum `finish` classifies on. Every way an exec can end is
/// a distinct variant so the classification below can match exhaustively
/// instead of string-probing an opaque error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// The execution context ran past its deadline.
    #[error("deadline exceeded")]
    Deadline,

    /// The execution was cancelled via its cancel handle.
    #[error("canceled")]
    Canceled,

    /// The remote process exited with a known code.
    #[error("command exited with code {code}")]
    Exit {
        /// The remote process exit code.
        code: i32,
    },

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// One-shot cancellation handle for a running exec. Invoking it resolves the
/// runner's cancel branch; dropping it without invoking disarms nothing (the
/// receiver simply never fires).
pub struct CancelHandle(oneshot::Sender<()>);

/// Thread-safe collection of exec records keyed by `(sandbox_id, exec_id)`.
///
/// The single lock guards the two-level map only; cancel handles are invoked
/// after the lock is released so a `finish` racing in from the runner task
/// cannot deadlock against a cancel request.
pub struct ExecRegistry {
    inner: Mutex<HashMap<String, HashMap<String, ExecRecord>>>,
    retention: Duration,
}

struct ExecRecord {
    sandbox_id: String,
    exec_id: String,
    status: ExecStatus,
    timeout_seconds: Option<u64>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error: String,
    cancel: Option<CancelHandle>,
    cancel_requested: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CancelHandle {
    /// Wraps the sending half of the runner's cancel channel.
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(tx)
    }

    fn invoke(self) {
        let _ = self.0.send(());
    }
}

impl ExecRegistry {
    /// Creates a registry retaining terminal records for `retention` past
    /// their finish time. A zero retention falls back to the default.
    pub fn new(retention: Duration) -> Self {
        let retention = if retention.is_zero() {
            DEFAULT_EXEC_STATUS_RETENTION
        } else {
            retention
        };
        Self {
            inner: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Inserts a fresh `running` record. Ids are generated per dispatch, so
    /// an existing key is simply overwritten.
    pub fn create_running(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        timeout_seconds: Option<u64>,
        cancel: CancelHandle,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(sandbox_id.to_string()).or_default().insert(
            exec_id.to_string(),
            ExecRecord {
                sandbox_id: sandbox_id.to_string(),
                exec_id: exec_id.to_string(),
                status: ExecStatus::Running,
                timeout_seconds,
                started_at: Utc::now(),
                finished_at: None,
                exit_code: None,
                error: String::new(),
                cancel: Some(cancel),
                cancel_requested: false,
            },
        );
    }

    /// Returns a serializable snapshot of one record.
    pub fn get(&self, sandbox_id: &str, exec_id: &str) -> Option<ExecStatusResponse> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(sandbox_id)
            .and_then(|by_exec| by_exec.get(exec_id))
            .map(ExecRecord::snapshot)
    }

    /// Requests cancellation.
    ///
    /// Returns `None` when no such record exists. Otherwise returns the
    /// post-request snapshot and whether the cancel handle was invoked:
    /// terminal records and repeated requests return `false`. A `running`
    /// record transitions to `canceling`; other non-terminal statuses are
    /// left unchanged. The handle itself is invoked after the lock is
    /// dropped.
    pub fn request_cancel(
        &self,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Option<(ExecStatusResponse, bool)> {
        let (snapshot, cancel) = {
            let mut inner = self.inner.lock().unwrap();
            let rec = inner.get_mut(sandbox_id).and_then(|m| m.get_mut(exec_id))?;
            if rec.status.is_terminal() {
                return Some((rec.snapshot(), false));
            }
            let Some(cancel) = rec.cancel.take() else {
                return Some((rec.snapshot(), false));
            };
            rec.cancel_requested = true;
            if rec.status == ExecStatus::Running {
                rec.status = ExecStatus::Canceling;
            }
            (rec.snapshot(), cancel)
        };
        cancel.invoke();
        Some((snapshot, true))
    }

    /// Finalizes a record, classifying the runner's outcome onto the state
    /// machine. Returns the finalized snapshot; finishing a missing record is
    /// a no-op and finishing a terminal record leaves it untouched.
    pub fn finish(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        err: Option<ExecError>,
    ) -> Option<ExecStatusResponse> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.get_mut(sandbox_id).and_then(|m| m.get_mut(exec_id))?;
        if rec.status.is_terminal() {
            return Some(rec.snapshot());
        }
        rec.finished_at = Some(Utc::now());
        rec.cancel = None;
        match err {
            None => {
                rec.status = ExecStatus::Completed;
                rec.exit_code = Some(0);
                rec.error.clear();
            }
            Some(ExecError::Deadline) => {
                rec.status = ExecStatus::TimedOut;
                rec.exit_code = Some(124);
                rec.error = ExecError::Deadline.to_string();
            }
            Some(ExecError::Canceled) if rec.cancel_requested => {
                rec.status = ExecStatus::Canceled;
                rec.error.clear();
            }
            Some(ExecError::Exit { code }) => {
                rec.exit_code = Some(code);
                if rec.cancel_requested {
                    rec.status = ExecStatus::Canceled;
                    rec.error.clear();
                } else if code == 0 {
                    rec.status = ExecStatus::Completed;
                    rec.error.clear();
                } else {
                    rec.status = ExecStatus::Failed;
                    rec.error = ExecError::Exit { code }.to_string();
                }
            }
            Some(other) => {
                rec.status = ExecStatus::Failed;
                rec.error = other.to_string();
            }
        }
        Some(rec.snapshot())
    }

    /// Drops terminal records older than the retention interval.
    pub fn reap_expired(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, by_exec| {
            by_exec.retain(|_, rec| match (rec.status.is_terminal(), rec.finished_at) {
                (true, Some(finished)) => now - finished <= retention,
                _ => true,
            });
            !by_exec.is_empty()
        });
    }

    /// Background retention sweep, one pass per minute.
    pub async fn run_retention_sweep(&self) {
        let mut tick = interval(Duration::from_secs(60));
        tick.tick().await;
        loop {
            tick.tick().await;
            self.reap_expired(Utc::now());
        }
    }
}

impl ExecRecord {
    fn snapshot(&self) -> ExecStatusResponse {
        ExecStatusResponse {
            sandbox_id: self.sandbox_id.clone(),
            exec_id: self.exec_id.clone(),
            status: self.status,
            timeout_seconds: self.timeout_seconds,
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            finished_at: self
                .finished_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .unwrap_or_default(),
            exit_code: self.exit_code,
            error: self.error.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<OrchestratorError> for ExecError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Deadline => ExecError::Deadline,
            OrchestratorError::ExitCode { code } => ExecError::Exit { code },
            other => ExecError::Other(other.to_string()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
