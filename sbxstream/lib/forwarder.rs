use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use sbxapi::{ExecEvent, StdStream};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::{SbxStreamError, SbxStreamResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where exec event files live when nothing else is configured.
pub const DEFAULT_EVENTS_DIR: &str = "/sbx-events";

/// How often the events directory is rescanned.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long both streams must be quiet after the exit file appears before
/// the exit event is emitted.
const EXIT_QUIET_WINDOW: Duration = Duration::from_millis(300);

/// Minimum pause before redialing the ingest endpoint.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where forwarded events go. The WebSocket connection implements this; the
/// tests substitute an in-memory sink.
#[async_trait]
pub trait EventSink: Send {
    /// Ships one event. An error tears the current connection down; offsets
    /// only advance on success, so nothing is lost across reconnects.
    async fn send(&mut self, evt: ExecEvent) -> SbxStreamResult<()>;
}

/// An [`EventSink`] writing JSON text frames to a WebSocket.
pub struct WsSink<S> {
    inner: S,
}

/// Tails the events directory and converts file growth into exec events.
///
/// Per-exec state (offsets, start/exit flags) lives here, outside any single
/// connection, which is what makes the at-most-once `start`/`exit` and the
/// no-rewind offset guarantees hold across reconnects.
pub struct Forwarder {
    sandbox_id: String,
    events_dir: PathBuf,
    quiet_window: Duration,
    state: HashMap<String, ExecFileState>,
}

#[derive(Default)]
struct ExecFileState {
    stdout_off: u64,
    stderr_off: u64,
    start_sent: bool,
    exit_sent: bool,
    exit_seen: bool,
    exit_code: i32,
    exit_ready_at: Option<Instant>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S> WsSink<S> {
    /// Wraps the sending half of a WebSocket connection.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> EventSink for WsSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn send(&mut self, evt: ExecEvent) -> SbxStreamResult<()> {
        let payload = serde_json::to_string(&evt)
            .map_err(|e| SbxStreamError::custom(anyhow::anyhow!("encode event: {}", e)))?;
        self.inner.send(Message::Text(payload.into())).await?;
        Ok(())
    }
}

impl Forwarder {
    /// Creates a forwarder for one sandbox's events directory.
    pub fn new(sandbox_id: impl Into<String>, events_dir: impl Into<PathBuf>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            events_dir: events_dir.into(),
            quiet_window: EXIT_QUIET_WINDOW,
            state: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_quiet_window(mut self, window: Duration) -> Self {
        self.quiet_window = window;
        self
    }

    /// One scan pass: emit `start` for newly seen execs, `output` for newly
    /// appended bytes, and `exit` once the exit file exists, both streams are
    /// drained, and the quiet window has elapsed.
    pub async fn pump(&mut self, sink: &mut dyn EventSink) -> SbxStreamResult<()> {
        let mut entries = tokio::fs::read_dir(&self.events_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((exec_id, kind)) = parse_event_file(&name) else {
                continue;
            };
            let state = self.state.entry(exec_id.clone()).or_default();

            if !state.start_sent {
                sink.send(ExecEvent::start(self.sandbox_id.clone(), exec_id.clone()))
                    .await?;
                state.start_sent = true;
            }

            let path = entry.path();
            match kind {
                EventFileKind::Stdout => {
                    let (data, off) = read_new(&path, state.stdout_off).await?;
                    if !data.is_empty() {
                        sink.send(ExecEvent::output(
                            self.sandbox_id.clone(),
                            exec_id.clone(),
                            StdStream::Stdout,
                            data,
                        ))
                        .await?;
                        state.stdout_off = off;
                    }
                }
                EventFileKind::Stderr => {
                    let (data, off) = read_new(&path, state.stderr_off).await?;
                    if !data.is_empty() {
                        sink.send(ExecEvent::output(
                            self.sandbox_id.clone(),
                            exec_id.clone(),
                            StdStream::Stderr,
                            data,
                        ))
                        .await?;
                        state.stderr_off = off;
                    }
                }
                EventFileKind::Exit => {
                    if state.exit_sent || state.exit_seen {
                        continue;
                    }
                    let (data, _) = read_new(&path, 0).await?;
                    state.exit_code = data.trim().parse().unwrap_or(0);
                    state.exit_seen = true;
                }
            }
        }

        let now = Instant::now();
        for (exec_id, state) in &mut self.state {
            if state.exit_sent || !state.exit_seen {
                continue;
            }
            if has_pending_output(&self.events_dir, exec_id, state).await? {
                state.exit_ready_at = None;
                continue;
            }
            let ready_at = *state.exit_ready_at.get_or_insert(now);
            if now.duration_since(ready_at) < self.quiet_window {
                continue;
            }
            sink.send(ExecEvent::exit(
                self.sandbox_id.clone(),
                exec_id.clone(),
                Some(state.exit_code),
            ))
            .await?;
            state.exit_sent = true;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Types: Event files
//--------------------------------------------------------------------------------------------------

/// The three per-exec files the wrapped command writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventFileKind {
    Stdout,
    Stderr,
    Exit,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits an event file name into its exec id and kind.
fn parse_event_file(name: &str) -> Option<(String, EventFileKind)> {
    if let Some(id) = name.strip_suffix(".stdout") {
        return Some((id.to_string(), EventFileKind::Stdout));
    }
    if let Some(id) = name.strip_suffix(".stderr") {
        return Some((id.to_string(), EventFileKind::Stderr));
    }
    if let Some(id) = name.strip_suffix(".exit") {
        return Some((id.to_string(), EventFileKind::Exit));
    }
    None
}

/// Reads everything past `offset`, returning the data and the new offset.
async fn read_new(path: &Path, offset: u64) -> SbxStreamResult<(String, u64)> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    let len = buf.len() as u64;
    Ok((String::from_utf8_lossy(&buf).into_owned(), offset + len))
}

/// Whether either stream file has bytes beyond its forwarded offset.
async fn has_pending_output(
    dir: &Path,
    exec_id: &str,
    state: &ExecFileState,
) -> SbxStreamResult<bool> {
    let stdout = file_size(&dir.join(format!("{}.stdout", exec_id))).await?;
    let stderr = file_size(&dir.join(format!("{}.stderr", exec_id))).await?;
    Ok(stdout > state.stdout_off || stderr > state.stderr_off)
}

async fn file_size(path: &Path) -> SbxStreamResult<u64> {
    match tokio::fs::metadata(path).await {
        Result::Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

/// Rewrites the configured control-plane endpoint into the sandbox's ingest
/// WebSocket URL.
pub fn stream_url(endpoint: &str, sandbox_id: &str) -> SbxStreamResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| SbxStreamError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    let path = format!(
        "{}/sandboxes/{}/ingest",
        url.path().trim_end_matches('/'),
        sandbox_id
    );
    url.set_path(&path);
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        let _ = url.set_scheme(scheme);
    }
    Ok(url)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
