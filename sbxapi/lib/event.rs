//! Exec event frames published on the stream hub and carried over the
//! stream/ingest WebSockets.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single exec event frame.
///
/// `seq` is hub-global and strictly monotonic; it is assigned by the control
/// plane at publish time and defines the canonical event order. Gaps in `seq`
/// signal best-effort drops to a lagging subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEvent {
    /// The sandbox this event belongs to.
    pub sandbox_id: String,

    /// The exec this event belongs to.
    pub exec_id: String,

    /// Hub-global sequence number, assigned at publish time.
    #[serde(default)]
    pub seq: i64,

    /// The kind of event.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Which output stream the data came from. Only set for `output` events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream: Option<StdStream>,

    /// Output payload. Only set for `output` events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<String>,

    /// Process exit code. Only set for `exit` events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,

    /// Event timestamp, RFC 3339 with nanoseconds (UTC).
    #[serde(default)]
    pub time: String,
}

/// The kind of an exec event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The exec has been dispatched.
    Start,
    /// A chunk of stdout or stderr output.
    Output,
    /// The exec reached a terminal state.
    Exit,
}

/// An output stream of the executed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecEvent {
    /// Creates a `start` event stamped with the current wall clock.
    pub fn start(sandbox_id: impl Into<String>, exec_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            exec_id: exec_id.into(),
            seq: 0,
            event_type: EventType::Start,
            stream: None,
            data: None,
            exit_code: None,
            time: now_timestamp(),
        }
    }

    /// Creates an `output` event stamped with the current wall clock.
    pub fn output(
        sandbox_id: impl Into<String>,
        exec_id: impl Into<String>,
        stream: StdStream,
        data: impl Into<String>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            exec_id: exec_id.into(),
            seq: 0,
            event_type: EventType::Output,
            stream: Some(stream),
            data: Some(data.into()),
            exit_code: None,
            time: now_timestamp(),
        }
    }

    /// Creates an `exit` event stamped with the current wall clock.
    pub fn exit(
        sandbox_id: impl Into<String>,
        exec_id: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            exec_id: exec_id.into(),
            seq: 0,
            event_type: EventType::Exit,
            stream: None,
            data: None,
            exit_code,
            time: now_timestamp(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the current UTC wall clock rendered as RFC 3339 with nanoseconds.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape_output() {
        let mut evt = ExecEvent::output("sbx-abc", "00112233445566ff", StdStream::Stdout, "hi\n");
        evt.seq = 7;
        evt.time = "2024-01-01T00:00:00.000000001Z".to_string();

        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sandbox_id": "sbx-abc",
                "exec_id": "00112233445566ff",
                "seq": 7,
                "type": "output",
                "stream": "stdout",
                "data": "hi\n",
                "time": "2024-01-01T00:00:00.000000001Z",
            })
        );
    }

    #[test]
    fn test_event_wire_shape_omits_absent_fields() {
        let evt = ExecEvent::start("sbx-abc", "00112233445566ff");
        let json = serde_json::to_value(&evt).unwrap();
        assert!(json.get("stream").is_none());
        assert!(json.get("data").is_none());
        assert!(json.get("exit_code").is_none());
        assert_eq!(json["type"], "start");
    }

    #[test]
    fn test_event_exit_code_zero_is_carried() {
        let evt = ExecEvent::exit("sbx-abc", "00112233445566ff", Some(0));
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["exit_code"], 0);
    }

    #[test]
    fn test_event_parses_without_seq_or_time() {
        let evt: ExecEvent = serde_json::from_str(
            r#"{"sandbox_id":"","exec_id":"ab","type":"exit","exit_code":3}"#,
        )
        .unwrap();
        assert_eq!(evt.seq, 0);
        assert!(evt.time.is_empty());
        assert_eq!(evt.exit_code, Some(3));
    }
}
