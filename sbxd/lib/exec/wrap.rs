use crate::{
    config::DEFAULT_STREAM_EVENTS_DIR,
    utils::{shell_join, shell_quote},
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Wraps an argv for sidecar stream mode.
///
/// The wrapped command redirects stdout/stderr into per-exec event files and
/// records the exit code in `<exec_id>.exit`, which the in-pod forwarder
/// tails and ships back over the ingest endpoint. The script shape is part
/// of the contract with the forwarder; keep it byte-stable.
pub fn wrap_for_sidecar(exec_id: &str, command: &[String], events_dir: &str) -> Vec<String> {
    let events_dir = if events_dir.is_empty() {
        DEFAULT_STREAM_EVENTS_DIR
    } else {
        events_dir
    };
    let dir = shell_quote(events_dir);
    let script = format!(
        "mkdir -p {dir}; out={dir}/{id}.stdout; err={dir}/{id}.stderr; ({cmd}) >$out 2>$err; code=$?; echo $code > {dir}/{id}.exit; exit $code",
        dir = dir,
        id = exec_id,
        cmd = shell_join(command),
    );
    vec!["bash".to_string(), "-lc".to_string(), script]
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
