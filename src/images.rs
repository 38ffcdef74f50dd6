//! Positive-result cache for container image availability.
//!
//! One mutex guards the whole map and is held across the daemon probe,
//! inspect, and pull, so concurrent first-time runs of an image queue
//! behind a single preparation instead of pulling twice. Failures are
//! cached briefly so a burst of failing runs does not hammer the runtime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a failed attempt is returned as-is before the runtime is
/// probed again.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Overall budget for one preparation attempt, pull included.
pub const PREP_DEADLINE: Duration = Duration::from_secs(120);

/// Budget for the initial daemon health probe.
pub const DAEMON_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrepError {
    #[error("docker daemon not reachable (is docker running?): {0}")]
    DaemonUnreachable(String),
    #[error("docker pull timed out for {image}; try pulling it manually")]
    PullTimedOut { image: String },
    #[error("docker image not ready ({image}): {detail}")]
    ImageNotReady { image: String, detail: String },
}

#[derive(Debug, Default)]
struct ImageState {
    ready: bool,
    last_attempt: Option<Instant>,
    last_error: Option<PrepError>,
}

/// Shared map of image name to readiness state. Never unsets `ready`.
pub struct ImageCache {
    runtime_bin: String,
    states: Mutex<HashMap<String, ImageState>>,
}

impl ImageCache {
    pub fn new(runtime_bin: impl Into<String>) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `image` is available locally, pulling it if needed.
    /// Idempotent; a ready image returns immediately.
    pub async fn ensure_ready(&self, image: &str) -> Result<(), PrepError> {
        let mut states = self.states.lock().await;
        {
            let state = states.entry(image.to_string()).or_default();
            if state.ready {
                return Ok(());
            }
            if let (Some(err), Some(at)) = (&state.last_error, state.last_attempt) {
                if at.elapsed() < RETRY_BACKOFF {
                    debug!(image, "returning cached preparation error");
                    return Err(err.clone());
                }
            }
            state.last_attempt = Some(Instant::now());
        }

        let result = prepare(&self.runtime_bin, image).await;

        let state = states.entry(image.to_string()).or_default();
        match &result {
            Ok(()) => {
                state.ready = true;
                state.last_error = None;
                info!(image, "container image ready");
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                warn!(image, error = %err, "container image preparation failed");
            }
        }
        result
    }
}

async fn prepare(bin: &str, image: &str) -> Result<(), PrepError> {
    let deadline = Instant::now() + PREP_DEADLINE;

    // Daemon probe first; it gives a clearer error than inspect or pull.
    let probe_limit = DAEMON_PROBE_TIMEOUT.min(remaining(deadline));
    match run_tool(bin, &["version"], probe_limit).await {
        Ok(out) if out.status.success() => {}
        Ok(out) => return Err(PrepError::DaemonUnreachable(combined_output(&out))),
        Err(ToolError::TimedOut) => {
            return Err(PrepError::DaemonUnreachable(
                "daemon probe timed out".to_string(),
            ))
        }
        Err(ToolError::Io(msg)) => return Err(PrepError::DaemonUnreachable(msg)),
    }

    // Fast path: image already present.
    match run_tool(bin, &["image", "inspect", image], remaining(deadline)).await {
        Ok(out) if out.status.success() => return Ok(()),
        Ok(_) => {}
        Err(ToolError::TimedOut) => {
            return Err(PrepError::PullTimedOut {
                image: image.to_string(),
            })
        }
        Err(ToolError::Io(msg)) => {
            return Err(PrepError::ImageNotReady {
                image: image.to_string(),
                detail: msg,
            })
        }
    }

    // Pull with network enabled; the containers themselves run with
    // --network none.
    info!(image, "pulling container image");
    match run_tool(bin, &["pull", image], remaining(deadline)).await {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(PrepError::ImageNotReady {
            image: image.to_string(),
            detail: combined_output(&out),
        }),
        Err(ToolError::TimedOut) => Err(PrepError::PullTimedOut {
            image: image.to_string(),
        }),
        Err(ToolError::Io(msg)) => Err(PrepError::ImageNotReady {
            image: image.to_string(),
            detail: msg,
        }),
    }
}

enum ToolError {
    TimedOut,
    Io(String),
}

async fn run_tool(
    bin: &str,
    args: &[&str],
    limit: Duration,
) -> Result<std::process::Output, ToolError> {
    let mut cmd = Command::new(bin);
    cmd.args(args).kill_on_drop(true);
    match timeout(limit, cmd.output()).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(err)) => Err(ToolError::Io(err.to_string())),
        Err(_) => Err(ToolError::TimedOut),
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn combined_output(out: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    text.trim().to_string()
}
