//! Drives one run from staging through termination.
//!
//! The supervisor owns the child process for the run's whole lifetime:
//! it stages the snippet, waits for the sandbox image when containerised,
//! spawns the child, feeds stdin, streams stdout/stderr into the run
//! buffers and out over the event bus, ticks periodic stats, and finally
//! classifies termination exactly once.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, SandboxMode};
use crate::images::ImageCache;
use crate::messages::{rfc3339_nanos, ErrorCode, Event, EventKind, ExecuteRequest, Language, RunPhase};
use crate::runs::{RunEntry, RunStatus};
use crate::sandbox;

/// Execution deadline when the submission does not carry one.
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_CONTAINER_TIMEOUT: Duration = Duration::from_secs(15);

const READ_BUF_SIZE: usize = 4096;
const STATS_INTERVAL: Duration = Duration::from_millis(250);

/// Effective execution timeout: the submitted value when positive, else
/// the mode default.
pub fn effective_timeout(timeout_ms: i64, sandbox: SandboxMode) -> Duration {
    if timeout_ms > 0 {
        Duration::from_millis(timeout_ms as u64)
    } else {
        match sandbox {
            SandboxMode::Docker => DEFAULT_CONTAINER_TIMEOUT,
            SandboxMode::Local => DEFAULT_LOCAL_TIMEOUT,
        }
    }
}

/// Run one submission to a terminal state. The caller installs the
/// cancel handle before invoking and clears it afterwards; this function
/// is the sole writer of the run's status, exit, and time fields.
pub async fn run(
    cfg: Arc<Config>,
    images: Arc<ImageCache>,
    entry: Arc<RunEntry>,
    token: CancellationToken,
    language: Language,
    req: ExecuteRequest,
) {
    let run_id = entry.id().to_string();

    // The run is live from here; startedAt waits until the child spawns
    // so image preparation never counts as execution time.
    entry.update(|r| r.status = RunStatus::Running);

    // Staging dir is removed on drop, on every exit path.
    let staged = match stage(language, &req.code).await {
        Ok(staged) => staged,
        Err(err) => {
            return finish_with_error(&entry, ErrorCode::Internal, &err.to_string());
        }
    };

    if cfg.sandbox == SandboxMode::Docker {
        let image = cfg.image_for(language).to_string();
        let prep_start = Instant::now();
        entry.publish(Event::phase(
            &run_id,
            RunPhase::Preparing,
            "Preparing sandbox (pulling image if needed)",
        ));
        if token.is_cancelled() {
            return finish_with_error(&entry, ErrorCode::Canceled, "canceled");
        }

        let prep = tokio::select! {
            res = images.ensure_ready(&image) => res,
            _ = token.cancelled() => {
                return finish_with_error(&entry, ErrorCode::Canceled, "canceled");
            }
        };
        if let Err(err) = prep {
            return finish_with_error(&entry, ErrorCode::Docker, &err.to_string());
        }

        entry.publish(Event::phase_ready(
            &run_id,
            "Sandbox ready",
            prep_start.elapsed().as_millis() as i64,
        ));
    }

    let exec_timeout = effective_timeout(req.timeout_ms, cfg.sandbox);
    let exec_deadline = tokio::time::Instant::now() + exec_timeout;
    let spec = sandbox::build_command(&cfg, language, staged.dir.path(), &staged.script, &req.args);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return finish_with_error(&entry, ErrorCode::Internal, &err.to_string());
        }
    };
    let (Some(mut stdin_pipe), Some(stdout_pipe), Some(stderr_pipe)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.start_kill();
        return finish_with_error(&entry, ErrorCode::Internal, "failed to open child pipes");
    };

    let started_at = Utc::now();
    entry.update(|r| r.started_at = Some(started_at));
    entry.publish(Event::started(&run_id, rfc3339_nanos(started_at)));
    info!(run_id = %run_id, language = %language, program = %spec.program, "run started");

    // Best-effort stdin feed; write errors are the child's problem.
    let stdin_body = req.stdin.clone();
    tokio::spawn(async move {
        let _ = stdin_pipe.write_all(stdin_body.as_bytes()).await;
        let _ = stdin_pipe.shutdown().await;
    });

    let stdout_task = spawn_pipe_reader(Arc::clone(&entry), EventKind::Stdout, stdout_pipe);
    let stderr_task = spawn_pipe_reader(Arc::clone(&entry), EventKind::Stderr, stderr_pipe);

    let stats_entry = Arc::clone(&entry);
    let stats_task = tokio::spawn(async move {
        let mut tick = interval(STATS_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so stats start
        // one interval after spawn.
        tick.tick().await;
        loop {
            tick.tick().await;
            publish_stats(&stats_entry);
        }
    });

    enum Outcome {
        Exited(std::process::ExitStatus),
        WaitFailed(std::io::Error),
        Canceled,
        TimedOut,
    }

    // Classification priority: cancel, then deadline, then child exit.
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Outcome::Canceled,
        _ = tokio::time::sleep_until(exec_deadline) => Outcome::TimedOut,
        res = child.wait() => match res {
            Ok(status) => Outcome::Exited(status),
            Err(err) => Outcome::WaitFailed(err),
        },
    };

    if matches!(outcome, Outcome::Canceled | Outcome::TimedOut) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    // Both readers must reach EOF before the terminal event goes out so
    // every stdout/stderr event precedes run.finished.
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    stats_task.abort();

    let finished_at = Utc::now();
    let at = rfc3339_nanos(finished_at);
    match outcome {
        Outcome::Canceled => {
            entry.update(|r| {
                r.status = RunStatus::Canceled;
                r.exit_code = Some(-1);
                r.error_code = Some(ErrorCode::Canceled);
                r.error_message = Some("canceled".to_string());
                r.finished_at = Some(finished_at);
            });
            entry.publish(Event::error(&run_id, ErrorCode::Canceled, "canceled"));
            publish_stats(&entry);
            entry.publish(Event::finished(&run_id, -1, at));
            info!(run_id = %run_id, "run canceled");
        }
        Outcome::TimedOut => {
            entry.update(|r| {
                r.status = RunStatus::Timeout;
                r.exit_code = Some(-1);
                r.error_code = Some(ErrorCode::Timeout);
                r.error_message = Some("execution timed out".to_string());
                r.finished_at = Some(finished_at);
            });
            entry.publish(Event::error(
                &run_id,
                ErrorCode::Timeout,
                "execution timed out",
            ));
            publish_stats(&entry);
            entry.publish(Event::finished(&run_id, -1, at));
            info!(run_id = %run_id, timeout_ms = exec_timeout.as_millis() as u64, "run timed out");
        }
        Outcome::Exited(status) => {
            let exit_code = status.code().unwrap_or(-1);
            let run_status = if exit_code == 0 {
                RunStatus::Finished
            } else {
                RunStatus::Failed
            };
            entry.update(|r| {
                r.status = run_status;
                r.exit_code = Some(exit_code);
                r.finished_at = Some(finished_at);
            });
            publish_stats(&entry);
            entry.publish(Event::finished(&run_id, exit_code, at));
            info!(run_id = %run_id, exit_code, "run finished");
        }
        Outcome::WaitFailed(err) => {
            warn!(run_id = %run_id, error = %err, "wait on child failed");
            entry.update(|r| {
                r.status = RunStatus::Failed;
                r.exit_code = Some(-1);
                r.finished_at = Some(finished_at);
            });
            publish_stats(&entry);
            entry.publish(Event::finished(&run_id, -1, at));
        }
    }
}

struct Staged {
    dir: tempfile::TempDir,
    script: PathBuf,
}

async fn stage(language: Language, code: &str) -> std::io::Result<Staged> {
    let dir = tempfile::Builder::new().prefix("kiln-run-").tempdir()?;
    let script = dir.path().join(language.script_filename());
    tokio::fs::write(&script, code).await?;
    Ok(Staged { dir, script })
}

/// Terminal path for failures before the child spawned: no startedAt,
/// no stats, just the error and the final event.
fn finish_with_error(entry: &RunEntry, code: ErrorCode, message: &str) {
    let finished_at = Utc::now();
    let status = if code == ErrorCode::Canceled {
        RunStatus::Canceled
    } else {
        RunStatus::Failed
    };
    entry.update(|r| {
        r.status = status;
        r.exit_code = Some(-1);
        r.error_code = Some(code);
        r.error_message = Some(message.to_string());
        r.finished_at = Some(finished_at);
    });
    entry.publish(Event::error(entry.id(), code, message));
    entry.publish(Event::finished(entry.id(), -1, rfc3339_nanos(finished_at)));
    info!(run_id = %entry.id(), code = %code, "run failed before spawn");
}

fn publish_stats(entry: &RunEntry) {
    if let Some(event) = entry.snapshot().stats_event() {
        entry.publish(event);
    }
}

fn spawn_pipe_reader<R>(entry: Arc<RunEntry>, kind: EventKind, mut pipe: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let chunk = &buf[..n];
                    let data = String::from_utf8_lossy(chunk).into_owned();
                    let event = match kind {
                        EventKind::Stdout => {
                            entry.append_stdout(chunk);
                            Event::stdout(entry.id(), data)
                        }
                        _ => {
                            entry.append_stderr(chunk);
                            Event::stderr(entry.id(), data)
                        }
                    };
                    entry.publish(event);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_prefers_the_submission() {
        assert_eq!(
            effective_timeout(1500, SandboxMode::Local),
            Duration::from_millis(1500)
        );
        assert_eq!(
            effective_timeout(1, SandboxMode::Docker),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn effective_timeout_defaults_per_mode() {
        assert_eq!(effective_timeout(0, SandboxMode::Local), DEFAULT_LOCAL_TIMEOUT);
        assert_eq!(
            effective_timeout(0, SandboxMode::Docker),
            DEFAULT_CONTAINER_TIMEOUT
        );
        assert_eq!(effective_timeout(-5, SandboxMode::Local), DEFAULT_LOCAL_TIMEOUT);
    }
}
