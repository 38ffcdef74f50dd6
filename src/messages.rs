//! Wire types for the HTTP API and the per-run event stream.
//!
//! Events serialize as flat JSON objects with empty fields omitted; each
//! event goes out as one WebSocket text message.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::runs::{Run, RunStatus};

/// Languages the engine can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    pub fn parse(s: &str) -> Option<Language> {
        match s {
            "python" => Some(Language::Python),
            "javascript" => Some(Language::Javascript),
            _ => None,
        }
    }

    /// Conventional filename the snippet is staged under.
    pub fn script_filename(self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Javascript => "main.js",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short error tags surfaced on runs and in API error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    InvalidRequest,
    Internal,
    Docker,
    Canceled,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Internal => "internal",
            ErrorCode::Docker => "docker",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission payload for `POST /v1/execute`.
///
/// `language` stays a raw string so unsupported values produce a clean
/// `invalid_request` instead of a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub run_id: String,
    pub status: RunStatus,
}

/// Snapshot returned by `GET /v1/runs/{runId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunStateResponse {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            exit_code: run.exit_code,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

/// API error body: `{"error":{"code":"...","message":"..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.started")]
    Started,
    #[serde(rename = "run.stdout")]
    Stdout,
    #[serde(rename = "run.stderr")]
    Stderr,
    #[serde(rename = "run.stats")]
    Stats,
    #[serde(rename = "run.phase")]
    Phase,
    #[serde(rename = "run.error")]
    Error,
    #[serde(rename = "run.finished")]
    Finished,
}

/// Lifecycle phases advertised while the run's status stays `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Preparing,
    Ready,
    Canceling,
}

/// One event on a run's bus. Fields are populated per kind; empty fields
/// are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_bytes: Option<i64>,
}

impl Event {
    fn base(kind: EventKind, run_id: &str) -> Self {
        Self {
            kind,
            run_id: run_id.to_string(),
            at: None,
            phase: None,
            data: None,
            exit_code: None,
            code: None,
            message: None,
            prep_ms: None,
            elapsed_ms: None,
            stdout_bytes: None,
            stderr_bytes: None,
        }
    }

    pub fn started(run_id: &str, at: String) -> Self {
        Self {
            at: Some(at),
            ..Self::base(EventKind::Started, run_id)
        }
    }

    pub fn stdout(run_id: &str, data: String) -> Self {
        Self {
            data: Some(data),
            ..Self::base(EventKind::Stdout, run_id)
        }
    }

    pub fn stderr(run_id: &str, data: String) -> Self {
        Self {
            data: Some(data),
            ..Self::base(EventKind::Stderr, run_id)
        }
    }

    pub fn stats(
        run_id: &str,
        at: String,
        elapsed_ms: i64,
        stdout_bytes: i64,
        stderr_bytes: i64,
    ) -> Self {
        Self {
            at: Some(at),
            elapsed_ms: Some(elapsed_ms),
            stdout_bytes: Some(stdout_bytes),
            stderr_bytes: Some(stderr_bytes),
            ..Self::base(EventKind::Stats, run_id)
        }
    }

    pub fn phase(run_id: &str, phase: RunPhase, message: &str) -> Self {
        Self {
            phase: Some(phase),
            message: Some(message.to_string()),
            ..Self::base(EventKind::Phase, run_id)
        }
    }

    pub fn phase_ready(run_id: &str, message: &str, prep_ms: i64) -> Self {
        Self {
            prep_ms: Some(prep_ms),
            ..Self::phase(run_id, RunPhase::Ready, message)
        }
    }

    pub fn error(run_id: &str, code: ErrorCode, message: &str) -> Self {
        Self {
            code: Some(code),
            message: Some(message.to_string()),
            ..Self::base(EventKind::Error, run_id)
        }
    }

    pub fn finished(run_id: &str, exit_code: i32, at: String) -> Self {
        Self {
            exit_code: Some(exit_code),
            at: Some(at),
            ..Self::base(EventKind::Finished, run_id)
        }
    }
}

/// RFC-3339 with nanosecond precision, the timestamp format used on the
/// event wire.
pub fn rfc3339_nanos(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
