//! Kiln - a code-execution engine with sandboxed runs and live event streaming
//!
//! This crate is the server side of a "run button": it accepts snippets
//! of Python or JavaScript over an authenticated HTTP API, executes them
//! in a sandbox (host interpreter or a locked-down container), and
//! streams stdout/stderr and progress events to WebSocket subscribers.
//! The key components are:
//!
//! ## Run lifecycle
//!
//! - [`supervisor`]: owns one child process per run, from staging to the
//!   terminal event
//! - [`runs`]: run state machine, registry, and the per-run event bus
//! - [`images`]: positive-result cache gating container launches
//! - [`sandbox`]: argv construction for local and container execution
//!
//! ## Edges
//!
//! - [`server`]: axum HTTP + WebSocket facade
//! - [`dispatcher`]: submission validation and supervisor launch
//! - [`auth`]: bearer-token verification against the identity service
//! - [`config`]: environment-based configuration

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod images;
pub mod messages;
pub mod runs;
pub mod sandbox;
pub mod server;
pub mod supervisor;

// Configuration
pub use config::{Config, SandboxMode};

// Application object
pub use dispatcher::{Engine, SubmitError};

// Run model and event bus
pub use runs::{Run, RunEntry, RunRegistry, RunStatus, SUBSCRIBER_BUFFER};

// Wire types
pub use messages::{
    ErrorBody, ErrorCode, Event, EventKind, ExecuteRequest, ExecuteResponse, Language, RunPhase,
    RunStateResponse,
};

// Sandboxing
pub use images::{ImageCache, PrepError};
pub use sandbox::CommandSpec;

// Identity
pub use auth::{AuthError, IdentityVerifier};

// Web facade
pub use server::AppState;
