//! Accepts submissions and launches one supervisor per run.
//!
//! The engine is the application object: it owns the registry and the
//! image cache, validates submissions, and spawns the supervisor task
//! with the run's root cancellation token.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::images::ImageCache;
use crate::messages::{Event, ExecuteRequest, ExecuteResponse, Language, RunPhase};
use crate::runs::{RunEntry, RunRegistry, RunStatus};
use crate::supervisor;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("language and code are required")]
    MissingFields,
    #[error("supported languages: python, javascript")]
    UnsupportedLanguage,
}

pub struct Engine {
    cfg: Arc<Config>,
    registry: Arc<RunRegistry>,
    images: Arc<ImageCache>,
}

impl Engine {
    pub fn new(cfg: Config) -> Self {
        let images = ImageCache::new(cfg.docker_bin.clone());
        Self {
            cfg: Arc::new(cfg),
            registry: Arc::new(RunRegistry::new()),
            images: Arc::new(images),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunEntry>> {
        self.registry.get(run_id)
    }

    /// Validate and accept a submission. The run executes asynchronously;
    /// the caller gets the id back immediately.
    pub fn submit(&self, req: ExecuteRequest) -> Result<ExecuteResponse, SubmitError> {
        if req.language.is_empty() || req.code.is_empty() {
            return Err(SubmitError::MissingFields);
        }
        let language =
            Language::parse(&req.language).ok_or(SubmitError::UnsupportedLanguage)?;

        let entry = self.registry.create();
        debug!(run_id = %entry.id(), language = %language, "accepted submission");
        let response = ExecuteResponse {
            run_id: entry.id().to_string(),
            status: RunStatus::Queued,
        };

        let cfg = Arc::clone(&self.cfg);
        let images = Arc::clone(&self.images);
        let task_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            let token = CancellationToken::new();
            task_entry.set_cancel(Some(token.clone()));
            supervisor::run(cfg, images, Arc::clone(&task_entry), token, language, req).await;
            task_entry.set_cancel(None);
        });

        Ok(response)
    }

    /// Trigger cancellation for a run. `None` for an unknown id,
    /// `Some(false)` when the run has no live cancel handle.
    pub fn cancel(&self, run_id: &str) -> Option<bool> {
        let entry = self.registry.get(run_id)?;
        let canceled = entry.cancel();
        if canceled {
            entry.publish(Event::phase(
                entry.id(),
                RunPhase::Canceling,
                "Cancel requested",
            ));
        }
        Some(canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxMode;

    fn test_config() -> Config {
        Config {
            port: 0,
            supabase_url: "https://id.example.test".to_string(),
            supabase_anon_key: "anon".to_string(),
            python_bin: "sh".to_string(),
            node_bin: "sh".to_string(),
            sandbox: SandboxMode::Local,
            docker_bin: "docker".to_string(),
            docker_image: "python:3.11-slim".to_string(),
            docker_node_image: "node:20-slim".to_string(),
        }
    }

    fn request(language: &str, code: &str) -> ExecuteRequest {
        ExecuteRequest {
            language: language.to_string(),
            code: code.to_string(),
            stdin: String::new(),
            args: Vec::new(),
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn empty_submissions_are_rejected() {
        let engine = Engine::new(test_config());
        assert_eq!(
            engine.submit(request("python", "")),
            Err(SubmitError::MissingFields)
        );
        assert_eq!(
            engine.submit(request("", "print(1)")),
            Err(SubmitError::MissingFields)
        );
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let engine = Engine::new(test_config());
        assert_eq!(
            engine.submit(request("ruby", "puts 1")),
            Err(SubmitError::UnsupportedLanguage)
        );
    }

    #[tokio::test]
    async fn accepted_submission_is_queued_and_registered() {
        let engine = Engine::new(test_config());
        let resp = engine.submit(request("python", "echo hi")).unwrap();
        assert_eq!(resp.status, RunStatus::Queued);
        assert!(engine.get(&resp.run_id).is_some());
    }

    #[tokio::test]
    async fn cancel_of_unknown_run_is_none() {
        let engine = Engine::new(test_config());
        assert_eq!(engine.cancel("run_missing"), None);
    }
}
