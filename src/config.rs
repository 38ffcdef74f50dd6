//! Environment-based configuration.

use anyhow::{anyhow, Result};

use crate::messages::Language;

/// Which sandbox executes submitted snippets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Host interpreter, cwd'd into the staging dir.
    Local,
    /// Locked-down container via the configured runtime CLI.
    Docker,
}

/// Engine configuration loaded from environment variables. Values are
/// frozen after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,

    /// Identity service base URL (token verification)
    pub supabase_url: String,

    /// Identity service anon key, sent as the `apikey` header
    pub supabase_anon_key: String,

    /// Local-mode Python interpreter
    pub python_bin: String,

    /// Local-mode Node interpreter
    pub node_bin: String,

    /// Sandbox mode for all runs
    pub sandbox: SandboxMode,

    /// Container runtime CLI
    pub docker_bin: String,

    /// Container image for Python runs
    pub docker_image: String,

    /// Container image for JavaScript runs
    pub docker_node_image: String,
}

impl Config {
    /// Load configuration from environment variables. Missing required
    /// values fail startup.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port: u16 = env_or("PORT", "8080")
            .parse()
            .map_err(|_| anyhow!("PORT must be a port number"))?;

        let supabase_url = require_env("SUPABASE_URL")?;
        let supabase_anon_key = require_env("SUPABASE_ANON_KEY")?;

        let sandbox = match env_or("ENGINE_SANDBOX", "local").as_str() {
            "docker" => SandboxMode::Docker,
            _ => SandboxMode::Local,
        };

        Ok(Config {
            port,
            supabase_url,
            supabase_anon_key,
            python_bin: env_or("PYTHON_BIN", "python"),
            node_bin: env_or("NODE_BIN", "node"),
            sandbox,
            docker_bin: env_or("DOCKER_BIN", "docker"),
            docker_image: env_or("DOCKER_IMAGE", "python:3.11-slim"),
            docker_node_image: env_or("DOCKER_NODE_IMAGE", "node:20-slim"),
        })
    }

    /// Local-mode interpreter binary for a language.
    pub fn interpreter_bin(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python_bin,
            Language::Javascript => &self.node_bin,
        }
    }

    /// Container image for a language.
    pub fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.docker_image,
            Language::Javascript => &self.docker_node_image,
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{key} must be set"))
}
