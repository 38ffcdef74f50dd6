//! Builds the argv for executing a staged snippet, locally or inside a
//! locked-down container.
//!
//! Container runs assume the image is already local (`--pull never`);
//! the image cache must have succeeded before this command is spawned.

use std::path::{Path, PathBuf};

use crate::config::{Config, SandboxMode};
use crate::messages::Language;

/// Working directory the staging dir is mounted at inside the container.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Program, argv, and working directory for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

pub fn build_command(
    cfg: &Config,
    language: Language,
    tmp_dir: &Path,
    script_path: &Path,
    extra_args: &[String],
) -> CommandSpec {
    match cfg.sandbox {
        SandboxMode::Local => local_command(cfg, language, tmp_dir, script_path, extra_args),
        SandboxMode::Docker => container_command(cfg, language, tmp_dir, script_path, extra_args),
    }
}

fn local_command(
    cfg: &Config,
    language: Language,
    tmp_dir: &Path,
    script_path: &Path,
    extra_args: &[String],
) -> CommandSpec {
    let mut args = vec![script_path.display().to_string()];
    args.extend(extra_args.iter().cloned());
    CommandSpec {
        program: cfg.interpreter_bin(language).to_string(),
        args,
        cwd: tmp_dir.to_path_buf(),
    }
}

fn container_command(
    cfg: &Config,
    language: Language,
    tmp_dir: &Path,
    script_path: &Path,
    extra_args: &[String],
) -> CommandSpec {
    let script_name = script_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| language.script_filename().to_string());
    let container_script = format!("{CONTAINER_WORKDIR}/{script_name}");
    // Read-only mount: the snippet cannot rewrite itself or the dir.
    let volume_arg = format!("{}:{CONTAINER_WORKDIR}:ro", tmp_dir.display());

    let mut args: Vec<String> = [
        "run",
        "--rm",
        "--pull",
        "never",
        "--network",
        "none",
        "--pids-limit",
        "128",
        "--memory",
        "256m",
        "--cpus",
        "1",
        "--security-opt",
        "no-new-privileges",
        "--cap-drop",
        "ALL",
        "-w",
        CONTAINER_WORKDIR,
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push("-v".to_string());
    args.push(volume_arg);

    match language {
        Language::Python => {
            // Keep __pycache__ out of the read-only mount.
            args.push("-e".to_string());
            args.push("PYTHONDONTWRITEBYTECODE=1".to_string());
            args.push(cfg.image_for(language).to_string());
            args.push("python".to_string());
            args.push("-B".to_string());
        }
        Language::Javascript => {
            args.push(cfg.image_for(language).to_string());
            args.push("node".to_string());
        }
    }
    args.push(container_script);
    args.extend(extra_args.iter().cloned());

    CommandSpec {
        program: cfg.docker_bin.clone(),
        args,
        cwd: tmp_dir.to_path_buf(),
    }
}
