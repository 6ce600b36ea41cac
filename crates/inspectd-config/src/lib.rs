//! ConfigReader (C4) for the in-repository `.inspector.toml` document, and
//! the layered `RuntimeConfig` assembled from the process environment (§6).

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use inspectd_process::Sandbox;
use inspectd_retry::RetryPolicy;
use inspectd_types::{RepoConfig, Tool};
use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = ".inspector.toml";
const READ_DEADLINE: Duration = Duration::from_secs(10);

/// The on-disk shape of `.inspector.toml`. Both keys are optional; an absent
/// file and an empty document are treated identically (preset tool list,
/// no extra packages).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RepoConfigDocument {
    #[serde(default)]
    apt_packages: Vec<String>,
    #[serde(default)]
    tools: Option<Vec<Tool>>,
}

/// Reads `.inspector.toml` at the repo root inside the sandbox and merges it
/// with a preset tool list. Absence of the file is not an error; a
/// malformed document is.
pub struct ConfigReader {
    preset: Vec<Tool>,
}

impl ConfigReader {
    pub fn new(preset: Vec<Tool>) -> Self {
        Self { preset }
    }

    pub fn read(&self, sandbox: &dyn Sandbox) -> Result<RepoConfig> {
        let out = sandbox
            .run(&["cat", CONFIG_PATH], READ_DEADLINE)
            .context("failed to invoke sandbox for config read")?;

        if out.exit_code != 0 {
            return Ok(RepoConfig {
                tools: self.preset.clone(),
                apt_packages: Vec::new(),
            });
        }

        let doc: RepoConfigDocument = toml::from_str(&out.output)
            .with_context(|| format!("malformed {CONFIG_PATH}"))?;

        Ok(RepoConfig {
            tools: doc.tools.unwrap_or_else(|| self.preset.clone()),
            apt_packages: doc.apt_packages,
        })
    }
}

/// Selects which [`inspectd_process::Sandbox`] implementation is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyserKind {
    #[default]
    Filesystem,
    Docker,
}

/// Selects which queue implementation `inspectd` wires up at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    #[default]
    Memory,
    Gcppubsub,
}

/// Log output format, selected independently of the `RUST_LOG` filter
/// directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Layered, env-first runtime configuration — the same "env overrides, then
/// preset defaults" merge policy the pipeline's wider lineage uses for its
/// CLI/env/file-default stack, narrowed here to env-only since this service
/// has no per-invocation CLI flags beyond the ones `inspectd-cli` exposes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub github_id: String,
    pub github_pem_file: String,
    pub github_webhook_secret: String,
    pub analyser: AnalyserKind,
    pub analyser_fs_gopath: Option<String>,
    pub analyser_docker_image: Option<String>,
    pub analyser_memory_limit_mib: u64,
    pub queue: QueueKind,
    pub db_dsn: Option<String>,
    pub gci_base_url: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub http_bind_addr: String,
    pub queue_publish_retry: RetryPolicy,
}

impl RuntimeConfig {
    /// Assembles configuration from the process environment. Fails if any
    /// of the three required variables (`GITHUB_ID`, `GITHUB_PEM_FILE`,
    /// `GITHUB_WEBHOOK_SECRET`) is absent.
    pub fn from_env() -> Result<Self> {
        let github_id = require_env("GITHUB_ID")?;
        let github_pem_file = require_env("GITHUB_PEM_FILE")?;
        let github_webhook_secret = require_env("GITHUB_WEBHOOK_SECRET")?;

        let analyser = match env::var("ANALYSER").ok().as_deref() {
            None | Some("filesystem") => AnalyserKind::Filesystem,
            Some("docker") => AnalyserKind::Docker,
            Some(other) => bail!("unrecognized ANALYSER value: {other}"),
        };

        let analyser_memory_limit_mib = env::var("ANALYSER_MEMORY_LIMIT")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("ANALYSER_MEMORY_LIMIT must be an integer")?
            .unwrap_or(inspectd_process::DEFAULT_MEMORY_LIMIT_MIB);

        let queue = match env::var("QUEUE").ok().as_deref() {
            None | Some("memory") => QueueKind::Memory,
            Some("gcppubsub") => QueueKind::Gcppubsub,
            Some(other) => bail!("unrecognized QUEUE value: {other}"),
        };

        let log_format = match env::var("LOG_FORMAT").ok().as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("unrecognized LOG_FORMAT value: {other}"),
        };

        Ok(Self {
            github_id,
            github_pem_file,
            github_webhook_secret,
            analyser,
            analyser_fs_gopath: env::var("ANALYSER_FS_GOPATH").ok(),
            analyser_docker_image: env::var("ANALYSER_DOCKER_IMAGE").ok(),
            analyser_memory_limit_mib,
            queue,
            db_dsn: env::var("DB_DSN").ok(),
            gci_base_url: env::var("GCI_BASE_URL").ok(),
            log_level: env::var("LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
            log_format,
            http_bind_addr: env::var("HTTP_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            queue_publish_retry: RetryPolicy::QueuePublish,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("missing required environment variable {key}"))
}
