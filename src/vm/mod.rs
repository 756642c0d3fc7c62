//! Lifecycle control for the single Lima VM that hosts every environment.
//!
//! All VM operations go through the `limactl` backend as an external
//! process speaking JSON on stdout. The invocation layer is an injectable
//! trait so tests can supply canned outputs per argument vector and assert
//! the exact vectors observed.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Name of the Lima instance this tool owns unless configured otherwise.
pub const DEFAULT_INSTANCE_NAME: &str = "llima-box";

/// Backend program driven for every VM operation.
const LIMACTL: &str = "limactl";

/// Instance status string reported by the backend for a running VM.
pub const STATUS_RUNNING: &str = "Running";

/// Guest configuration bundled into the binary and written to a temporary
/// file when the instance is created.
const EMBEDDED_CONFIG: &str = include_str!("lima.yaml");

/// One instance record from `limactl list --json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub name: String,
    pub status: String,
    pub dir: PathBuf,
    pub arch: String,
    pub cpus: u32,
    pub memory: i64,
    pub disk: i64,
    #[serde(rename = "sshLocalPort")]
    pub ssh_local_port: u16,
    pub config: Option<InstanceConfig>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }

    /// Login name the guest accepts for the control connection.
    pub fn ssh_user(&self) -> &str {
        self.config
            .as_ref()
            .and_then(|c| c.user.as_ref())
            .and_then(|u| u.name.as_deref())
            .unwrap_or("lima")
    }
}

/// Nested instance configuration (only the user name is interesting).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub user: Option<UserConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: Option<String>,
}

/// Executes one backend invocation. Injectable so tests can stub the
/// backend with canned outputs.
#[async_trait]
pub trait BackendRunner: Send + Sync {
    /// Run `program` with `args`, returning captured stdout on success.
    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;
}

/// Production runner: spawns the backend as a subprocess and captures its
/// output. A missing binary gets an install hint; a non-zero exit surfaces
/// the backend's stderr.
pub struct SystemRunner;

#[async_trait]
impl BackendRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let output = match tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!(
                    "{program} not found in PATH. Install Lima: https://lima-vm.io/docs/installation/"
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to spawn {program}"));
            }
        };

        if !output.status.success() {
            bail!(
                "{program} {} failed: {}\nstderr: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output.stdout)
    }
}

/// Handles lifecycle operations for the single VM instance: discovery,
/// creation from the embedded configuration, start/stop, and deletion.
/// Transitions are idempotent from the caller's perspective.
pub struct Manager {
    instance_name: String,
    runner: Box<dyn BackendRunner>,
}

impl Manager {
    /// Create a manager driving the real backend.
    pub fn new(instance_name: &str) -> Self {
        Self::with_runner(instance_name, Box::new(SystemRunner))
    }

    /// Create a manager with an injected backend runner.
    pub fn with_runner(instance_name: &str, runner: Box<dyn BackendRunner>) -> Self {
        let instance_name = if instance_name.is_empty() {
            DEFAULT_INSTANCE_NAME.to_string()
        } else {
            instance_name.to_string()
        };
        Self {
            instance_name,
            runner,
        }
    }

    /// Invoke the backend. `--tty=false` is always the first argument so
    /// the backend never emits TTY-dependent output.
    async fn backend(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("--tty=false".to_string());
        argv.extend(args.iter().map(|s| s.to_string()));
        debug!(args = %argv.join(" "), "invoking VM backend");
        self.runner.run(LIMACTL, &argv).await
    }

    /// List all instances the backend knows about.
    ///
    /// `list --json` yields either a JSON array of records or a single bare
    /// record; both shapes are accepted (single-object fallback after an
    /// array-parse failure).
    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let output = self.backend(&["list", "--json"]).await?;
        if output.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<Vec<Instance>>(&output) {
            Ok(instances) => Ok(instances),
            Err(array_err) => match serde_json::from_slice::<Instance>(&output) {
                Ok(instance) => Ok(vec![instance]),
                Err(object_err) => bail!(
                    "failed to parse limactl list output as array or object: \
                     array error: {array_err}, object error: {object_err}"
                ),
            },
        }
    }

    /// Whether the instance exists (in any state).
    pub async fn exists(&self) -> Result<bool> {
        let instances = self
            .list_instances()
            .await
            .context("failed to list instances")?;
        Ok(instances.iter().any(|i| i.name == self.instance_name))
    }

    /// Whether the instance exists and is running.
    pub async fn is_running(&self) -> Result<bool> {
        let instance = self
            .get_instance()
            .await
            .context("failed to inspect instance")?;
        Ok(instance.is_running())
    }

    /// The instance record, or an error when it does not exist.
    pub async fn get_instance(&self) -> Result<Instance> {
        let instances = self.list_instances().await?;
        instances
            .into_iter()
            .find(|i| i.name == self.instance_name)
            .with_context(|| format!("instance {} not found", self.instance_name))
    }

    /// Create the instance from the embedded guest configuration. Fails if
    /// it already exists.
    pub async fn create(&self) -> Result<()> {
        if self.exists().await? {
            bail!("instance {} already exists", self.instance_name);
        }

        let config_path =
            std::env::temp_dir().join(format!("llima-box-{}.yaml", self.instance_name));
        tokio::fs::write(&config_path, EMBEDDED_CONFIG)
            .await
            .with_context(|| {
                format!("failed to write temporary config: {}", config_path.display())
            })?;

        info!(instance = %self.instance_name, "creating VM instance");
        let name_arg = format!("--name={}", self.instance_name);
        let config_arg = config_path.to_string_lossy().into_owned();
        let result = self
            .backend(&["create", &name_arg, &config_arg])
            .await
            .context("failed to create instance");

        tokio::fs::remove_file(&config_path).await.ok();

        result.map(|_| ())
    }

    /// Start the instance. No-op when it is already running.
    pub async fn start(&self) -> Result<()> {
        let instance = self.get_instance().await.context("failed to get instance")?;
        if instance.is_running() {
            debug!(instance = %self.instance_name, "instance already running");
            return Ok(());
        }

        info!(instance = %self.instance_name, "starting VM instance");
        self.backend(&["start", &self.instance_name])
            .await
            .context("failed to start instance")?;
        Ok(())
    }

    /// Stop the instance gracefully. Fails when it does not exist.
    pub async fn stop(&self) -> Result<()> {
        self.get_instance().await.context("failed to get instance")?;

        info!(instance = %self.instance_name, "stopping VM instance");
        self.backend(&["stop", &self.instance_name])
            .await
            .context("failed to stop instance")?;
        Ok(())
    }

    /// Delete the instance.
    pub async fn delete(&self, force: bool) -> Result<()> {
        self.get_instance().await.context("failed to get instance")?;

        info!(instance = %self.instance_name, force, "deleting VM instance");
        if force {
            self.backend(&["delete", &self.instance_name, "--force"])
                .await
                .context("failed to delete instance")?;
        } else {
            self.backend(&["delete", &self.instance_name])
                .await
                .context("failed to delete instance")?;
        }
        Ok(())
    }

    /// Create the instance if absent and start it if stopped. Idempotent.
    pub async fn ensure_running(&self) -> Result<()> {
        if !self.exists().await? {
            self.create().await?;
        }
        if !self.is_running().await? {
            self.start().await?;
        }
        Ok(())
    }

    /// Path of the instance's on-disk configuration file.
    pub async fn config_path(&self) -> Result<PathBuf> {
        let instance = self.get_instance().await?;
        Ok(instance.dir.join("lima.yaml"))
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// The backend state directory: `LIMA_HOME` when set, else `~/.lima`.
    pub fn lima_home() -> Result<PathBuf> {
        if let Some(home) = std::env::var_os("LIMA_HOME") {
            if !home.is_empty() {
                return Ok(PathBuf::from(home));
            }
        }
        let home = std::env::var_os("HOME")
            .context("HOME is not set; cannot locate the Lima data directory")?;
        Ok(PathBuf::from(home).join(".lima"))
    }

    /// The guest configuration bundled into the binary.
    pub fn embedded_config() -> &'static str {
        EMBEDDED_CONFIG
    }
}
