//! Environment lifecycle: create, enter, list, and destroy the per-project
//! isolated environments inside the VM.
//!
//! An environment is not a host-side object. It is implied by the
//! co-existence of guest artifacts: a user named like the environment, the
//! directory `/envs/<name>/`, a PID file naming a live process, and a bind
//! mount of the project path at `/workspace` inside that process's mount
//! namespace. Every operation here is a scripted sequence of privileged
//! remote commands; ordering is load-bearing.

pub mod naming;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ssh;
use crate::ssh::retry::RetryConfig;
use crate::util::{shell_escape, shell_join};
use crate::vm;

/// Root of the per-environment state directories inside the guest.
pub const ENVS_DIR: &str = "/envs";

/// Mount point of the project directory inside each environment's namespace.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Session establishment during provisioning tolerates a VM that is still
/// booting: more attempts and a longer initial delay than the channel's
/// general policy.
const SESSION_RETRY: RetryConfig = RetryConfig {
    max_attempts: 5,
    initial_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(10),
    multiplier: 2.0,
};

/// An environment handle: the generated name plus the project path it was
/// derived from. Listings cannot recover the path and leave it empty.
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub project_path: PathBuf,
}

impl Environment {
    /// Guest path of the file naming the namespace-holding process.
    pub fn pid_file(&self) -> String {
        pid_file_path(&self.name)
    }
}

/// `/envs/<name>/namespace.pid`: the rendezvous from environment name to
/// the live process owning its namespaces.
pub fn pid_file_path(name: &str) -> String {
    format!("{ENVS_DIR}/{name}/namespace.pid")
}

// ---------------------------------------------------------------------------
// Remote command construction
// ---------------------------------------------------------------------------
//
// Generated names only contain [a-z0-9_-] and PIDs are parsed integers, so
// they interpolate bare. Project paths and user argv are attacker-ish input
// (spaces, quotes) and always pass through shell quoting.

fn useradd_cmd(name: &str) -> String {
    format!("sudo useradd -m -s /bin/bash {name}")
}

fn envs_dir_cmd(name: &str) -> String {
    format!("sudo mkdir -p {ENVS_DIR}/{name}")
}

/// Detach a holder process owning a private mount+PID namespace and record
/// its PID. The holder's stdio is redirected so the remote session can
/// return; `tee` writes the PID file in one step.
fn namespace_cmd(name: &str) -> String {
    format!(
        "sudo bash -c 'unshare --mount --pid --fork --propagation private \
         bash -c \"sleep infinity\" </dev/null >/dev/null 2>&1 & \
         echo $! | tee {pid_file}'",
        pid_file = pid_file_path(name)
    )
}

fn read_pid_cmd(name: &str) -> String {
    format!("sudo cat {}", pid_file_path(name))
}

fn pid_alive_cmd(pid: u32) -> String {
    format!("sudo kill -0 {pid}")
}

/// Bind the project into the namespace's mount view: create the mount
/// point, bind the project path onto it, and hand ownership to the
/// environment user. Each step enters the namespace through the holder PID.
fn bind_mount_cmd(pid: u32, name: &str, project_path: &Path) -> String {
    let path = shell_escape(&project_path.to_string_lossy());
    format!(
        "sudo nsenter --mount --target={pid} mkdir -p {WORKSPACE_DIR} && \
         sudo nsenter --mount --target={pid} mount --bind {path} {WORKSPACE_DIR} && \
         sudo nsenter --mount --target={pid} chown -R {name}:{name} {WORKSPACE_DIR}"
    )
}

/// Enter the namespace, become the environment user, land in the workspace,
/// and exec the requested command (an interactive bash by default).
fn enter_cmd(pid: u32, name: &str, argv: &[String]) -> String {
    let inner = if argv.is_empty() || (argv.len() == 1 && argv[0] == "bash") {
        "bash -i".to_string()
    } else {
        shell_join(argv)
    };
    let script = format!("cd {WORKSPACE_DIR} && exec {inner}");
    format!(
        "sudo nsenter --mount --target={pid} su {name} -c {}",
        shell_escape(&script)
    )
}

fn project_path_probe_cmd(pid: u32, name: &str) -> String {
    format!(
        "sudo nsenter --mount=/proc/{pid}/ns/mnt findmnt -n -o TARGET \
         | grep -E '^/Users|^/home' | grep -v '^/home/{name}$' | head -n1 || true"
    )
}

/// Reap the namespace: the holder's forked child is PID 1 of the new PID
/// namespace, so killing it tears down every process inside; the holder
/// itself exits with it. Either may already be gone.
fn kill_namespace_cmd(pid: u32) -> String {
    format!("sudo bash -c 'pkill -P {pid}; kill {pid}; true'")
}

fn delete_user_cmd(name: &str) -> String {
    format!("sudo userdel -r {name}")
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Drives the environment lifecycle over one lazily connected SSH session.
///
/// Single-threaded per call; nothing here locks. Two processes running
/// `create` for the same path concurrently would race in the guest, so
/// callers must serialize.
pub struct Manager {
    vm: vm::Manager,
    session: Option<ssh::Session>,
    connect_timeout: Duration,
    exec_retry: RetryConfig,
    settle_delay: Duration,
}

impl Manager {
    pub fn new(config: &Config) -> Self {
        Self {
            vm: vm::Manager::new(&config.vm.instance_name),
            session: None,
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
            exec_retry: config.ssh.retry_config(),
            settle_delay: Duration::from_millis(config.env.namespace_settle_ms),
        }
    }

    pub fn vm(&self) -> &vm::Manager {
        &self.vm
    }

    /// Guarantee a running VM and a connected session.
    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| s.is_connected()) {
            return Ok(());
        }

        self.vm
            .ensure_running()
            .await
            .context("failed to ensure VM is running")?;

        let mut session = ssh::Session::new(self.vm.instance_name())
            .await?
            .with_connect_timeout(self.connect_timeout);
        session.connect_with_retry(&SESSION_RETRY).await?;

        self.session = Some(session);
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut ssh::Session> {
        self.session.as_mut().context("session is not connected")
    }

    /// Create the environment for a project path, or return the existing one.
    ///
    /// Provisioning is not atomic; on a mid-sequence failure the user account
    /// is rolled back best-effort. A crash can still leave an orphan user;
    /// the next `create` detects a user without a live namespace and deletes
    /// it before re-provisioning.
    pub async fn create(
        &mut self,
        cancel: &CancellationToken,
        project_path: &Path,
    ) -> Result<Environment> {
        let abs = std::path::absolute(project_path).with_context(|| {
            format!("failed to resolve absolute path: {}", project_path.display())
        })?;
        match tokio::fs::metadata(&abs).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => bail!("path is not a directory: {}", abs.display()),
            Err(_) => bail!("path does not exist: {}", abs.display()),
        }

        let name = naming::generate(&abs).context("failed to generate environment name")?;
        let env = Environment {
            name: name.clone(),
            project_path: abs.clone(),
        };

        self.ensure_session().await?;

        if self.exists(&name).await? {
            debug!(name, "environment already exists");
            return Ok(env);
        }

        // A user without a live namespace is debris from an interrupted
        // provisioning run; clear it so useradd can succeed.
        if self.user_exists(&name).await {
            warn!(name, "found orphaned user without a namespace, removing");
            self.rollback_user(&name).await;
        }

        info!(name, path = %abs.display(), "provisioning environment");

        self.session_mut()?
            .exec_cancel(&useradd_cmd(&name), cancel)
            .await
            .context("failed to create user account")?;

        if let Err(e) = self.provision_namespace(cancel, &env).await {
            self.rollback_user(&name).await;
            return Err(e.context("failed to create namespace"));
        }

        if let Err(e) = self.bind_project(cancel, &env).await {
            self.rollback_user(&name).await;
            return Err(e.context("failed to bind project into namespace"));
        }

        info!(name, "environment ready");
        Ok(env)
    }

    /// Set up `/envs/<name>`, detach the namespace holder, and verify it.
    async fn provision_namespace(
        &mut self,
        cancel: &CancellationToken,
        env: &Environment,
    ) -> Result<()> {
        self.session_mut()?
            .exec_cancel(&envs_dir_cmd(&env.name), cancel)
            .await
            .context("failed to create environment directory")?;

        self.session_mut()?
            .exec_stream(&namespace_cmd(&env.name), cancel)
            .await
            .context("failed to start namespace holder")?;

        // Give the detached holder a moment to write its PID and settle.
        tokio::time::sleep(self.settle_delay).await;

        let pid = self
            .read_namespace_pid(cancel, &env.name)
            .await
            .with_context(|| format!("namespace PID file not created: {}", env.pid_file()))?;

        self.session_mut()?
            .exec_cancel(&pid_alive_cmd(pid), cancel)
            .await
            .with_context(|| format!("namespace process (PID {pid}) is not running"))?;

        debug!(name = %env.name, pid, "namespace ready");
        Ok(())
    }

    async fn bind_project(&mut self, cancel: &CancellationToken, env: &Environment) -> Result<()> {
        let pid = self.read_namespace_pid(cancel, &env.name).await?;
        self.session_mut()?
            .exec_cancel(&bind_mount_cmd(pid, &env.name, &env.project_path), cancel)
            .await
            .context("failed to bind mount project path")?;
        debug!(name = %env.name, pid, "project bound at /workspace");
        Ok(())
    }

    /// Read and parse the namespace PID file.
    async fn read_namespace_pid(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<u32> {
        let output = self
            .session_mut()?
            .exec_cancel(&read_pid_cmd(name), cancel)
            .await?;
        output
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid namespace PID file contents: {:?}", output.trim()))
    }

    async fn user_exists(&mut self, name: &str) -> bool {
        match self.session_mut() {
            Ok(session) => session.exec(&format!("id {name}")).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Whether the environment fully exists: user account, PID file, and a
    /// live namespace process. Any probe failure yields `false`, never an
    /// error, so `create` stays idempotent.
    pub async fn exists(&mut self, name: &str) -> Result<bool> {
        self.ensure_session().await?;

        if !self.user_exists(name).await {
            return Ok(false);
        }

        let session = self.session_mut()?;
        let pid_output = match session.exec(&read_pid_cmd(name)).await {
            Ok(output) => output,
            Err(_) => return Ok(false),
        };
        let pid: u32 = match pid_output.trim().parse() {
            Ok(pid) => pid,
            Err(_) => return Ok(false),
        };

        Ok(self.session_mut()?.exec(&pid_alive_cmd(pid)).await.is_ok())
    }

    /// All first-level entries under `/envs/`. Name filtering is the
    /// caller's job ([`naming::is_environment_name`]).
    pub async fn list(&mut self) -> Result<Vec<Environment>> {
        self.ensure_session().await?;

        let cmd = format!("sudo sh -c 'ls -1 {ENVS_DIR} 2>/dev/null || true'");
        let exec_retry = self.exec_retry;
        let output = self
            .session_mut()?
            .exec_with_retry(&cmd, &exec_retry)
            .await
            .context("failed to list environments")?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| Environment {
                name: name.to_string(),
                project_path: PathBuf::new(),
            })
            .collect())
    }

    /// Delete an environment: kill the namespace holder and the user's
    /// processes, remove the account, and reap the state directory.
    pub async fn delete(&mut self, cancel: &CancellationToken, name: &str) -> Result<()> {
        self.ensure_session().await?;

        if !self.exists(name).await? {
            bail!("environment {name} does not exist");
        }

        info!(name, "deleting environment");

        // The holder runs as root, so pkill -u alone cannot reap the
        // namespace. Kill it by PID first, best-effort.
        if let Ok(pid) = self.read_namespace_pid(cancel, name).await {
            if let Err(e) = self
                .session_mut()?
                .exec_cancel(&kill_namespace_cmd(pid), cancel)
                .await
            {
                warn!(name, pid, error = %e, "failed to kill namespace holder");
            }
        }

        if let Err(e) = self
            .session_mut()?
            .exec_cancel(&format!("sudo pkill -u {name}"), cancel)
            .await
        {
            // pkill exits non-zero when nothing matched; not an error.
            debug!(name, error = %e, "no user processes to kill");
        }

        self.session_mut()?
            .exec_cancel(&delete_user_cmd(name), cancel)
            .await
            .context("failed to delete user account")?;

        if let Err(e) = self
            .session_mut()?
            .exec_cancel(&format!("sudo rm -rf {ENVS_DIR}/{name}"), cancel)
            .await
        {
            warn!(name, error = %e, "failed to remove environment directory");
        }

        info!(name, "environment deleted");
        Ok(())
    }

    /// Delete every listed environment, continuing past individual failures
    /// and aggregating them into one error.
    pub async fn delete_all(&mut self, cancel: &CancellationToken) -> Result<()> {
        let environments = self.list().await.context("failed to list environments")?;

        let mut failures = Vec::new();
        for env in environments
            .iter()
            .filter(|e| naming::is_environment_name(&e.name))
        {
            if let Err(e) = self.delete(cancel, &env.name).await {
                warn!(name = %env.name, error = %e, "failed to delete environment");
                failures.push(format!("{}: {e:#}", env.name));
            }
        }

        if !failures.is_empty() {
            bail!(
                "failed to delete {} environment(s): {}",
                failures.len(),
                failures.join("; ")
            );
        }
        Ok(())
    }

    /// Run a command (default: an interactive shell) inside the environment
    /// with the caller's terminal attached. Returns the remote exit status.
    pub async fn enter(
        &mut self,
        cancel: &CancellationToken,
        env: &Environment,
        argv: &[String],
    ) -> Result<u32> {
        self.ensure_session().await?;

        let pid = self
            .read_namespace_pid(cancel, &env.name)
            .await
            .context("failed to resolve namespace PID")?;

        let cmd = enter_cmd(pid, &env.name, argv);
        debug!(name = %env.name, cmd, "entering environment");
        self.session_mut()?.exec_interactive(&cmd).await
    }

    /// Best-effort recovery of the project path from the namespace's bind
    /// mounts: the first mount target under `/Users` or `/home` that is not
    /// the environment user's own home. `None` when nothing matches.
    pub async fn get_project_path(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<String>> {
        self.ensure_session().await?;

        let pid = self
            .read_namespace_pid(cancel, name)
            .await
            .context("failed to read namespace PID")?;

        let exec_retry = self.exec_retry;
        let output = self
            .session_mut()?
            .exec_with_retry(&project_path_probe_cmd(pid, name), &exec_retry)
            .await
            .context("failed to inspect namespace mounts")?;

        let path = output.trim();
        if path.is_empty() {
            Ok(None)
        } else {
            Ok(Some(path.to_string()))
        }
    }

    /// Best-effort user removal used during rollback and orphan recovery.
    async fn rollback_user(&mut self, name: &str) {
        let session = match self.session_mut() {
            Ok(session) => session,
            Err(_) => return,
        };
        if let Err(e) = session.exec(&delete_user_cmd(name)).await {
            warn!(name, error = %e, "failed to roll back user account");
        }
    }

    /// Release the SSH session. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }
}
