//! Command implementations for the llima-box CLI.
//!
//! The front-end stays thin: argument shaping, confirmation prompts, and
//! operator messages. All real work happens in the environment controller.
//! Tables go to stdout so they can be piped; everything else goes to stderr.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::env::{self, naming};
use crate::ui;
use crate::vm;

/// `shell [path] [-- cmd…]`: create the environment if needed and attach the
/// caller's terminal to it. Returns the remote command's exit status.
pub async fn run_shell(
    config: &Config,
    cancel: &CancellationToken,
    path: Option<PathBuf>,
    command: Vec<String>,
) -> Result<u32> {
    let project_path = resolve_project_path(path)?;

    ui::info("Ensuring VM is running...");
    let mut manager = env::Manager::new(config);

    ui::info(&format!(
        "Setting up environment for {}...",
        project_path.display()
    ));
    let environment = manager
        .create(cancel, &project_path)
        .await
        .context("failed to create environment")?;

    ui::info(&format!("Environment: {}", environment.name));

    let status = manager
        .enter(cancel, &environment, &command)
        .await
        .context("failed to enter environment")?;

    manager.close().await.ok();
    Ok(status)
}

/// `list`: table of environments with best-effort project paths.
pub async fn run_list(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let vm_manager = vm::Manager::new(&config.vm.instance_name);

    if !vm_manager.exists().await.context("failed to check VM existence")? {
        ui::info("No VM created yet. Use 'llima-box shell' to create one.");
        return Ok(());
    }
    if !vm_manager.is_running().await.context("failed to check VM status")? {
        ui::info("VM is not running. Use 'llima-box shell' to start it.");
        return Ok(());
    }

    let mut manager = env::Manager::new(config);
    let environments: Vec<_> = manager
        .list()
        .await
        .context("failed to list environments")?
        .into_iter()
        .filter(|e| naming::is_environment_name(&e.name))
        .collect();

    if environments.is_empty() {
        ui::info("No environments found. Use 'llima-box shell' to create one.");
        return Ok(());
    }

    let mut table = ui::new_table(&["ENVIRONMENT", "PROJECT PATH"]);
    for environment in &environments {
        let project_path = manager
            .get_project_path(cancel, &environment.name)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "(unknown)".to_string());
        table.add_row([environment.name.clone(), project_path]);
    }
    println!("{table}");

    ui::plain(&format!("\nTotal: {} environment(s)", environments.len()));
    manager.close().await.ok();
    Ok(())
}

/// `delete [path] [--force]`: remove one environment after confirmation.
pub async fn run_delete(
    config: &Config,
    cancel: &CancellationToken,
    path: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let project_path = resolve_any_path(path)?;
    let name = naming::generate(&project_path)
        .context("failed to generate environment name")?;

    let vm_manager = vm::Manager::new(&config.vm.instance_name);
    if !vm_manager.exists().await.context("failed to check VM existence")? {
        bail!("VM does not exist (no environments to delete)");
    }
    if !vm_manager.is_running().await.context("failed to check VM status")? {
        bail!("VM is not running (cannot delete environments)");
    }

    let mut manager = env::Manager::new(config);
    if !manager.exists(&name).await? {
        bail!("environment {name} does not exist");
    }

    if !force {
        ui::plain(&format!(
            "Delete environment '{name}' for project '{}'?",
            project_path.display()
        ));
        let confirmed =
            ui::confirm("This will terminate all processes and remove all data. Continue?")?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    ui::info(&format!("Deleting environment {name}..."));
    manager
        .delete(cancel, &name)
        .await
        .context("failed to delete environment")?;
    ui::success("Environment deleted");

    manager.close().await.ok();
    Ok(())
}

/// `delete-all [--force]`: remove every environment, continuing past
/// individual failures. Non-zero exit if any failed.
pub async fn run_delete_all(
    config: &Config,
    cancel: &CancellationToken,
    force: bool,
) -> Result<()> {
    let vm_manager = vm::Manager::new(&config.vm.instance_name);
    if !vm_manager.exists().await.context("failed to check VM existence")? {
        ui::info("No VM exists. Nothing to delete.");
        return Ok(());
    }
    if !vm_manager.is_running().await.context("failed to check VM status")? {
        bail!("VM is not running (cannot delete environments)");
    }

    let mut manager = env::Manager::new(config);
    let environments: Vec<_> = manager
        .list()
        .await
        .context("failed to list environments")?
        .into_iter()
        .filter(|e| naming::is_environment_name(&e.name))
        .collect();

    if environments.is_empty() {
        ui::info("No environments to delete.");
        return Ok(());
    }

    ui::info(&format!("Found {} environment(s):", environments.len()));
    for environment in &environments {
        ui::plain(&format!("  - {}", environment.name));
    }

    if !force {
        ui::warning(&format!(
            "Delete ALL {} environment(s)?",
            environments.len()
        ));
        let confirmed =
            ui::confirm("This will terminate all processes and remove all data. Continue?")?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    ui::info("Deleting environments...");
    let result = manager.delete_all(cancel).await;
    manager.close().await.ok();

    match result {
        Ok(()) => {
            ui::success(&format!("Deleted {} environment(s)", environments.len()));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Hidden `debug-vm`: print VM discovery state without touching it.
pub async fn run_debug_vm(config: &Config) -> Result<()> {
    let vm_manager = vm::Manager::new(&config.vm.instance_name);

    let exists = vm_manager.exists().await?;
    ui::plain(&format!("VM exists: {exists}"));
    if !exists {
        ui::info("VM does not exist. Use 'llima-box shell' to create it.");
        return Ok(());
    }

    let instance = vm_manager.get_instance().await?;
    ui::plain(&format!("  Name:   {}", instance.name));
    ui::plain(&format!("  Status: {}", instance.status));
    ui::plain(&format!("  Dir:    {}", instance.dir.display()));
    ui::plain(&format!("  Arch:   {}", instance.arch));
    ui::plain(&format!("  CPUs:   {}", instance.cpus));
    ui::plain(&format!("  SSH:    127.0.0.1:{}", instance.ssh_local_port));
    ui::plain(&format!("  User:   {}", instance.ssh_user()));
    Ok(())
}

/// Hidden `debug-name`: print the generated environment name for a path.
pub fn run_debug_name(path: Option<PathBuf>) -> Result<()> {
    let project_path = resolve_any_path(path)?;
    let name = naming::generate(&project_path)?;

    ui::plain(&format!("Project path:     {}", project_path.display()));
    ui::plain(&format!("Environment name: {name}"));
    ui::plain(&format!("Valid login name: {}", naming::is_valid_name(&name)));
    ui::plain(&format!("Length:           {} (max 32)", name.len()));
    ui::plain(&format!("Namespace PID:    {}", env::pid_file_path(&name)));
    Ok(())
}

/// Resolve the project path for commands that operate on a live directory:
/// default to the current directory, absolutize, and require an existing
/// directory.
fn resolve_project_path(path: Option<PathBuf>) -> Result<PathBuf> {
    let abs = resolve_any_path(path)?;

    let metadata = match std::fs::metadata(&abs) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("path does not exist: {}", abs.display());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to stat path: {}", abs.display()));
        }
    };
    if !metadata.is_dir() {
        bail!("path is not a directory: {}", abs.display());
    }

    Ok(abs)
}

/// Resolve a path argument without requiring it to exist; `delete` must
/// work for projects whose directory is already gone.
fn resolve_any_path(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => std::env::current_dir().context("failed to get current directory")?,
    };
    std::path::absolute(&path)
        .with_context(|| format!("failed to resolve absolute path: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_project_path_accepts_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_project_path(Some(dir.path().to_path_buf())).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with(dir.path().file_name().unwrap()));
    }

    #[test]
    fn resolve_project_path_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = resolve_project_path(Some(missing)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn resolve_project_path_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a-file");
        std::fs::write(&file, "x").unwrap();
        let err = resolve_project_path(Some(file)).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn resolve_project_path_defaults_to_cwd() {
        let resolved = resolve_project_path(None).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn resolve_any_path_allows_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("already-deleted");
        let resolved = resolve_any_path(Some(missing.clone())).unwrap();
        assert_eq!(resolved, std::path::absolute(&missing).unwrap());
    }
}
