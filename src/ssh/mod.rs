//! Authenticated remote shell channel to the running VM.
//!
//! The channel dials the backend's forwarded SSH port on loopback and
//! multiplexes sub-sessions over one transport: buffered one-shot commands,
//! cancelable and streaming variants, a fully interactive mode with PTY and
//! raw-mode handling, and a pipe mode the caller drains. All variants run
//! through one internal routine parameterized by an output policy.
//!
//! Host-key verification is intentionally disabled: the endpoint is always
//! `127.0.0.1` toward a VM this tool created. Deployments reaching non-local
//! VMs would need to pin host keys instead.

pub mod retry;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use russh::client;
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, Sig};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ssh::retry::RetryConfig;
use crate::vm;

/// Default timeout for the TCP dial toward the VM's forwarded SSH port.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A remote command completed with a non-zero exit status.
///
/// This is not a transport failure: the command ran to completion and the
/// caller decides whether the status is fatal. `output` carries the combined
/// stdout/stderr that was captured (empty for streamed variants).
#[derive(Debug, Error)]
#[error("remote command exited with status {status}: {output}")]
pub struct ExitError {
    pub status: u32,
    pub output: String,
}

/// The caller's cancellation fired while a remote command was in flight.
/// Returned unwrapped so callers can tell cancellation from failure.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Host-key acceptor for the loopback connection to the local VM.
struct TrustedHostHandler;

impl client::Handler for TrustedHostHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Loopback to a VM this tool created; no host-key pinning.
        Ok(true)
    }
}

/// Where command output goes while a remote command runs.
enum Sink<'a> {
    /// Accumulate combined output in memory.
    Buffer(&'a mut Vec<u8>),
    /// Pump chunks to the host's stderr as they arrive.
    HostStderr,
}

impl Sink<'_> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Sink::HostStderr => {
                let mut stderr = tokio::io::stderr();
                stderr.write_all(data).await.context("failed to write to stderr")?;
                stderr.flush().await.context("failed to flush stderr")?;
                Ok(())
            }
        }
    }
}

/// Restores the terminal's cooked mode on every exit path, including panics.
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        crossterm::terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!(error = %e, "failed to restore terminal mode");
        }
    }
}

/// The fixed search path for private keys: the backend's shared user key and
/// the per-instance key.
fn candidate_key_paths(lima_home: &Path, instance_dir: &Path) -> Vec<PathBuf> {
    vec![
        lima_home.join("_config").join("user"),
        instance_dir.join("ssh_key"),
    ]
}

/// Load every parseable private key from the candidate paths. Unreadable or
/// unparseable entries are skipped; valid keys elsewhere still count.
fn load_keys(paths: &[PathBuf]) -> Vec<PrivateKey> {
    let mut keys = Vec::new();
    for path in paths {
        match load_secret_key(path, None) {
            Ok(key) => {
                debug!(path = %path.display(), "loaded SSH key");
                keys.push(key);
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping SSH key");
            }
        }
    }
    keys
}

/// An SSH session to one VM instance.
///
/// Operations that need an open connection open one implicitly; `close` is
/// idempotent. The transport multiplexes sub-sessions, so concurrent
/// commands are permitted but unordered relative to each other.
pub struct Session {
    instance_name: String,
    instance: vm::Instance,
    user: String,
    connect_timeout: Duration,
    handle: Option<client::Handle<TrustedHostHandler>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance_name", &self.instance_name)
            .field("instance", &self.instance)
            .field("user", &self.user)
            .field("connect_timeout", &self.connect_timeout)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl Session {
    /// Look up the instance and prepare a session toward it. Fails when the
    /// instance is not running.
    pub async fn new(instance_name: &str) -> Result<Self> {
        anyhow::ensure!(!instance_name.is_empty(), "instance name cannot be empty");

        let manager = vm::Manager::new(instance_name);
        let instance = manager
            .get_instance()
            .await
            .with_context(|| format!("failed to inspect instance {instance_name}"))?;

        Self::from_instance(instance)
    }

    /// Prepare a session from an already-loaded instance record.
    pub fn from_instance(instance: vm::Instance) -> Result<Self> {
        if !instance.is_running() {
            bail!(
                "instance {} is not running (status: {})",
                instance.name,
                instance.status
            );
        }

        let user = instance.ssh_user().to_string();
        Ok(Self {
            instance_name: instance.name.clone(),
            instance,
            user,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle: None,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Establish the transport. Idempotent: an open connection is reused.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.handle = None;

        let lima_home = vm::Manager::lima_home()?;
        let key_paths = candidate_key_paths(&lima_home, &self.instance.dir);
        let keys = load_keys(&key_paths);
        if keys.is_empty() {
            bail!("no usable SSH keys found in {key_paths:?}");
        }

        let port = self.instance.ssh_local_port;
        let config = Arc::new(client::Config::default());
        let handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, ("127.0.0.1", port), TrustedHostHandler),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "SSH dial to 127.0.0.1:{port} timed out after {:?}",
                self.connect_timeout
            )
        })?
        .with_context(|| format!("failed to dial SSH at 127.0.0.1:{port}"))?;

        let mut handle = handle;
        let mut authenticated = false;
        for key in keys {
            let rsa_hash = handle
                .best_supported_rsa_hash()
                .await
                .context("failed to negotiate signature algorithms")?
                .flatten();
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash);
            match handle.authenticate_publickey(self.user.as_str(), key).await {
                Ok(result) if matches!(result, client::AuthResult::Success) => {
                    authenticated = true;
                    break;
                }
                Ok(_) => {
                    debug!(user = %self.user, "public key rejected, trying next");
                }
                Err(e) => {
                    debug!(user = %self.user, error = %e, "public key authentication failed");
                }
            }
        }
        if !authenticated {
            bail!(
                "SSH authentication as {} failed for instance {}",
                self.user,
                self.instance_name
            );
        }

        debug!(
            instance = %self.instance_name,
            port,
            user = %self.user,
            "SSH session established"
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Connect with exponential backoff. The final error names the attempt
    /// count.
    pub async fn connect_with_retry(&mut self, config: &RetryConfig) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=config.max_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        attempt,
                        max_attempts = config.max_attempts,
                        error = %e,
                        "SSH connect attempt failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < config.max_attempts {
                tokio::time::sleep(config.delay_after(attempt)).await;
            }
        }
        let last = last_error.unwrap_or_else(|| anyhow!("no attempts were made"));
        Err(last.context(format!(
            "failed to connect after {} attempts",
            config.max_attempts
        )))
    }

    /// One internal routine drives every exec variant: open a sub-session,
    /// start the command, route output through the sink, and watch for
    /// cancellation. On cancel the remote session gets a KILL signal and the
    /// call returns [`Cancelled`] within roughly one round trip.
    async fn run_command(
        &mut self,
        cmd: &str,
        sink: &mut Sink<'_>,
        cancel: Option<&CancellationToken>,
    ) -> Result<u32> {
        self.connect().await?;
        let handle = self.handle.as_ref().context("session is not connected")?;

        let mut channel = handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        channel
            .exec(true, cmd)
            .await
            .context("failed to start remote command")?;

        let mut exit_status = 0u32;
        loop {
            let msg = match cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => {
                        channel.signal(Sig::KILL).await.ok();
                        channel.close().await.ok();
                        return Err(Cancelled.into());
                    }
                    msg = channel.wait() => msg,
                },
                None => channel.wait().await,
            };

            match msg {
                None => break,
                Some(ChannelMsg::Data { ref data }) => sink.write(data).await?,
                Some(ChannelMsg::ExtendedData { ref data, .. }) => sink.write(data).await?,
                Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = status,
                Some(_) => {}
            }
        }

        Ok(exit_status)
    }

    /// Run a command and return its combined output. A non-zero exit
    /// surfaces as [`ExitError`] carrying the output.
    pub async fn exec(&mut self, cmd: &str) -> Result<String> {
        let mut buffer = Vec::new();
        let status = self
            .run_command(cmd, &mut Sink::Buffer(&mut buffer), None)
            .await?;
        let output = String::from_utf8_lossy(&buffer).into_owned();
        if status != 0 {
            return Err(ExitError { status, output }.into());
        }
        Ok(output)
    }

    /// Like [`Session::exec`], but aborts the remote command when `cancel`
    /// fires and returns [`Cancelled`].
    pub async fn exec_cancel(
        &mut self,
        cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut buffer = Vec::new();
        let status = self
            .run_command(cmd, &mut Sink::Buffer(&mut buffer), Some(cancel))
            .await?;
        let output = String::from_utf8_lossy(&buffer).into_owned();
        if status != 0 {
            return Err(ExitError { status, output }.into());
        }
        Ok(output)
    }

    /// Like [`Session::exec_cancel`], but output is pumped to the host's
    /// stderr in real time instead of being captured.
    pub async fn exec_stream(&mut self, cmd: &str, cancel: &CancellationToken) -> Result<()> {
        let status = self
            .run_command(cmd, &mut Sink::HostStderr, Some(cancel))
            .await?;
        if status != 0 {
            return Err(ExitError {
                status,
                output: String::new(),
            }
            .into());
        }
        Ok(())
    }

    /// Run a command with exponential backoff on transport failures.
    ///
    /// Non-zero exits are returned verbatim without retrying: the command
    /// reached the guest and repeating it is the caller's decision. When the
    /// session reports disconnection between attempts, it is closed and
    /// reconnected before the next try.
    pub async fn exec_with_retry(&mut self, cmd: &str, config: &RetryConfig) -> Result<String> {
        let mut last_error = None;
        for attempt in 1..=config.max_attempts {
            match self.exec(cmd).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is::<ExitError>() => return Err(e),
                Err(e) => {
                    debug!(
                        attempt,
                        max_attempts = config.max_attempts,
                        error = %e,
                        "exec attempt failed"
                    );
                    last_error = Some(e);
                    if !self.is_connected() {
                        self.close().await.ok();
                        if let Err(reconnect_err) = self.connect().await {
                            debug!(error = %reconnect_err, "reconnect failed during exec retry");
                        }
                    }
                }
            }
            if attempt < config.max_attempts {
                tokio::time::sleep(config.delay_after(attempt)).await;
            }
        }
        let last = last_error.unwrap_or_else(|| anyhow!("no attempts were made"));
        Err(last.context(format!(
            "command failed after {} attempts",
            config.max_attempts
        )))
    }

    /// Run a command with the caller's terminal attached.
    ///
    /// When stdin is a terminal, a PTY is requested and the host terminal is
    /// switched to raw mode for the duration of the call; the guard restores
    /// it on every exit path. Agent forwarding is requested best-effort when
    /// `SSH_AUTH_SOCK` names an existing socket; a failure is a warning.
    ///
    /// Returns the remote command's exit status.
    pub async fn exec_interactive(&mut self, cmd: &str) -> Result<u32> {
        self.connect().await?;
        let handle = self.handle.as_ref().context("session is not connected")?;

        let mut channel = handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;

        if let Some(sock) = std::env::var_os("SSH_AUTH_SOCK") {
            if !sock.is_empty() && Path::new(&sock).exists() {
                if let Err(e) = channel.agent_forward(true).await {
                    crate::ui::warning(&format!("SSH agent forwarding not available: {e}"));
                }
            }
        }

        let is_tty = std::io::stdin().is_terminal();
        let mut raw_guard = None;
        if is_tty {
            let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
            channel
                .request_pty(
                    false,
                    "xterm-256color",
                    u32::from(cols),
                    u32::from(rows),
                    0,
                    0,
                    &[],
                )
                .await
                .context("failed to request PTY")?;
            raw_guard = Some(RawModeGuard::enter()?);
        }

        channel
            .exec(true, cmd)
            .await
            .context("failed to start remote command")?;

        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        let mut buf = vec![0u8; 4096];
        let mut stdin_open = true;
        let mut exit_status = 0u32;

        loop {
            tokio::select! {
                read = stdin.read(&mut buf), if stdin_open => match read {
                    Ok(0) => {
                        stdin_open = false;
                        channel.eof().await.ok();
                    }
                    Ok(n) => {
                        channel
                            .data(&buf[..n])
                            .await
                            .context("failed to forward stdin")?;
                    }
                    Err(e) => {
                        debug!(error = %e, "stdin read failed, closing remote input");
                        stdin_open = false;
                        channel.eof().await.ok();
                    }
                },
                msg = channel.wait() => match msg {
                    None => break,
                    Some(ChannelMsg::Data { ref data }) => {
                        stdout.write_all(data).await.context("failed to write to stdout")?;
                        stdout.flush().await.ok();
                    }
                    Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        stderr.write_all(data).await.context("failed to write to stderr")?;
                        stderr.flush().await.ok();
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = status;
                        if stdin_open {
                            stdin_open = false;
                            channel.eof().await.ok();
                        }
                    }
                    Some(_) => {}
                },
            }
        }

        drop(raw_guard);
        Ok(exit_status)
    }

    /// Start a command and hand back the channel's duplex stream for the
    /// caller to drain. The command runs while the caller reads/writes.
    pub async fn exec_pipe(&mut self, cmd: &str) -> Result<russh::ChannelStream<client::Msg>> {
        self.connect().await?;
        let handle = self.handle.as_ref().context("session is not connected")?;

        let channel = handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        channel
            .exec(true, cmd)
            .await
            .context("failed to start remote command")?;
        Ok(channel.into_stream())
    }

    /// Release the transport. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .ok();
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_closed())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // -----------------------------------------------------------------------
    // Typed errors
    // -----------------------------------------------------------------------

    #[test]
    fn exit_error_carries_status_and_output() {
        let err = ExitError {
            status: 127,
            output: "bash: nope: command not found".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("127"));
        assert!(msg.contains("command not found"));
    }

    #[test]
    fn exit_error_downcasts_through_anyhow() {
        let err: anyhow::Error = ExitError {
            status: 1,
            output: String::new(),
        }
        .into();
        assert!(err.is::<ExitError>());
        assert_eq!(err.downcast_ref::<ExitError>().unwrap().status, 1);
    }

    #[test]
    fn cancelled_is_distinguishable() {
        let err: anyhow::Error = Cancelled.into();
        assert!(err.is::<Cancelled>());
        assert!(!err.is::<ExitError>());
    }

    // -----------------------------------------------------------------------
    // Session construction
    // -----------------------------------------------------------------------

    #[test]
    fn from_instance_rejects_non_running_with_status() {
        let instance = vm::Instance {
            name: "llima-box".into(),
            status: "Stopped".into(),
            ..Default::default()
        };
        let err = Session::from_instance(instance).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not running"));
        assert!(msg.contains("Stopped"), "error should carry the status: {msg}");
    }

    #[test]
    fn from_instance_accepts_running_and_derives_user() {
        let instance = vm::Instance {
            name: "llima-box".into(),
            status: "Running".into(),
            ..Default::default()
        };
        let session = Session::from_instance(instance).unwrap();
        assert_eq!(session.instance_name(), "llima-box");
        assert_eq!(session.user(), "lima");
        assert!(!session.is_connected());
    }

    // -----------------------------------------------------------------------
    // Key discovery
    // -----------------------------------------------------------------------

    #[test]
    fn candidate_paths_cover_shared_and_instance_keys() {
        let paths = candidate_key_paths(
            Path::new("/home/alice/.lima"),
            Path::new("/home/alice/.lima/llima-box"),
        );
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], PathBuf::from("/home/alice/.lima/_config/user"));
        assert_eq!(paths[1], PathBuf::from("/home/alice/.lima/llima-box/ssh_key"));
    }

    #[test]
    fn load_keys_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("absent-a"), dir.path().join("absent-b")];
        assert!(load_keys(&paths).is_empty());
    }

    #[test]
    fn load_keys_skips_unparseable_files() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("garbage_key");
        let mut f = std::fs::File::create(&bogus).unwrap();
        f.write_all(b"this is not a private key").unwrap();

        assert!(load_keys(&[bogus]).is_empty());
    }

    // -----------------------------------------------------------------------
    // Output sinks
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn buffer_sink_accumulates_chunks() {
        let mut buffer = Vec::new();
        let mut sink = Sink::Buffer(&mut buffer);
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        assert_eq!(buffer, b"hello world");
    }
}
