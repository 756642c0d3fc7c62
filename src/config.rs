use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for llima-box.
///
/// Everything has a default; the config file is optional and only overrides
/// the knobs it names. All persistent environment state lives in the guest,
/// so nothing here is state, only tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vm: VmSection,
    pub ssh: SshSection,
    pub env: EnvSection,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the given file, or fall back to defaults when no path is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.vm.instance_name.is_empty(),
            "vm.instance_name must not be empty"
        );
        anyhow::ensure!(
            self.ssh.connect_timeout_secs >= 1,
            "ssh.connect_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.ssh.retry_max_attempts >= 1,
            "ssh.retry_max_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.ssh.retry_multiplier >= 1.0,
            "ssh.retry_multiplier must be >= 1.0"
        );
        Ok(())
    }
}

/// VM instance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSection {
    /// Name of the single Lima instance this tool owns.
    pub instance_name: String,
}

impl Default for VmSection {
    fn default() -> Self {
        Self {
            instance_name: "llima-box".into(),
        }
    }
}

/// Remote channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    /// TCP dial timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum connect/exec attempts before giving up.
    pub retry_max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_initial_delay_ms: u64,
    /// Cap on the backoff delay, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Backoff multiplier applied after each attempt.
    pub retry_multiplier: f64,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            retry_multiplier: 2.0,
        }
    }
}

impl SshSection {
    /// The retry policy expressed as a [`crate::ssh::retry::RetryConfig`].
    pub fn retry_config(&self) -> crate::ssh::retry::RetryConfig {
        crate::ssh::retry::RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }
}

/// Environment provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvSection {
    /// Delay after spawning the namespace holder before verifying it, in
    /// milliseconds. The detached process needs a moment to write its PID
    /// and settle into the new namespace.
    pub namespace_settle_ms: u64,
}

impl Default for EnvSection {
    fn default() -> Self {
        Self {
            namespace_settle_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.vm.instance_name, "llima-box");
        assert_eq!(config.ssh.connect_timeout_secs, 10);
        assert_eq!(config.ssh.retry_max_attempts, 3);
        assert_eq!(config.ssh.retry_initial_delay_ms, 1_000);
        assert_eq!(config.ssh.retry_max_delay_ms, 10_000);
        assert_eq!(config.env.namespace_settle_ms, 500);
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[vm]
instance_name = "llima-test"

[ssh]
retry_max_attempts = 5
retry_initial_delay_ms = 2000
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.vm.instance_name, "llima-test");
        assert_eq!(config.ssh.retry_max_attempts, 5);
        assert_eq!(config.ssh.retry_initial_delay_ms, 2_000);
        // Unset fields keep defaults
        assert_eq!(config.ssh.connect_timeout_secs, 10);
        assert_eq!(config.env.namespace_settle_ms, 500);
    }

    #[test]
    fn config_rejects_empty_instance_name() {
        let mut config = Config::default();
        config.vm.instance_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_zero_attempts() {
        let mut config = Config::default();
        config.ssh.retry_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_shrinking_multiplier() {
        let mut config = Config::default();
        config.ssh.retry_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_config_conversion() {
        let section = SshSection::default();
        let retry = section.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn load_or_default_without_path() {
        let config = Config::load_or_default(None).unwrap();
        assert_eq!(config.vm.instance_name, "llima-box");
    }
}
