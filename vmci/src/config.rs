//! Pipeline configuration.
//!
//! Loaded from a TOML file; every section has defaults so an empty file is a
//! valid (qemu + ssh) configuration. `sanitize()` validates before any work
//! starts so a bad config never costs a VM boot.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vmci_shared::{Identity, OperationKind, VmciError, VmciResult};

/// Top-level configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub artifacts: ArtifactsConfig,
    pub vm: VmConfig,
    pub guest: GuestConfig,
    pub identities: IdentitiesConfig,
    pub provision: ProvisionConfig,
    pub workflow: WorkflowConfig,
    pub harness: HarnessConfig,
    pub publish: PublishConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> VmciResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmciError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
            .map_err(|e| VmciError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> VmciResult<Self> {
        toml::from_str(text).map_err(|e| VmciError::Config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn sanitize(&self) -> VmciResult<()> {
        if self.vm.program.trim().is_empty() {
            return Err(VmciError::Config("vm.program must not be empty".into()));
        }
        if self.vm.boot_timeout_secs == 0 {
            return Err(VmciError::Config("vm.boot_timeout_secs must be > 0".into()));
        }
        Regex::new(&self.vm.readiness_marker).map_err(|e| {
            VmciError::Config(format!(
                "vm.readiness_marker '{}' is not a valid regex: {}",
                self.vm.readiness_marker, e
            ))
        })?;
        if self.workflow.operation_timeout_secs == 0 {
            return Err(VmciError::Config(
                "workflow.operation_timeout_secs must be > 0".into(),
            ));
        }
        if self.provision.command_timeout_secs == 0 {
            return Err(VmciError::Config(
                "provision.command_timeout_secs must be > 0".into(),
            ));
        }
        for key in self.harness.commands.keys() {
            OperationKind::parse(key)
                .map_err(|_| VmciError::Config(format!("harness.commands: unknown kind '{}'", key)))?;
        }
        if self.identities.operator.is_empty() || self.identities.validator.is_empty() {
            return Err(VmciError::Config("identities must not be empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// ARTIFACTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactsConfig {
    /// Root of the local content store.
    pub root: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        let root = dirs::data_local_dir()
            .map(|d| d.join("vmci").join("artifacts"))
            .unwrap_or_else(|| PathBuf::from(".vmci").join("artifacts"));
        Self { root }
    }
}

// ============================================================================
// VM
// ============================================================================

/// How the VM process is launched and when it counts as booted.
///
/// `args` is a template; `{kernel}`, `{initrd}`, `{disk}`, `{cmdline}`,
/// `{memory}`, `{cpus}` and `{ssh_port}` are substituted per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Kernel override; defaults to the kernel shipped in the baseline bundle.
    pub kernel: Option<PathBuf>,
    /// Initial ramdisk override; defaults to the bundle's initrd.
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    /// Regex matched against each console line.
    pub readiness_marker: String,
    pub boot_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL at teardown.
    pub shutdown_grace_secs: u64,
    pub memory_mib: u32,
    pub cpus: u32,
}

impl VmConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            program: "qemu-system-x86_64".to_string(),
            args: [
                "-machine",
                "accel=kvm:tcg",
                "-m",
                "{memory}",
                "-smp",
                "{cpus}",
                "-kernel",
                "{kernel}",
                "-initrd",
                "{initrd}",
                "-append",
                "{cmdline}",
                "-drive",
                "file={disk},if=virtio,format=raw",
                "-netdev",
                "user,id=net0,hostfwd=tcp:127.0.0.1:{ssh_port}-:22",
                "-device",
                "virtio-net-pci,netdev=net0",
                "-display",
                "none",
                "-monitor",
                "none",
                "-serial",
                "stdio",
                "-no-reboot",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            kernel: None,
            initrd: None,
            cmdline: "console=ttyS0 root=/dev/vda rw panic=-1".to_string(),
            readiness_marker: "vmci-ready".to_string(),
            boot_timeout_secs: 300,
            shutdown_grace_secs: 10,
            memory_mib: 2048,
            cpus: 2,
        }
    }
}

// ============================================================================
// GUEST CHANNEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Commands go over ssh to the forwarded guest port.
    #[default]
    Ssh,
    /// Commands run on this machine (guest-side tooling, tests).
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuestConfig {
    pub channel: ChannelKind,
    pub ssh: SshConfig,
    /// Local channel only: switch accounts with `sudo -n -u`.
    pub local_sudo: bool,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            channel: ChannelKind::Ssh,
            ssh: SshConfig::default(),
            local_sudo: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub program: String,
    pub host: String,
    pub port: u16,
    pub key: Option<PathBuf>,
    /// Extra `-o` options, e.g. `LogLevel=ERROR`.
    pub options: Vec<String>,
    pub connect_timeout_secs: u64,
    /// Attempts to reach the guest after the readiness marker.
    pub connect_retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            host: "127.0.0.1".to_string(),
            port: 2222,
            key: None,
            options: Vec::new(),
            connect_timeout_secs: 10,
            connect_retries: 30,
            retry_interval_ms: 1000,
        }
    }
}

// ============================================================================
// IDENTITIES
// ============================================================================

/// Guest account names for each identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentitiesConfig {
    pub operator: String,
    pub validator: String,
}

impl IdentitiesConfig {
    pub fn account(&self, identity: Identity) -> &str {
        match identity {
            Identity::Operator => &self.operator,
            Identity::Validator => &self.validator,
        }
    }
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self {
            operator: "operator".to_string(),
            validator: "validator".to_string(),
        }
    }
}

// ============================================================================
// PROVISIONING
// ============================================================================

/// Assertion run after provisioning commands succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SmokeCheck {
    /// Binary resolvable on the operator's PATH.
    Binary { name: String },
    /// Path exists in the guest.
    File { path: String },
    /// Command exits 0.
    Command { command: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    pub commands: Vec<String>,
    pub smoke: Vec<SmokeCheck>,
    pub command_timeout_secs: u64,
}

impl ProvisionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            smoke: Vec::new(),
            command_timeout_secs: 600,
        }
    }
}

// ============================================================================
// WORKFLOW
// ============================================================================

/// What happens after an operation fails its assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AssertionPolicy {
    /// Keep running independent scenarios, report everything at the end.
    #[default]
    RunAll,
    /// Stop at the first operation that does not pass.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Scenario files or directories, used when the CLI names none.
    pub scenarios: Vec<PathBuf>,
    pub operation_timeout_secs: u64,
    pub policy: AssertionPolicy,
}

impl WorkflowConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            scenarios: Vec::new(),
            operation_timeout_secs: 60,
            policy: AssertionPolicy::RunAll,
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HarnessMode {
    /// Run the operation command in the guest, evaluate on the host.
    #[default]
    Host,
    /// Invoke `vmci-harness` inside the guest and parse its result record.
    Guest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub mode: HarnessMode,
    /// Path of `vmci-harness` inside the guest.
    pub guest_binary: String,
    /// Command template per operation kind (`check-out`, `check-in`, ...).
    pub commands: BTreeMap<String, String>,
}

impl HarnessConfig {
    /// Template for a kind, if configured.
    pub fn template(&self, kind: OperationKind) -> Option<&str> {
        self.commands.get(kind.as_str()).map(String::as_str)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: HarnessMode::Host,
            guest_binary: "/usr/local/bin/vmci-harness".to_string(),
            commands: default_command_templates(),
        }
    }
}

/// Built-in templates for the stock inventory workflow tool.
pub fn default_command_templates() -> BTreeMap<String, String> {
    OperationKind::ALL
        .into_iter()
        .filter_map(|kind| {
            kind.default_template()
                .map(|template| (kind.as_str().to_string(), template.to_string()))
        })
        .collect()
}

// ============================================================================
// PUBLISH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PublishPolicy {
    /// Publish every run; failed runs get a partial bundle with their logs.
    #[default]
    Always,
    /// Only passing runs reach the store; failed runs keep logs in the work dir.
    OnSuccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    pub policy: PublishPolicy,
    /// Ship the VM image with a failed run's bundle.
    pub include_image_on_failure: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            policy: PublishPolicy::Always,
            include_image_on_failure: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config = PipelineConfig::from_toml("").unwrap();
        config.sanitize().unwrap();
        assert_eq!(config.vm.program, "qemu-system-x86_64");
        assert_eq!(config.workflow.policy, AssertionPolicy::RunAll);
        assert_eq!(config.publish.policy, PublishPolicy::Always);
        assert!(config.harness.template(OperationKind::CheckOut).is_some());
        assert!(config.harness.template(OperationKind::Exec).is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = PipelineConfig::from_toml(
            r#"
            [vm]
            program = "sh"
            args = ["-c", "echo vmci-ready; sleep 30"]
            boot_timeout_secs = 5

            [guest]
            channel = "local"

            [identities]
            operator = "ops"
            validator = "qa"

            [provision]
            commands = ["mkdir -p /srv/inventory"]
            smoke = [
                { kind = "binary", name = "inventory" },
                { kind = "file", path = "/etc/inventory.conf" },
            ]

            [workflow]
            policy = "fail-fast"
            operation_timeout_secs = 5

            [harness]
            mode = "guest"

            [harness.commands]
            status = "inv status {item}"

            [publish]
            policy = "on-success"
            "#,
        )
        .unwrap();
        config.sanitize().unwrap();

        assert_eq!(config.guest.channel, ChannelKind::Local);
        assert_eq!(config.identities.account(Identity::Operator), "ops");
        assert_eq!(config.identities.account(Identity::Validator), "qa");
        assert_eq!(
            config.provision.smoke[0],
            SmokeCheck::Binary {
                name: "inventory".into()
            }
        );
        assert_eq!(config.workflow.policy, AssertionPolicy::FailFast);
        assert_eq!(config.harness.mode, HarnessMode::Guest);
        assert_eq!(
            config.harness.template(OperationKind::Status),
            Some("inv status {item}")
        );
        assert_eq!(config.publish.policy, PublishPolicy::OnSuccess);
    }

    #[test]
    fn test_sanitize_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.vm.readiness_marker = "([".into();
        assert!(config.sanitize().is_err());

        let mut config = PipelineConfig::default();
        config.workflow.operation_timeout_secs = 0;
        assert!(config.sanitize().is_err());

        let mut config = PipelineConfig::default();
        config
            .harness
            .commands
            .insert("teleport".into(), "beam {item}".into());
        assert!(config.sanitize().is_err());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(PipelineConfig::from_toml("[vm]\nprogramm = \"qemu\"").is_err());
    }
}
