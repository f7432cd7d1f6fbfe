//! Host network command execution.
//!
//! The network builder describes every kernel mutation as a [`NetCommand`]
//! (an `ip` or `iptables` invocation) or a sysctl write, and hands it to a
//! [`HostNet`]. [`SystemHost`] executes them for real.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::netns;

/// One `ip`/`iptables` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetCommand {
    program: &'static str,
    args: Vec<String>,
}

impl NetCommand {
    /// `ip <args>` on the host.
    #[must_use]
    pub fn ip(args: &[&str]) -> Self {
        Self {
            program: "ip",
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    /// `ip -n <namespace> <args>`.
    #[must_use]
    pub fn ip_in(namespace: &str, args: &[&str]) -> Self {
        let mut cmd = Self::ip(&["-n", namespace]);
        cmd.args.extend(args.iter().map(|a| (*a).to_owned()));
        cmd
    }

    /// `iptables <args>` on the host, or inside `namespace` via `ip netns exec`.
    #[must_use]
    pub fn iptables(namespace: Option<&str>, args: &[&str]) -> Self {
        let mut cmd = match namespace {
            Some(ns) => Self::ip(&["netns", "exec", ns, "iptables"]),
            None => Self {
                program: "iptables",
                args: Vec::new(),
            },
        };
        cmd.args.extend(args.iter().map(|a| (*a).to_owned()));
        cmd
    }

    #[must_use]
    pub fn program(&self) -> &'static str {
        self.program
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for NetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A host command that exited unsuccessfully or could not be run.
#[derive(Debug, Clone, thiserror::Error)]
#[error("`{command}` failed: {stderr}")]
pub struct CommandFailure {
    pub command: String,
    pub stderr: String,
}

impl CommandFailure {
    /// Whether the failure means the object being removed is already gone.
    ///
    /// Undo steps treat this as success.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        const ABSENT: [&str; 6] = [
            "Cannot find device",
            "No such file or directory",
            "No such process",
            "does not exist",
            "Bad rule",
            "Cannot open network namespace",
        ];
        ABSENT.iter().any(|pattern| self.stderr.contains(pattern))
    }
}

/// Executes host network mutations.
#[async_trait]
pub trait HostNet: Send + Sync {
    /// Run a command to completion.
    async fn run(&self, command: &NetCommand) -> Result<(), CommandFailure>;

    /// Write `value` to the sysctl `key` (dotted form), inside `namespace` if
    /// given.
    async fn write_sysctl(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), CommandFailure>;
}

/// Run `command`, treating "already gone" as success.
pub(crate) async fn run_idempotent(
    host: &dyn HostNet,
    command: &NetCommand,
) -> Result<(), CommandFailure> {
    match host.run(command).await {
        Err(failure) if failure.is_absent() => {
            tracing::debug!(%command, "already absent");
            Ok(())
        }
        other => other,
    }
}

/// [`HostNet`] that spawns `ip`/`iptables` and writes `/proc/sys`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

fn sysctl_path(key: &str) -> PathBuf {
    PathBuf::from("/proc/sys").join(key.replace('.', "/"))
}

#[async_trait]
impl HostNet for SystemHost {
    async fn run(&self, command: &NetCommand) -> Result<(), CommandFailure> {
        tracing::debug!(%command, "running host command");
        let output = tokio::process::Command::new(command.program)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CommandFailure {
                command: command.to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CommandFailure {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }

    async fn write_sysctl(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), CommandFailure> {
        let path = sysctl_path(key);
        let failure = |e: std::io::Error| CommandFailure {
            command: match namespace {
                Some(ns) => format!("sysctl {key}={value} (in {ns})"),
                None => format!("sysctl {key}={value}"),
            },
            stderr: e.to_string(),
        };

        match namespace {
            // /proc/sys/net resolves against the writing thread's namespace.
            Some(ns) => {
                let value = value.to_owned();
                netns::run_in_namespace(ns, move || std::fs::write(path, value))
                    .await
                    .map_err(failure)
            }
            None => tokio::fs::write(path, value).await.map_err(failure),
        }
    }
}
