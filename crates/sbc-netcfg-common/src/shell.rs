//! Host command execution for netcfg managers.
//!
//! Every external tool invocation, PATH lookup and host path probe goes
//! through the [`HostExecutor`] capability so that managers can be driven
//! against a real host ([`SystemExecutor`]) or a deterministic fixture.
//! Commands are passed as argv vectors, never through a shell.
//!
//! # Example
//!
//! ```ignore
//! use sbc_netcfg_common::shell::{self, argv, IP_CMD};
//!
//! let out = shell::exec_or_fail(executor.as_ref(), &argv([IP_CMD, "route", "show"])).await?;
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use crate::error::{NetCfgError, NetCfgResult};

/// `ip` from iproute2, used for routes, addresses and policy rules.
pub const IP_CMD: &str = "ip";

/// nftables front end.
pub const NFT_CMD: &str = "nft";

/// Legacy iptables front end.
pub const IPTABLES_CMD: &str = "iptables";

/// Bulk loader for iptables rule files.
pub const IPTABLES_RESTORE_CMD: &str = "iptables-restore";

/// Declarative interface manager CLI.
pub const NETPLAN_CMD: &str = "netplan";

/// systemd service control.
pub const SYSTEMCTL_CMD: &str = "systemctl";

/// SysV service wrapper, used when systemctl fails.
pub const SERVICE_CMD: &str = "service";

/// Process lookup by name.
pub const PGREP_CMD: &str = "pgrep";

/// Integrated DNS/DHCP resolver.
pub const DNSMASQ_CMD: &str = "dnsmasq";

/// ISC standalone DHCP server.
pub const DHCPD_CMD: &str = "dhcpd";

/// ISC DHCP relay agent.
pub const DHCRELAY_CMD: &str = "dhcrelay";

/// `$`, `` ` ``, `"`, `\` and newline, escaped inside double quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Arguments made only of these characters are printed unquoted.
static SHELL_SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_@%+=:,./-]+$").expect("Invalid regex pattern"));

/// Quotes a string for safe use in a shell command line.
///
/// The string is wrapped in double quotes and `$`, `` ` ``, `"`, `\` and
/// newline are backslash-escaped.
///
/// ```
/// use sbc_netcfg_common::shell::shellquote;
///
/// assert_eq!(shellquote("allow ssh"), "\"allow ssh\"");
/// assert_eq!(shellquote("$WAN"), "\"\\$WAN\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Renders an argv as a copy-pasteable command line for logs and errors.
pub fn command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if SHELL_SAFE_RE.is_match(arg) {
                arg.clone()
            } else {
                shellquote(arg)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds an owned argv from string-like items.
pub fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Result of a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success, -1 = killed by signal).
    pub exit_code: i32,
    /// Captured stdout, trailing whitespace trimmed.
    pub stdout: String,
    /// Captured stderr, trailing whitespace trimmed.
    pub stderr: String,
}

impl ExecResult {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Capability through which managers touch the host.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Runs a command to completion (or timeout) and captures its output.
    ///
    /// A non-zero exit is reported through [`ExecResult::exit_code`], not as
    /// an error; errors are reserved for spawn failures and timeouts.
    async fn exec(&self, argv: &[String]) -> NetCfgResult<ExecResult>;

    /// Resolves a tool name on PATH.
    fn resolve_tool(&self, tool: &str) -> Option<PathBuf>;

    /// Returns true if the path exists on the host.
    fn path_exists(&self, path: &Path) -> bool;
}

/// Runs a command and converts a non-zero exit into [`NetCfgError::CommandFailed`].
pub async fn exec_or_fail(executor: &dyn HostExecutor, argv: &[String]) -> NetCfgResult<String> {
    let result = executor.exec(argv).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(NetCfgError::CommandFailed {
            command: command_line(argv),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Returns true if a process with exactly this name is running.
pub async fn process_running(executor: &dyn HostExecutor, name: &str) -> bool {
    match executor.exec(&argv([PGREP_CMD, "-x", name])).await {
        Ok(result) => result.success(),
        Err(e) => {
            tracing::debug!(process = %name, error = %e, "pgrep probe failed");
            false
        }
    }
}

/// Executor that runs real processes on the local host.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    timeout: Duration,
}

impl SystemExecutor {
    /// Creates an executor that kills any command running longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns the configured command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl HostExecutor for SystemExecutor {
    async fn exec(&self, argv: &[String]) -> NetCfgResult<ExecResult> {
        let cmd = command_line(argv);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| NetCfgError::validation("command", "empty argv"))?;

        tracing::debug!(command = %cmd, "Executing host command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NetCfgError::CommandSpawn {
                command: cmd.clone(),
                source: e,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|e| NetCfgError::CommandSpawn {
                command: cmd.clone(),
                source: e,
            })?,
            Err(_) => {
                tracing::warn!(command = %cmd, timeout = ?self.timeout, "Command timed out, killed");
                return Err(NetCfgError::CommandTimeout {
                    command: cmd,
                    timeout: self.timeout,
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let result = ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        };

        if result.success() {
            tracing::trace!(command = %cmd, "Command succeeded");
        } else {
            tracing::warn!(
                command = %cmd,
                exit_code = exit_code,
                stderr = %result.stderr,
                "Command failed"
            );
        }

        Ok(result)
    }

    fn resolve_tool(&self, tool: &str) -> Option<PathBuf> {
        which::which(tool).ok()
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
