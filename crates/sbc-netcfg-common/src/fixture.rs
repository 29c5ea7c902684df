//! Deterministic [`HostExecutor`] for tests.
//!
//! Commands never reach the host: each argv is recorded and answered from a
//! table of canned results keyed by the space-joined command line. Tool
//! lookups and path probes are answered from explicit sets.
//!
//! # Example
//!
//! ```
//! use sbc_netcfg_common::fixture::FixtureExecutor;
//! use sbc_netcfg_common::shell::ExecResult;
//!
//! let exec = FixtureExecutor::new()
//!     .with_tool("nft")
//!     .respond("nft list tables", ExecResult::ok("table ip filter"));
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{NetCfgError, NetCfgResult};
use crate::shell::{ExecResult, HostExecutor};

/// Canned-response executor that records every command it is asked to run.
#[derive(Debug, Default)]
pub struct FixtureExecutor {
    responses: Mutex<HashMap<String, ExecResult>>,
    timeouts: Mutex<HashSet<String>>,
    tools: Mutex<HashSet<String>>,
    paths: Mutex<HashSet<PathBuf>>,
    calls: Mutex<Vec<Vec<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl FixtureExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `tool` resolvable on the fake PATH.
    pub fn with_tool(self, tool: &str) -> Self {
        lock(&self.tools).insert(tool.to_string());
        self
    }

    /// Makes `path` exist.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        lock(&self.paths).insert(path.into());
        self
    }

    /// Answers `command` with `result`. Unlisted commands succeed with empty output.
    pub fn respond(self, command: &str, result: ExecResult) -> Self {
        self.set_response(command, result);
        self
    }

    /// Answers `command` with a non-zero exit.
    pub fn fail(self, command: &str, exit_code: i32, stderr: &str) -> Self {
        self.respond(command, ExecResult::failed(exit_code, stderr))
    }

    /// Makes `command` behave as if it hung past the timeout.
    pub fn time_out(self, command: &str) -> Self {
        lock(&self.timeouts).insert(command.to_string());
        self
    }

    /// Replaces a canned response after construction.
    pub fn set_response(&self, command: &str, result: ExecResult) {
        lock(&self.responses).insert(command.to_string(), result);
    }

    /// Every command run so far, space-joined, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|argv| argv.join(" ")).collect()
    }

    /// True if `command` was run at least once.
    pub fn ran(&self, command: &str) -> bool {
        self.commands().iter().any(|c| c == command)
    }

    /// Commands starting with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn clear_commands(&self) {
        lock(&self.calls).clear();
    }
}

#[async_trait]
impl HostExecutor for FixtureExecutor {
    async fn exec(&self, argv: &[String]) -> NetCfgResult<ExecResult> {
        let line = argv.join(" ");
        lock(&self.calls).push(argv.to_vec());
        if lock(&self.timeouts).contains(&line) {
            return Err(NetCfgError::CommandTimeout {
                command: line,
                timeout: std::time::Duration::from_secs(30),
            });
        }
        Ok(lock(&self.responses)
            .get(&line)
            .cloned()
            .unwrap_or_else(|| ExecResult::ok("")))
    }

    fn resolve_tool(&self, tool: &str) -> Option<PathBuf> {
        lock(&self.tools)
            .contains(tool)
            .then(|| PathBuf::from("/usr/sbin").join(tool))
    }

    fn path_exists(&self, path: &Path) -> bool {
        lock(&self.paths).contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::argv;

    #[tokio::test]
    async fn test_canned_and_default_responses() {
        let exec = FixtureExecutor::new()
            .respond("ip route show", ExecResult::ok("default via 192.168.1.254 dev eth0"))
            .fail("nft list tables", 1, "Operation not permitted");

        let routes = exec.exec(&argv(["ip", "route", "show"])).await.unwrap();
        assert_eq!(routes.stdout, "default via 192.168.1.254 dev eth0");

        let nft = exec.exec(&argv(["nft", "list", "tables"])).await.unwrap();
        assert_eq!(nft.exit_code, 1);

        let other = exec.exec(&argv(["true"])).await.unwrap();
        assert!(other.success());

        assert_eq!(exec.commands(), vec!["ip route show", "nft list tables", "true"]);
        assert!(exec.ran("true"));
    }

    #[tokio::test]
    async fn test_timeout_simulation() {
        let exec = FixtureExecutor::new().time_out("netplan apply");
        let err = exec.exec(&argv(["netplan", "apply"])).await.unwrap_err();
        assert!(matches!(err, NetCfgError::CommandTimeout { .. }));
    }

    #[test]
    fn test_tools_and_paths() {
        let exec = FixtureExecutor::new()
            .with_tool("dnsmasq")
            .with_path("/etc/netplan");
        assert_eq!(
            exec.resolve_tool("dnsmasq"),
            Some(PathBuf::from("/usr/sbin/dnsmasq"))
        );
        assert!(exec.resolve_tool("dhcpd").is_none());
        assert!(exec.path_exists(Path::new("/etc/netplan")));
        assert!(!exec.path_exists(Path::new("/etc/network/interfaces")));
    }
}
