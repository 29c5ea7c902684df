//! Sandboxed host for driving every manager against one fixture executor.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tracing::debug;

use sbc_dhcpmgr::DhcpMgr;
use sbc_fwmgr::FwMgr;
use sbc_intfmgr::IntfMgr;
use sbc_netcfg_common::shell::ExecResult;
use sbc_netcfg_common::{
    Applier, Detector, FixtureExecutor, HostExecutor, IntentStore, NetCfgResult, Settings,
};
use sbc_routemgr::RouteMgr;

/// Builds a [`TestHost`] with the tools and files a real router would have.
///
/// Nothing is installed by default: no interface backend, no firewall tool
/// and no DHCP server. DHCP daemons are never reported as running.
pub struct HostBuilder {
    root: TempDir,
    settings: Settings,
    exec: FixtureExecutor,
}

impl HostBuilder {
    pub fn new() -> std::io::Result<Self> {
        let root = tempfile::tempdir()?;
        let settings = Settings::rooted_at(root.path());
        let exec = FixtureExecutor::new()
            .fail("pgrep -x dnsmasq", 1, "")
            .fail("pgrep -x dhcpd", 1, "")
            .fail("pgrep -x dhcrelay", 1, "");
        Ok(Self {
            root,
            settings,
            exec,
        })
    }

    /// netplan CLI on PATH and its directory present.
    pub fn netplan(mut self) -> Self {
        self.exec = self
            .exec
            .with_tool("netplan")
            .with_path(&self.settings.paths.netplan_dir);
        self
    }

    /// Only `/etc/network/interfaces` present.
    pub fn ifupdown(mut self) -> Self {
        self.exec = self.exec.with_path(&self.settings.paths.interfaces_file);
        self
    }

    /// A working `nft`.
    pub fn nftables(mut self) -> Self {
        self.exec = self
            .exec
            .with_tool("nft")
            .respond("nft list tables", ExecResult::ok("table ip filter"));
        self
    }

    /// `nft` installed but the kernel lacks nf_tables.
    pub fn broken_nftables(mut self) -> Self {
        self.exec = self
            .exec
            .with_tool("nft")
            .fail("nft list tables", 1, "Error: Could not process rule: Operation not supported");
        self
    }

    pub fn iptables(mut self) -> Self {
        self.exec = self.exec.with_tool("iptables");
        self
    }

    pub fn dnsmasq(mut self) -> Self {
        self.exec = self.exec.with_tool("dnsmasq");
        self
    }

    pub fn isc_dhcp(mut self) -> Self {
        self.exec = self.exec.with_tool("dhcpd");
        self
    }

    /// Answers `command` with `stdout`.
    pub fn respond(mut self, command: &str, stdout: &str) -> Self {
        self.exec = self.exec.respond(command, ExecResult::ok(stdout));
        self
    }

    pub fn fail(mut self, command: &str, exit_code: i32, stderr: &str) -> Self {
        self.exec = self.exec.fail(command, exit_code, stderr);
        self
    }

    pub fn build(self) -> NetCfgResult<TestHost> {
        let settings = Arc::new(self.settings);
        let exec = Arc::new(self.exec);
        let dyn_exec: Arc<dyn HostExecutor> = exec.clone();
        let store = Arc::new(IntentStore::open_in_memory()?);
        let detector = Arc::new(Detector::new(dyn_exec.clone(), settings.clone()));
        let applier = Arc::new(Applier::new(dyn_exec.clone()));

        debug!("Test host rooted at {}", self.root.path().display());
        Ok(TestHost {
            intf: IntfMgr::new(
                store.clone(),
                dyn_exec.clone(),
                settings.clone(),
                detector.clone(),
                applier.clone(),
            ),
            fw: FwMgr::new(
                store.clone(),
                dyn_exec.clone(),
                settings.clone(),
                detector.clone(),
                applier.clone(),
            ),
            dhcp: DhcpMgr::new(
                store.clone(),
                dyn_exec.clone(),
                settings.clone(),
                detector.clone(),
                applier.clone(),
            ),
            routes: RouteMgr::new(
                store.clone(),
                dyn_exec,
                settings.clone(),
                detector.clone(),
                applier,
            ),
            _root: self.root,
            exec,
            store,
            settings,
            detector,
        })
    }
}

/// Every manager sharing one store, executor and detector, rooted in a temp dir.
pub struct TestHost {
    _root: TempDir,
    pub exec: Arc<FixtureExecutor>,
    pub store: Arc<IntentStore>,
    pub settings: Arc<Settings>,
    pub detector: Arc<Detector>,
    pub intf: IntfMgr,
    pub fw: FwMgr,
    pub dhcp: DhcpMgr,
    pub routes: RouteMgr,
}

impl TestHost {
    /// Contents of a host file, empty when it does not exist.
    pub fn read(&self, path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    /// Writes a host file, creating parent directories.
    pub fn write(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    /// Reports `name` as running from now on.
    pub fn start_process(&self, name: &str) {
        self.exec
            .set_response(&format!("pgrep -x {}", name), ExecResult::ok("1234"));
    }
}
