//! Artifact application.
//!
//! An [`Artifact`] is everything a synthesizer produces for one backend: the
//! files to install, the command that validates them and the commands that
//! make the running service pick them up. The [`Applier`] installs files
//! atomically (temp file in the same directory, then rename) and serializes
//! writers per path.
//!
//! A failed validate or reload leaves the new file on disk; there is no
//! rollback.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::error::{NetCfgError, NetCfgResult};
use crate::shell::{command_line, HostExecutor};

/// Default mode for newly created config files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// One file to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub contents: String,
    /// Permission bits; `None` keeps the existing file's mode (or 0644).
    pub mode: Option<u32>,
}

/// Files plus the commands that validate and activate them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    /// Backend name for logs.
    pub backend: String,
    pub files: Vec<ArtifactFile>,
    /// Run in order after writing; every one must succeed.
    pub validate: Vec<Vec<String>>,
    /// Alternatives tried in order; the first success wins.
    pub reload: Vec<Vec<String>>,
    /// Run after reload; failures are logged, not returned.
    pub post: Vec<Vec<String>>,
    /// Non-fatal notes produced while rendering.
    pub warnings: Vec<String>,
}

impl Artifact {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push(ArtifactFile {
            path: path.into(),
            contents: contents.into(),
            mode: None,
        });
        self
    }

    pub fn with_private_file(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push(ArtifactFile {
            path: path.into(),
            contents: contents.into(),
            mode: Some(0o600),
        });
        self
    }

    pub fn validate_with(mut self, argv: Vec<String>) -> Self {
        self.validate.push(argv);
        self
    }

    pub fn reload_with(mut self, argv: Vec<String>) -> Self {
        self.reload.push(argv);
        self
    }

    pub fn then_run(mut self, argv: Vec<String>) -> Self {
        self.post.push(argv);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Contents of the file written to `path`, if any.
    pub fn file(&self, path: &Path) -> Option<&str> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.contents.as_str())
    }

    fn primary_path(&self) -> PathBuf {
        self.files
            .first()
            .map(|f| f.path.clone())
            .unwrap_or_default()
    }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub backend: String,
    pub paths: Vec<PathBuf>,
    /// True if any file's bytes differ from what was on disk before.
    pub changed: bool,
}

/// Installs artifacts and runs their activation commands.
pub struct Applier {
    exec: Arc<dyn HostExecutor>,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Applier {
    pub fn new(exec: Arc<dyn HostExecutor>) -> Self {
        Self {
            exec,
            locks: DashMap::new(),
        }
    }

    /// Locks every target path in sorted order so overlapping applies can't deadlock.
    async fn lock_paths(&self, artifact: &Artifact) -> Vec<OwnedMutexGuard<()>> {
        let mut paths: Vec<&PathBuf> = artifact.files.iter().map(|f| &f.path).collect();
        paths.sort();
        paths.dedup();

        let mut guards = Vec::with_capacity(paths.len());
        for path in paths {
            let lock = self.locks.entry(path.clone()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    #[instrument(skip(self, artifact), fields(backend = %artifact.backend))]
    pub async fn apply(&self, artifact: &Artifact) -> NetCfgResult<Applied> {
        let _guards = self.lock_paths(artifact).await;

        for warning in &artifact.warnings {
            warn!("{}", warning);
        }

        let mut changed = false;
        for file in &artifact.files {
            let path = file.path.clone();
            let contents = file.contents.clone();
            let mode = file.mode;
            let wrote = tokio::task::spawn_blocking(move || write_atomic(&path, &contents, mode))
                .await
                .map_err(|e| NetCfgError::io(&file.path, std::io::Error::other(e)))??;
            if wrote {
                info!("Wrote {}", file.path.display());
            } else {
                debug!("{} unchanged", file.path.display());
            }
            changed |= wrote;
        }

        for argv in &artifact.validate {
            let result = self.exec.exec(argv).await?;
            if !result.success() {
                return Err(NetCfgError::ApplyFailed {
                    artifact: artifact.primary_path(),
                    command: command_line(argv),
                    exit_code: result.exit_code,
                    stderr: result.combined_output(),
                });
            }
        }

        self.reload(artifact).await?;

        for argv in &artifact.post {
            match self.exec.exec(argv).await {
                Ok(result) if result.success() => {}
                Ok(result) => warn!(
                    "'{}' exited {}: {}",
                    command_line(argv),
                    result.exit_code,
                    result.combined_output()
                ),
                Err(e) => warn!("'{}' failed: {}", command_line(argv), e),
            }
        }

        Ok(Applied {
            backend: artifact.backend.clone(),
            paths: artifact.files.iter().map(|f| f.path.clone()).collect(),
            changed,
        })
    }

    async fn reload(&self, artifact: &Artifact) -> NetCfgResult<()> {
        let mut last_failure = None;
        for argv in &artifact.reload {
            match self.exec.exec(argv).await {
                Ok(result) if result.success() => {
                    info!("Reloaded {} via '{}'", artifact.backend, command_line(argv));
                    return Ok(());
                }
                Ok(result) => {
                    debug!("Reload alternative '{}' failed", command_line(argv));
                    last_failure = Some(NetCfgError::ApplyFailed {
                        artifact: artifact.primary_path(),
                        command: command_line(argv),
                        exit_code: result.exit_code,
                        stderr: result.combined_output(),
                    });
                }
                Err(NetCfgError::CommandSpawn { command, source }) => {
                    debug!("Reload alternative '{}' could not start: {}", command, source);
                    last_failure = Some(NetCfgError::ApplyFailed {
                        artifact: artifact.primary_path(),
                        command,
                        exit_code: -1,
                        stderr: source.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        match last_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Writes `contents` to `path` via a sibling temp file and rename.
///
/// Returns false without touching the file when the bytes are already there.
fn write_atomic(path: &Path, contents: &str, mode: Option<u32>) -> NetCfgResult<bool> {
    let existing = std::fs::read(path).ok();
    if existing.as_deref() == Some(contents.as_bytes()) {
        return Ok(false);
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| NetCfgError::io(dir, e))?;

    let mode = match mode {
        Some(m) => m,
        None => std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(DEFAULT_FILE_MODE),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| NetCfgError::io(dir, e))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| NetCfgError::io(tmp.path(), e))?;
    std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
        .map_err(|e| NetCfgError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| NetCfgError::io(path, e.error))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{argv, ExecResult};
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingHost {
        failures: HashMap<String, ExecResult>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostExecutor for RecordingHost {
        async fn exec(&self, argv: &[String]) -> NetCfgResult<ExecResult> {
            let line = argv.join(" ");
            self.calls.lock().unwrap().push(line.clone());
            Ok(self
                .failures
                .get(&line)
                .cloned()
                .unwrap_or_else(|| ExecResult::ok("")))
        }

        fn resolve_tool(&self, _tool: &str) -> Option<PathBuf> {
            None
        }

        fn path_exists(&self, path: &Path) -> bool {
            path.exists()
        }
    }

    fn applier(host: RecordingHost) -> (Arc<RecordingHost>, Applier) {
        let host = Arc::new(host);
        (host.clone(), Applier::new(host))
    }

    #[tokio::test]
    async fn test_apply_writes_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("dnsmasq.conf");
        let (host, applier) = applier(RecordingHost::default());

        let artifact = Artifact::new("dnsmasq")
            .with_file(&path, "dhcp-range=192.168.1.100,192.168.1.200,24h\n")
            .validate_with(argv(["dnsmasq", "--test"]))
            .reload_with(argv(["systemctl", "restart", "dnsmasq"]));

        let applied = applier.apply(&artifact).await.unwrap();
        assert!(applied.changed);
        assert_eq!(applied.paths, vec![path.clone()]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "dhcp-range=192.168.1.100,192.168.1.200,24h\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert_eq!(
            *host.calls.lock().unwrap(),
            vec!["dnsmasq --test", "systemctl restart dnsmasq"]
        );
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent_but_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interfaces");
        let (host, applier) = applier(RecordingHost::default());
        let artifact = Artifact::new("ifupdown")
            .with_file(&path, "auto lo\niface lo inet loopback\n")
            .reload_with(argv(["systemctl", "restart", "networking"]));

        let first = applier.apply(&artifact).await.unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let second = applier.apply(&artifact).await.unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert_eq!(host.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validate_failure_carries_stderr_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd.conf");
        let mut host = RecordingHost::default();
        host.failures.insert(
            "dhcpd -t".to_string(),
            ExecResult::failed(1, "/etc/dhcp/dhcpd.conf line 3: semicolon expected."),
        );
        let (host, applier) = applier(host);

        let artifact = Artifact::new("isc-dhcp-server")
            .with_file(&path, "subnet 192.168.1.0 netmask 255.255.255.0 {\n")
            .validate_with(argv(["dhcpd", "-t"]))
            .reload_with(argv(["systemctl", "restart", "isc-dhcp-server"]));

        match applier.apply(&artifact).await {
            Err(NetCfgError::ApplyFailed {
                artifact,
                command,
                exit_code,
                stderr,
            }) => {
                assert_eq!(artifact, path);
                assert_eq!(command, "dhcpd -t");
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "/etc/dhcp/dhcpd.conf line 3: semicolon expected.");
            }
            other => panic!("Expected ApplyFailed, got {:?}", other),
        }
        assert!(path.exists());
        assert_eq!(*host.calls.lock().unwrap(), vec!["dhcpd -t"]);
    }

    #[tokio::test]
    async fn test_reload_falls_back_to_next_alternative() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = RecordingHost::default();
        host.failures.insert(
            "systemctl restart networking".to_string(),
            ExecResult::failed(1, "System has not been booted with systemd"),
        );
        let (host, applier) = applier(host);
        let artifact = Artifact::new("ifupdown")
            .with_file(dir.path().join("interfaces"), "auto lo\n")
            .reload_with(argv(["systemctl", "restart", "networking"]))
            .reload_with(argv(["service", "networking", "restart"]));

        applier.apply(&artifact).await.unwrap();
        assert_eq!(
            *host.calls.lock().unwrap(),
            vec!["systemctl restart networking", "service networking restart"]
        );
    }

    #[tokio::test]
    async fn test_all_reloads_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = RecordingHost::default();
        host.failures
            .insert("a".to_string(), ExecResult::failed(1, "first"));
        host.failures
            .insert("b".to_string(), ExecResult::failed(3, "second"));
        let (_, applier) = applier(host);
        let artifact = Artifact::new("x")
            .with_file(dir.path().join("f"), "x")
            .reload_with(argv(["a"]))
            .reload_with(argv(["b"]));

        match applier.apply(&artifact).await {
            Err(NetCfgError::ApplyFailed { exit_code, stderr, .. }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "second");
            }
            other => panic!("Expected ApplyFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_failures_are_not_fatal() {
        let mut host = RecordingHost::default();
        host.failures.insert(
            "systemctl stop dnsmasq".to_string(),
            ExecResult::failed(5, "Unit dnsmasq.service not loaded."),
        );
        let (host, applier) = applier(host);
        let artifact = Artifact::new("disabled")
            .then_run(argv(["systemctl", "stop", "dnsmasq"]))
            .then_run(argv(["systemctl", "stop", "isc-dhcp-server"]));
        let applied = applier.apply(&artifact).await.unwrap();
        assert!(!applied.changed);
        assert_eq!(host.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_applies_to_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.v4");
        let (_, applier) = applier(RecordingHost::default());
        let applier = Arc::new(applier);

        let mut handles = Vec::new();
        for i in 0..8 {
            let applier = applier.clone();
            let artifact = Artifact::new("iptables").with_file(&path, format!("rev {}\n", i));
            handles.push(tokio::spawn(async move { applier.apply(&artifact).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("rev "));
        // No stray temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_private_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01-router-sbc.yaml");
        write_atomic(&path, "network: {}\n", Some(0o600)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
