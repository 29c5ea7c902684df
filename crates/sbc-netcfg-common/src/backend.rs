//! Backend capability shared by every subsystem.
//!
//! Each subsystem (interfaces, firewall, DHCP) has a tagged enum of
//! concrete backends that implements [`Backend`] by dispatching to the
//! variant the [`Detector`](crate::detect::Detector) selected. Orchestrators
//! only ever talk to the trait.

use async_trait::async_trait;

use crate::apply::Artifact;
use crate::error::NetCfgResult;
use crate::shell::HostExecutor;

/// Records recovered from native state plus anything that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome<T> {
    pub records: T,
    pub warnings: Vec<String>,
}

impl<T> ParseOutcome<T> {
    pub fn new(records: T) -> Self {
        Self {
            records,
            warnings: Vec::new(),
        }
    }

    /// Records a skipped or unrecognized input.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseOutcome<U> {
        ParseOutcome {
            records: f(self.records),
            warnings: self.warnings,
        }
    }

    /// Logs every warning against the source it came from.
    pub fn log_warnings(&self, source: &str) {
        for warning in &self.warnings {
            tracing::warn!(source = %source, "{}", warning);
        }
    }
}

impl<T: Default> Default for ParseOutcome<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Parser and synthesizer pair for one native configuration format.
///
/// # Example
///
/// ```ignore
/// let backend = FirewallBackend::for_kind(kind, settings);
/// let live = backend.read_live(exec.as_ref()).await?;
/// let artifact = backend.synthesize(&rules)?;
/// applier.apply(&artifact).await?;
/// ```
#[async_trait]
pub trait Backend: Send + Sync {
    /// Declared configuration this backend renders.
    type Intent: Send + Sync;

    /// What the parser recovers from native state.
    type State: Send;

    /// Identifier of the concrete backend.
    type Kind: Copy + std::fmt::Display + Send;

    fn kind(&self) -> Self::Kind;

    /// Parses native text leniently.
    ///
    /// Unrecognized lines become warnings; only input that is unusable as a
    /// whole yields [`NetCfgError::ParseFailure`](crate::error::NetCfgError::ParseFailure).
    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<Self::State>>;

    /// Reads and parses the currently active native state.
    async fn read_live(&self, exec: &dyn HostExecutor) -> NetCfgResult<ParseOutcome<Self::State>>;

    /// Renders intent into files and activation commands.
    ///
    /// Identical intent always yields byte-identical files.
    fn synthesize(&self, intent: &Self::Intent) -> NetCfgResult<Artifact>;
}

/// Reads a native config file, treating a missing file as empty.
pub async fn read_native_file(path: &std::path::Path) -> NetCfgResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("{} does not exist, treating as empty", path.display());
            Ok(String::new())
        }
        Err(e) => Err(crate::error::NetCfgError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcome_map_keeps_warnings() {
        let mut outcome = ParseOutcome::new(vec![1, 2, 3]);
        outcome.warn("line 4: unrecognized directive");
        let mapped = outcome.map(|v| v.len());
        assert_eq!(mapped.records, 3);
        assert_eq!(mapped.warnings, vec!["line 4: unrecognized directive"]);
    }

    #[tokio::test]
    async fn test_read_missing_native_file() {
        let text = read_native_file(std::path::Path::new("/nonexistent/dnsmasq.conf"))
            .await
            .unwrap();
        assert!(text.is_empty());
    }
}
