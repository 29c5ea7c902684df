//! Shared plumbing for the RouterSBC network configuration engine.
//!
//! Every subsystem manager (interfaces, firewall, DHCP, routing) builds on
//! the pieces in this crate:
//!
//! - [`shell`]: the [`HostExecutor`] capability and argv helpers
//! - [`error`]: the [`NetCfgError`] taxonomy
//! - [`settings`]: YAML settings with environment overrides
//! - [`model`]: canonical intent records
//! - [`store`]: the SQLite [`IntentStore`]
//! - [`detect`]: per-subsystem backend [`Detector`]
//! - [`apply`]: atomic artifact installation via the [`Applier`]
//! - [`backend`]: the [`Backend`] parser/synthesizer capability
//! - [`fixture`]: a recording [`HostExecutor`] for deterministic tests
//!
//! # Architecture
//!
//! An operation follows the same path in every manager:
//!
//! 1. Validate the intent and persist it to the store
//! 2. Ask the detector which backend is active
//! 3. Synthesize the backend's artifact from the full intent set
//! 4. Hand the artifact to the applier (write, validate, reload)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sbc_netcfg_common::{Applier, Detector, IntentStore, Settings, SystemExecutor};
//!
//! let settings = Arc::new(Settings::load()?);
//! let exec = Arc::new(SystemExecutor::new(settings.command_timeout()));
//! let store = Arc::new(IntentStore::open(&settings.database.path)?);
//! let detector = Arc::new(Detector::new(exec.clone(), settings.clone()));
//! let applier = Arc::new(Applier::new(exec.clone()));
//! ```

pub mod apply;
pub mod backend;
pub mod detect;
pub mod error;
pub mod fixture;
pub mod model;
pub mod settings;
pub mod shell;
pub mod store;

// Re-export commonly used items at crate root
pub use apply::{Applied, Applier, Artifact, ArtifactFile};
pub use backend::{Backend, ParseOutcome};
pub use detect::{
    BackendSelection, Detector, DhcpBackendKind, FirewallBackendKind, InterfaceBackendKind,
};
pub use error::{NetCfgError, NetCfgResult};
pub use fixture::FixtureExecutor;
pub use settings::Settings;
pub use shell::{ExecResult, HostExecutor, SystemExecutor};
pub use store::IntentStore;
