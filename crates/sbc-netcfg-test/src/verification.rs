//! Verification helpers for testing configuration managers
//!
//! Provides assertion helpers to verify rendered host files and the commands
//! the managers ran.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::TestHost;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected file '{path}' does not exist")]
    FileMissing { path: PathBuf },

    #[error("Expected '{needle}' in '{path}', contents:\n{contents}")]
    TextMissing {
        path: PathBuf,
        needle: String,
        contents: String,
    },

    #[error("Unexpected '{needle}' in '{path}'")]
    TextPresent { path: PathBuf, needle: String },

    #[error("Expected command '{command}' to run, ran: {ran:?}")]
    CommandNotRun { command: String, ran: Vec<String> },

    #[error("Command '{command}' was not expected to run")]
    CommandRan { command: String },

    #[error("Expected '{first}' to run before '{second}', ran: {ran:?}")]
    OrderMismatch {
        first: String,
        second: String,
        ran: Vec<String>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Host state verification helper
pub struct HostVerifier<'a> {
    host: &'a TestHost,
}

impl<'a> HostVerifier<'a> {
    pub fn new(host: &'a TestHost) -> Self {
        Self { host }
    }

    fn contents(&self, path: &Path) -> VerifyResult<String> {
        std::fs::read_to_string(path).map_err(|_| VerificationError::FileMissing {
            path: path.to_path_buf(),
        })
    }

    /// Verify that a file contains every needle
    pub fn assert_file_contains(&self, path: &Path, needles: &[&str]) -> VerifyResult<()> {
        let contents = self.contents(path)?;
        for needle in needles {
            if !contents.contains(needle) {
                return Err(VerificationError::TextMissing {
                    path: path.to_path_buf(),
                    needle: needle.to_string(),
                    contents,
                });
            }
        }
        Ok(())
    }

    /// Verify that a file, if it exists, contains none of the needles
    pub fn assert_file_lacks(&self, path: &Path, needles: &[&str]) -> VerifyResult<()> {
        let contents = self.host.read(path);
        match needles.iter().find(|n| contents.contains(*n)) {
            Some(needle) => Err(VerificationError::TextPresent {
                path: path.to_path_buf(),
                needle: needle.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn assert_ran(&self, command: &str) -> VerifyResult<()> {
        if self.host.exec.ran(command) {
            return Ok(());
        }
        Err(VerificationError::CommandNotRun {
            command: command.to_string(),
            ran: self.host.exec.commands(),
        })
    }

    pub fn assert_not_ran(&self, command: &str) -> VerifyResult<()> {
        if self.host.exec.ran(command) {
            return Err(VerificationError::CommandRan {
                command: command.to_string(),
            });
        }
        Ok(())
    }

    /// Verify that the first run of `first` precedes the first run of `second`
    pub fn assert_ran_before(&self, first: &str, second: &str) -> VerifyResult<()> {
        let ran = self.host.exec.commands();
        let find = |cmd: &str| ran.iter().position(|c| c == cmd);
        match (find(first), find(second)) {
            (Some(a), Some(b)) if a < b => Ok(()),
            _ => Err(VerificationError::OrderMismatch {
                first: first.to_string(),
                second: second.to_string(),
                ran,
            }),
        }
    }
}
