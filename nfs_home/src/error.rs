// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// The possible errors from resolving an intent into a plan, or from applying that plan.
#[derive(Debug)]
pub enum Error {
    /// A trusted network used a netmask that has no prefix length.
    InvalidNetmask(String),

    /// A trusted network whose address or prefix length is unusable.
    InvalidNetwork(String),

    /// The intent asks for mutually exclusive things. Raised before anything is touched.
    InconsistentRole(String),

    /// A directory of the plan is occupied by something that is not a directory.
    PathConflict(PathBuf),

    /// Applying one resource failed at the OS level. Other resources are unaffected.
    ReconciliationFailure {
        resource: String,
        source: std::io::Error,
    },

    /// Another reconciliation holds the lock, or changed a managed file during this pass.
    ConcurrentReconciliation(PathBuf),

    /// The existing exports table cannot be read, so it is left alone.
    ExportTable(exports::Error),

    Config(String),

    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReconciliationFailure { source, .. } => Some(source),
            Self::ExportTable(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidNetmask(spec) => write!(f, "Invalid netmask in trusted network '{spec}'"),
            Self::InvalidNetwork(spec) => write!(f, "Invalid trusted network '{spec}'"),
            Self::InconsistentRole(reason) => write!(f, "Inconsistent role: {reason}"),
            Self::PathConflict(path) => {
                write!(f, "{} exists and is not a directory", path.display())
            }
            Self::ReconciliationFailure { resource, source } => {
                write!(f, "Failed to apply {resource}: {source}")
            }
            Self::ConcurrentReconciliation(path) => write!(
                f,
                "Concurrent reconciliation detected on {}",
                path.display()
            ),
            Self::ExportTable(e) => write!(f, "Unreadable exports table: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Io(e.into())
    }
}

impl From<exports::Error> for Error {
    fn from(e: exports::Error) -> Self {
        match e {
            exports::Error::InvalidNetmask(spec) => Self::InvalidNetmask(spec),
            exports::Error::InvalidNetwork(spec) => Self::InvalidNetwork(spec),
            e @ exports::Error::Parse { .. } => Self::ExportTable(e),
        }
    }
}
