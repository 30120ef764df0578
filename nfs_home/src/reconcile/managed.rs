// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use exports::ClientId;
use serde::{Deserialize, Serialize};

/// The clients this tool granted on each export path. Clients of those paths that are not
/// recorded here were added by someone else and are left alone.
///
/// ```toml
/// [exports]
/// "/var/nfs/exports" = ["10.0.0.0/8"]
/// "/var/nfs/exports/home" = ["10.0.0.0/8"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagedExports {
    exports: BTreeMap<String, Vec<String>>,
}

impl ManagedExports {
    pub fn parse(source: &str) -> io::Result<Self> {
        toml::from_str(source).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn to_toml(&self) -> io::Result<String> {
        toml::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.exports.keys().map(PathBuf::from).collect()
    }

    /// The recorded clients of `path`, none if it was never recorded.
    pub fn clients(&self, path: &Path) -> io::Result<Vec<ClientId>> {
        let Some(clients) = self.exports.get(&key(path)) else {
            return Ok(Vec::new());
        };
        clients
            .iter()
            .map(|client| {
                ClientId::parse(client).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            })
            .collect()
    }

    pub fn record(&mut self, path: &Path, clients: &[ClientId]) {
        self.exports
            .insert(key(path), clients.iter().map(ToString::to_string).collect());
    }

    pub fn forget(&mut self, path: &Path) {
        self.exports.remove(&key(path));
    }
}

fn key(path: &Path) -> String {
    path.display().to_string()
}
