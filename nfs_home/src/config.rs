// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The intent parameters, as read from a TOML file. Every parameter may be omitted.
//!
//! ```toml
//! export_home_dirs = true
//! home_dir_server = "10.0.0.5"
//! trusted_nets = ["10.0.0.0/255.255.0.0"]
//!
//! [client]
//! local_home = "/home"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

pub const DEFAULT_HOME_DIR_ROOT: &str = "/var/nfs";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Intent {
    /// Export the home directories from this host.
    pub export_home_dirs: bool,

    /// The server to mount home directories from. Empty means "do not mount".
    pub home_dir_server: Option<String>,

    /// Mount through the loopback address when `home_dir_server` is this host.
    pub autodetect_remote: bool,

    /// Mount through an automount map rather than the mount table.
    pub use_autofs: bool,

    /// Clients allowed to mount the exports.
    pub trusted_nets: Vec<String>,

    /// NFS traffic is wrapped in an encrypted tunnel, so exports accept unprivileged ports.
    pub tunnel_secured: bool,

    /// Holds the NFSv4 pseudo root (`exports`) and the physical home store (`home`).
    pub home_dir_root: PathBuf,

    /// Security flavors of the exports.
    pub sec: Vec<String>,

    pub is_server: Option<bool>,
    pub is_client: Option<bool>,
    pub mount_home_dirs: Option<bool>,

    pub client: ClientMount,
}

/// How a client mounts the remote home directories.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientMount {
    pub local_home: PathBuf,
    /// Path below the server's NFSv4 pseudo root.
    pub remote_path: PathBuf,
    pub port: u16,
    pub sec: String,
    pub options: Vec<String>,
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            export_home_dirs: false,
            home_dir_server: None,
            autodetect_remote: true,
            use_autofs: true,
            trusted_nets: vec!["127.0.0.1".to_string()],
            tunnel_secured: false,
            home_dir_root: PathBuf::from(DEFAULT_HOME_DIR_ROOT),
            sec: vec!["sys".to_string()],
            is_server: None,
            is_client: None,
            mount_home_dirs: None,
            client: ClientMount::default(),
        }
    }
}

impl Default for ClientMount {
    fn default() -> Self {
        Self {
            local_home: PathBuf::from("/home"),
            remote_path: PathBuf::from("/home"),
            port: 2049,
            sec: "sys".to_string(),
            options: vec!["soft".to_string()],
        }
    }
}

impl Intent {
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&source).map_err(|e| match e {
            Error::Config(e) => Error::Config(format!("{}: {e}", path.display())),
            e => e,
        })
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let intent: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;

        if !intent.home_dir_root.is_absolute() {
            return Err(Error::Config(format!(
                "home_dir_root '{}' must be an absolute path",
                intent.home_dir_root.display()
            )));
        }
        if !intent.client.local_home.is_absolute() || !intent.client.remote_path.is_absolute() {
            return Err(Error::Config(
                "client.local_home and client.remote_path must be absolute paths".to_string(),
            ));
        }

        Ok(intent)
    }
}
