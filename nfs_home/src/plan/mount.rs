// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use super::Layout;
use crate::config::ClientMount;
use crate::role::RoleConfig;

pub const AUTOFS_MASTER_FILE: &str = "/etc/auto.master.d/home.autofs";
pub const AUTOFS_MAP_FILE: &str = "/etc/autofs/home.map";

/// Exposes the physical home store below the NFSv4 pseudo root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub mount_point: PathBuf,
    pub device: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
    /// Apply option changes with a remount rather than an unmount/mount cycle.
    pub remount_on_change: bool,
}

/// The client side: the remote home directories mounted on `mount_point`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMount {
    pub mount_point: PathBuf,
    pub remote_device: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub use_autofs: bool,
    /// Set iff `use_autofs`.
    pub autofs_map_entry: Option<AutofsMapEntry>,
}

/// An indirect automount map with a single wildcard key: `/home/<user>` is mounted from
/// `<server>:<remote path>/<user>` on first access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutofsMapEntry {
    pub master_file: PathBuf,
    pub map_file: PathBuf,
    pub key: String,
    pub options: Vec<String>,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountDefinition {
    Bind(BindMount),
    Remote(RemoteMount),
}

impl MountDefinition {
    pub fn mount_point(&self) -> &Path {
        match self {
            Self::Bind(bind) => &bind.mount_point,
            Self::Remote(remote) => &remote.mount_point,
        }
    }
}

impl AutofsMapEntry {
    /// The line registering the map with the automounter.
    pub fn master_line(&self, mount_point: &Path) -> String {
        format!("{} {}", mount_point.display(), self.map_file.display())
    }

    pub fn map_line(&self) -> String {
        format!("{} -{} {}", self.key, self.options.join(","), self.location)
    }
}

/// The server-side bind mount when exporting, the client mount when mounting. A host doing both
/// gets both.
pub fn plan(
    role: &RoleConfig,
    layout: &Layout,
    client: &ClientMount,
) -> (Option<BindMount>, Option<RemoteMount>) {
    let bind = role.export_home.then(|| BindMount {
        mount_point: layout.exported_home(),
        device: layout.home_store(),
        fs_type: "none".to_string(),
        options: vec!["rw".to_string(), "bind".to_string()],
        remount_on_change: true,
    });

    let remote = match (&role.nfs_server, role.mount_home) {
        (Some(server), true) => Some(remote_mount(server, role.use_autofs, client)),
        _ => None,
    };

    (bind, remote)
}

fn remote_mount(server: &str, use_autofs: bool, client: &ClientMount) -> RemoteMount {
    // An IPv6 address must be bracketed to be told apart from the path.
    let server = match server.parse::<Ipv6Addr>() {
        Ok(_) => format!("[{server}]"),
        Err(_) => server.to_string(),
    };
    let remote_path = client.remote_path.display().to_string();
    let remote_path = remote_path.trim_end_matches('/');
    let remote_root = if remote_path.is_empty() { "/" } else { remote_path };

    let mut options = vec![format!("port={}", client.port), format!("sec={}", client.sec)];
    options.extend(client.options.iter().cloned());

    let autofs_map_entry = use_autofs.then(|| {
        let mut map_options = vec!["fstype=nfs4".to_string()];
        map_options.extend(options.iter().cloned());
        AutofsMapEntry {
            master_file: PathBuf::from(AUTOFS_MASTER_FILE),
            map_file: PathBuf::from(AUTOFS_MAP_FILE),
            key: "*".to_string(),
            options: map_options,
            location: format!("{server}:{remote_path}/&"),
        }
    });

    RemoteMount {
        mount_point: client.local_home.clone(),
        remote_device: format!("{server}:{remote_root}"),
        fs_type: "nfs4".to_string(),
        options,
        use_autofs,
        autofs_map_entry,
    }
}

impl fmt::Display for MountDefinition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bind(bind) => write!(
                f,
                "bind mount {} on {} ({})",
                bind.device.display(),
                bind.mount_point.display(),
                bind.options.join(",")
            ),
            Self::Remote(RemoteMount {
                mount_point,
                autofs_map_entry: Some(entry),
                ..
            }) => write!(
                f,
                "automount {} in {}: {}",
                mount_point.display(),
                entry.map_file.display(),
                entry.map_line()
            ),
            Self::Remote(remote) => write!(
                f,
                "mount {} on {} type {} ({})",
                remote.remote_device,
                remote.mount_point.display(),
                remote.fs_type,
                remote.options.join(",")
            ),
        }
    }
}
