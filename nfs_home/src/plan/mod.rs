// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Planning turns an intent into the resources that should exist. It is pure: nothing here looks
//! at or touches the host.

pub mod export;
pub mod mount;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Intent;
use crate::role::{self, HostFacts, RoleConfig};
use crate::Result;

pub use export::ExportDefinition;
pub use mount::{AutofsMapEntry, BindMount, MountDefinition, RemoteMount};

/// Where the server side of the service lives below the home-directory root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The NFSv4 pseudo root.
    pub fn exports_root(&self) -> PathBuf {
        self.root.join("exports")
    }

    /// Where the home store is bind mounted below the pseudo root.
    pub fn exported_home(&self) -> PathBuf {
        self.exports_root().join("home")
    }

    /// The physical home-directory store.
    pub fn home_store(&self) -> PathBuf {
        self.root.join("home")
    }
}

/// A directory that must exist, with fixed ownership and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySpec {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl DirectorySpec {
    /// `root:root 0755`
    pub fn system(path: PathBuf) -> Self {
        Self {
            path,
            uid: 0,
            gid: 0,
            mode: 0o755,
        }
    }
}

/// Everything that should exist for an intent, in the order it has to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub role: RoleConfig,
    pub directories: Vec<DirectorySpec>,
    pub exports: Vec<ExportDefinition>,
    pub mounts: Vec<MountDefinition>,
}

pub fn build(intent: &Intent, facts: &HostFacts) -> Result<Plan> {
    let role = role::resolve(intent, facts)?;
    let trusted_nets = exports::normalize(&intent.trusted_nets)?;
    let layout = Layout::new(&intent.home_dir_root);

    let directories = directories(&role, &layout);
    let exports = export::plan(
        &role,
        &layout,
        &trusted_nets,
        &intent.sec,
        intent.tunnel_secured,
    );

    let (bind, remote) = mount::plan(&role, &layout, &intent.client);
    let mounts = bind
        .map(MountDefinition::Bind)
        .into_iter()
        .chain(remote.map(MountDefinition::Remote))
        .collect();

    Ok(Plan {
        role,
        directories,
        exports,
        mounts,
    })
}

/// The server-side tree, parents first.
pub fn directories(role: &RoleConfig, layout: &Layout) -> Vec<DirectorySpec> {
    if !role.export_home {
        return Vec::new();
    }

    [
        layout.root().to_path_buf(),
        layout.exports_root(),
        layout.exported_home(),
        layout.home_store(),
    ]
    .into_iter()
    .map(DirectorySpec::system)
    .collect()
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let role = &self.role;
        writeln!(
            f,
            "role: server={} client={} export_home={} mount_home={}",
            role.is_server, role.is_client, role.export_home, role.mount_home
        )?;
        if let Some(server) = &role.nfs_server {
            writeln!(f, "home directory server: {server}")?;
        }

        for dir in &self.directories {
            writeln!(
                f,
                "directory {} {}:{} {:o}",
                dir.path.display(),
                dir.uid,
                dir.gid,
                dir.mode
            )?;
        }
        for export in &self.exports {
            writeln!(f, "export {}: {}", export.name, export.to_export())?;
        }
        for mount in &self.mounts {
            writeln!(f, "{mount}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporting() -> Intent {
        Intent {
            export_home_dirs: true,
            ..Intent::default()
        }
    }

    #[test]
    fn nothing_to_do_by_default() {
        let plan = build(&Intent::default(), &HostFacts::default()).unwrap();
        assert!(plan.directories.is_empty());
        assert!(plan.exports.is_empty());
        assert!(plan.mounts.is_empty());
    }

    #[test]
    fn server_directories() {
        let plan = build(&exporting(), &HostFacts::default()).unwrap();
        let paths: Vec<&Path> = plan.directories.iter().map(|d| d.path.as_path()).collect();
        assert_eq!(
            paths,
            vec![
                Path::new("/var/nfs"),
                Path::new("/var/nfs/exports"),
                Path::new("/var/nfs/exports/home"),
                Path::new("/var/nfs/home"),
            ]
        );
        for dir in &plan.directories {
            assert_eq!((dir.uid, dir.gid, dir.mode), (0, 0, 0o755));
        }
    }

    #[test]
    fn ancestors_precede_descendants() {
        let plan = build(&exporting(), &HostFacts::default()).unwrap();
        for (i, dir) in plan.directories.iter().enumerate() {
            if let Some(parent) = dir.path.parent() {
                if parent.starts_with("/var/nfs") {
                    assert!(plan.directories[..i].iter().any(|d| d.path == parent));
                }
            }
        }
    }

    #[test]
    fn export_only_has_no_client_mount() {
        let plan = build(&exporting(), &HostFacts::default()).unwrap();
        assert_eq!(plan.mounts.len(), 1);
        assert!(matches!(plan.mounts[0], MountDefinition::Bind(_)));
    }

    #[test]
    fn combined_host_plans_everything() {
        let intent = Intent {
            home_dir_server: Some("1.2.3.4".into()),
            ..exporting()
        };
        let plan = build(&intent, &HostFacts::default()).unwrap();
        assert_eq!(plan.exports.len(), 2);
        assert_eq!(plan.mounts.len(), 2);
        let MountDefinition::Remote(remote) = &plan.mounts[1] else {
            panic!("expected the client mount last");
        };
        assert_eq!(remote.remote_device, "127.0.0.1:/home");
    }

    #[test]
    fn bad_trusted_net_fails_the_plan() {
        let intent = Intent {
            trusted_nets: vec!["1.2.3.0/255.0.255.0".into()],
            ..exporting()
        };
        assert!(matches!(
            build(&intent, &HostFacts::default()),
            Err(crate::Error::InvalidNetmask(_))
        ));
    }

    #[test]
    fn custom_root() {
        let intent = Intent {
            home_dir_root: PathBuf::from("/srv/nfs"),
            ..exporting()
        };
        let plan = build(&intent, &HostFacts::default()).unwrap();
        assert_eq!(plan.exports[1].export_path, PathBuf::from("/srv/nfs/exports/home"));
        let rendered = plan.to_string();
        assert!(rendered.contains("directory /srv/nfs/home 0:0 755"));
    }
}
