// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::{IpAddr, Ipv4Addr};

use log::*;

use crate::config::Intent;
use crate::{Error, Result};

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// What this host does for the home-directory service, with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleConfig {
    pub is_server: bool,
    pub is_client: bool,
    pub export_home: bool,
    pub mount_home: bool,
    pub autodetect_remote: bool,
    pub use_autofs: bool,
    /// The server as given in the intent, if any.
    pub home_dir_server: Option<String>,
    /// The server the home directories are actually mounted from. Set iff `mount_home`.
    pub nfs_server: Option<String>,
}

/// The addresses and names by which this host knows itself.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub addresses: Vec<IpAddr>,
    pub names: Vec<String>,
}

impl HostFacts {
    /// Collect the addresses of every local interface and the host name.
    pub fn from_system() -> Result<Self> {
        let mut addresses = Vec::new();
        for interface in nix::ifaddrs::getifaddrs()? {
            let Some(address) = interface.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                addresses.push(IpAddr::V4(sin.ip()));
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                addresses.push(IpAddr::V6(sin6.ip()));
            }
        }

        let mut names = Vec::new();
        match nix::unistd::gethostname() {
            Ok(name) => {
                let name = name.to_string_lossy().into_owned();
                if let Some((short, _)) = name.split_once('.') {
                    names.push(short.to_string());
                }
                names.push(name);
            }
            Err(e) => warn!("Unable to determine the host name: {e}"),
        }

        debug!("Host facts: addresses {addresses:?}, names {names:?}");
        Ok(Self { addresses, names })
    }

    /// Whether `server` names this host.
    pub fn is_local(&self, server: &str) -> bool {
        match server.parse::<IpAddr>() {
            Ok(addr) => addr.is_loopback() || self.addresses.contains(&addr),
            Err(_) => {
                server.eq_ignore_ascii_case("localhost")
                    || self.names.iter().any(|n| n.eq_ignore_ascii_case(server))
            }
        }
    }
}

/// Resolve the intent into a role. With only defaulted parameters this never fails; explicit
/// overrides that contradict the rest of the intent are reported as `InconsistentRole`.
pub fn resolve(intent: &Intent, facts: &HostFacts) -> Result<RoleConfig> {
    let home_dir_server = intent
        .home_dir_server
        .as_deref()
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string);

    let export_home = intent.export_home_dirs;
    let is_server = intent.is_server.unwrap_or(export_home);
    if export_home && !is_server {
        return Err(Error::InconsistentRole(
            "exporting home directories requires the host to be an NFS server".to_string(),
        ));
    }

    let is_client = intent.is_client.unwrap_or(true);
    if intent.mount_home_dirs == Some(false) {
        if let Some(server) = &home_dir_server {
            return Err(Error::InconsistentRole(format!(
                "home_dir_server is {server} but mounting home directories is disabled"
            )));
        }
    }
    let mount_home = intent.mount_home_dirs.unwrap_or(home_dir_server.is_some());
    if mount_home && !is_client {
        return Err(Error::InconsistentRole(
            "mounting home directories requires the host to be an NFS client".to_string(),
        ));
    }

    let nfs_server = match (mount_home, &home_dir_server) {
        (false, _) => None,
        // A host that exports the home directories always mounts its own export.
        (true, Some(_)) if export_home => Some(LOOPBACK.to_string()),
        (true, Some(server)) if intent.autodetect_remote && facts.is_local(server) => {
            info!("{server} is this host, mounting home directories through {LOOPBACK}");
            Some(LOOPBACK.to_string())
        }
        (true, Some(server)) => Some(server.clone()),
        (true, None) if export_home && intent.autodetect_remote => Some(LOOPBACK.to_string()),
        (true, None) => {
            return Err(Error::InconsistentRole(
                "mounting home directories needs home_dir_server, or a local export with \
                 autodetect_remote"
                    .to_string(),
            ))
        }
    };

    Ok(RoleConfig {
        is_server,
        is_client,
        export_home,
        mount_home,
        autodetect_remote: intent.autodetect_remote,
        use_autofs: intent.use_autofs,
        home_dir_server,
        nfs_server,
    })
}
