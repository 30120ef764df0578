// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;
use std::path::PathBuf;

use exports::{ClientId, Export, ExportClient, ExportOptions, NetworkSpec};

use super::Layout;
use crate::role::{RoleConfig, LOOPBACK};

pub const ROOT_EXPORT: &str = "nfs4_root";
pub const HOME_EXPORT: &str = "home_dirs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDefinition {
    pub name: String,
    pub export_path: PathBuf,
    pub clients: Vec<NetworkSpec>,
    pub security_flavors: Vec<String>,
    pub read_write: bool,
    /// Accept requests from unprivileged source ports.
    pub insecure_allowed: bool,
    pub fsid: Option<String>,
    pub crossmnt: bool,
    pub extra_attrs: BTreeMap<String, Option<String>>,
}

impl ExportDefinition {
    pub fn options(&self) -> ExportOptions {
        ExportOptions {
            read_only: !self.read_write,
            secure: !self.insecure_allowed,
            sec: self.security_flavors.clone(),
            fsid: self.fsid.clone(),
            crossmnt: self.crossmnt,
            extra: self.extra_attrs.clone(),
            ..ExportOptions::default()
        }
    }

    /// The exports-table form: every client gets the same options.
    pub fn to_export(&self) -> Export {
        let options = self.options();
        Export {
            path: self.export_path.clone(),
            clients: self
                .clients
                .iter()
                .map(|spec| ExportClient {
                    client: ClientId::from(spec),
                    options: options.clone(),
                })
                .collect(),
        }
    }
}

/// The NFSv4 pseudo root and the home subtree below it, or nothing when this host does not
/// export home directories.
pub fn plan(
    role: &RoleConfig,
    layout: &Layout,
    trusted_nets: &[NetworkSpec],
    sec: &[String],
    tunnel_secured: bool,
) -> Vec<ExportDefinition> {
    if !role.export_home {
        return Vec::new();
    }

    // A tunnel terminates on this host, so nfsd only ever sees loopback clients.
    let clients = if tunnel_secured || trusted_nets.is_empty() {
        vec![NetworkSpec::Host(LOOPBACK)]
    } else {
        trusted_nets.to_vec()
    };

    let root = ExportDefinition {
        name: ROOT_EXPORT.to_string(),
        export_path: layout.exports_root(),
        clients,
        security_flavors: sec.to_vec(),
        read_write: false,
        insecure_allowed: tunnel_secured,
        fsid: Some("0".to_string()),
        crossmnt: true,
        extra_attrs: BTreeMap::new(),
    };

    let home = ExportDefinition {
        name: HOME_EXPORT.to_string(),
        export_path: layout.exported_home(),
        read_write: true,
        fsid: None,
        crossmnt: false,
        ..root.clone()
    };

    vec![root, home]
}
