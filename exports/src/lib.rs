// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod network;
pub mod table;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use cidr::IpInet;

pub use network::{normalize, NetworkSpec};
pub use table::ExportTable;

/// An NFS export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub path: PathBuf,
    pub clients: Vec<ExportClient>,
}

/// A set of clients that can access an export, together with the options applied to those clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportClient {
    pub client: ClientId,
    pub options: ExportOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    Name(String),
    Addr(IpAddr),
    Netgroup(String),
    Network(IpInet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Whether to deny write access to the export.
    pub read_only: bool,
    /// If true, map the root user to the anonymous user.
    pub root_squash: bool,
    /// Reply to requests only after changes are committed to stable storage.
    pub sync: bool,
    /// Require requests to originate from a privileged source port (below 1024).
    pub secure: bool,
    /// Security flavors, in order of preference (`sys`, `krb5`, `krb5i`, `krb5p`).
    pub sec: Vec<String>,
    /// Filesystem identifier. `0` marks the NFSv4 pseudo root.
    pub fsid: Option<String>,
    /// Let clients cross into filesystems mounted below the export.
    pub crossmnt: bool,
    /// Any other option, with its value if it takes one.
    pub extra: BTreeMap<String, Option<String>>,
}

/// The possible errors from reading network specifications or an exports table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A dotted netmask that is malformed or not a contiguous run of high bits.
    InvalidNetmask(String),
    /// An `address/prefix` entry whose address or prefix length cannot be used.
    InvalidNetwork(String),
    Parse { line: usize, reason: String },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidNetmask(spec) => write!(f, "Invalid netmask in '{spec}'"),
            Self::InvalidNetwork(spec) => write!(f, "Invalid network '{spec}'"),
            Self::Parse { line, reason } => write!(f, "Exports line {line}: {reason}"),
        }
    }
}

impl Default for ExportOptions {
    /// The defaults `exportfs` applies to a client listed without options.
    fn default() -> Self {
        Self {
            read_only: true,
            root_squash: true,
            sync: true,
            secure: true,
            sec: vec!["sys".to_string()],
            fsid: None,
            crossmnt: false,
            extra: BTreeMap::new(),
        }
    }
}

impl ExportOptions {
    /// Parse a comma separated option list, starting from the `exportfs` defaults.
    pub fn parse(options: &str) -> Result<Self, String> {
        let mut parsed = Self::default();
        parsed.apply(options)?;
        Ok(parsed)
    }

    /// Apply a comma separated option list on top of the current options. Later options win, as
    /// they do for `exportfs`.
    pub fn apply(&mut self, options: &str) -> Result<(), String> {
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                None => match option {
                    "ro" => self.read_only = true,
                    "rw" => self.read_only = false,
                    "sync" => self.sync = true,
                    "async" => self.sync = false,
                    "secure" => self.secure = true,
                    "insecure" => self.secure = false,
                    "root_squash" => self.root_squash = true,
                    "no_root_squash" => self.root_squash = false,
                    "crossmnt" => self.crossmnt = true,
                    "nocrossmnt" => self.crossmnt = false,
                    other => {
                        self.extra.insert(other.to_string(), None);
                    }
                },
                Some(("sec", flavors)) => {
                    if flavors.is_empty() {
                        return Err("empty sec= option".to_string());
                    }
                    self.sec = flavors.split(':').map(str::to_string).collect();
                }
                Some(("fsid", fsid)) => {
                    if fsid.is_empty() {
                        return Err("empty fsid= option".to_string());
                    }
                    self.fsid = Some(fsid.to_string());
                }
                Some((key, value)) => {
                    self.extra.insert(key.to_string(), Some(value.to_string()));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for ExportOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut options = vec![
            if self.read_only { "ro" } else { "rw" }.to_string(),
            if self.sync { "sync" } else { "async" }.to_string(),
        ];
        if !self.sec.is_empty() {
            options.push(format!("sec={}", self.sec.join(":")));
        }
        options.push(if self.secure { "secure" } else { "insecure" }.to_string());
        options.push(if self.root_squash { "root_squash" } else { "no_root_squash" }.to_string());
        if let Some(fsid) = &self.fsid {
            options.push(format!("fsid={fsid}"));
        }
        if self.crossmnt {
            options.push("crossmnt".to_string());
        }
        for (key, value) in &self.extra {
            match value {
                Some(value) => options.push(format!("{key}={value}")),
                None => options.push(key.clone()),
            }
        }

        write!(f, "{}", options.join(","))
    }
}

impl ClientId {
    /// Classify a client as written in an exports table.
    pub fn parse(client: &str) -> Result<Self, Error> {
        if let Some(group) = client.strip_prefix('@') {
            return Ok(Self::Netgroup(group.to_string()));
        }
        if client.contains('/') {
            return Ok(Self::from(&NetworkSpec::parse(client)?));
        }
        match client.parse::<IpAddr>() {
            Ok(addr) => Ok(Self::Addr(addr)),
            Err(_) => Ok(Self::Name(client.to_string())),
        }
    }
}

impl From<&NetworkSpec> for ClientId {
    /// `ALL` is how trusted networks spell "any host"; an exports table spells it `*`.
    fn from(spec: &NetworkSpec) -> Self {
        match spec {
            NetworkSpec::Host(addr) => Self::Addr(*addr),
            NetworkSpec::Network(inet) => Self::Network(*inet),
            NetworkSpec::Token(token) if token == "ALL" => Self::Name("*".to_string()),
            NetworkSpec::Token(token) => match token.strip_prefix('@') {
                Some(group) => Self::Netgroup(group.to_string()),
                None => Self::Name(token.clone()),
            },
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Netgroup(group) => write!(f, "@{group}"),
            Self::Network(inet) => write!(f, "{}/{}", inet.address(), inet.network_length()),
        }
    }
}

impl fmt::Display for ExportClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.client, self.options)
    }
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let path = self.path.display().to_string();
        if path.contains(char::is_whitespace) {
            write!(f, "\"{path}\"")?;
        } else {
            write!(f, "{path}")?;
        }
        for client in &self.clients {
            write!(f, " {client}")?;
        }
        Ok(())
    }
}
