// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::*;
use nix::mount::MsFlags;
use nix::unistd::{Gid, Uid};

/// A mounted filesystem, or one that should be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_bind(&self) -> bool {
        self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Parse the first four fields of an fstab(5) or /proc/self/mounts line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let device = unescape(fields.next()?);
        let mount_point = PathBuf::from(unescape(fields.next()?));
        let fs_type = fields.next()?.to_string();
        let options = fields.next()?.split(',').map(str::to_string).collect();
        Some(Self {
            device,
            mount_point,
            fs_type,
            options,
        })
    }
}

/// The operations the reconciler needs from the host it runs on.
pub trait Host {
    /// The filesystems mounted right now.
    fn active_mounts(&self) -> io::Result<Vec<MountEntry>>;

    fn mount(&mut self, entry: &MountEntry) -> io::Result<()>;

    /// Apply new options to a mounted filesystem without unmounting it.
    fn remount(&mut self, entry: &MountEntry) -> io::Result<()>;

    fn unmount(&mut self, mount_point: &Path) -> io::Result<()>;

    /// `(uid, gid)` of a path.
    fn ownership(&self, path: &Path) -> io::Result<(u32, u32)>;

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Make the NFS server pick up a changed exports table.
    fn reload_exports(&mut self) -> io::Result<()>;

    /// Make the automounter pick up changed maps.
    fn reload_automounter(&mut self) -> io::Result<()>;
}

/// The machine this process runs on.
#[derive(Debug, Default)]
pub struct LocalHost;

impl Host for LocalHost {
    fn active_mounts(&self) -> io::Result<Vec<MountEntry>> {
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        Ok(mounts.lines().filter_map(MountEntry::parse).collect())
    }

    fn mount(&mut self, entry: &MountEntry) -> io::Result<()> {
        if !entry.is_bind() {
            return run(Command::new("mount")
                .arg("-t")
                .arg(&entry.fs_type)
                .arg("-o")
                .arg(entry.options.join(","))
                .arg(&entry.device)
                .arg(&entry.mount_point));
        }

        debug!("bind mounting {} on {}", entry.device, entry.mount_point.display());
        nix::mount::mount(
            Some(Path::new(&entry.device)),
            entry.mount_point.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;

        // The kernel ignores every other flag on the initial bind, so read-only needs a remount.
        if entry.is_read_only() {
            self.remount(entry)?;
        }
        Ok(())
    }

    fn remount(&mut self, entry: &MountEntry) -> io::Result<()> {
        if !entry.is_bind() {
            return run(Command::new("mount")
                .arg("-o")
                .arg(format!("remount,{}", entry.options.join(",")))
                .arg(&entry.mount_point));
        }

        let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
        if entry.is_read_only() {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(
            None::<&str>,
            entry.mount_point.as_path(),
            None::<&str>,
            flags,
            None::<&str>,
        )?;
        Ok(())
    }

    fn unmount(&mut self, mount_point: &Path) -> io::Result<()> {
        nix::mount::umount(mount_point)?;
        Ok(())
    }

    fn ownership(&self, path: &Path) -> io::Result<(u32, u32)> {
        let metadata = fs::metadata(path)?;
        Ok((metadata.uid(), metadata.gid()))
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
        Ok(())
    }

    fn reload_exports(&mut self) -> io::Result<()> {
        run(Command::new("exportfs").arg("-ra"))
    }

    fn reload_automounter(&mut self) -> io::Result<()> {
        run(Command::new("systemctl").args(["reload", "autofs"]))
    }
}

fn run(command: &mut Command) -> io::Result<()> {
    debug!("Running {command:?}");
    let status = command.status()?;
    if !status.success() {
        return Err(io::Error::other(format!("{command:?} exited with {status}")));
    }
    Ok(())
}

/// Decode the octal escapes (`\040` for a space) used in mount tables.
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encode the characters that would break a whitespace separated mount table field.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' | '\t' | '\n' | '\\' => out.push_str(&format!("\\{:03o}", ch as u32)),
            ch => out.push(ch),
        }
    }
    out
}
