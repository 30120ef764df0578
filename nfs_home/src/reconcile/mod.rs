// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Converging the host to a [`Plan`].
//!
//! Every step compares the host against the plan first and only acts on a difference, so a pass
//! interrupted halfway is finished by the next one, and a pass over a converged host changes
//! nothing.

pub mod fstab;
pub mod host;
pub mod managed;

use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use exports::{ClientId, ExportTable};
use log::*;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::plan::mount::AUTOFS_MASTER_FILE;
use crate::plan::{
    AutofsMapEntry, BindMount, DirectorySpec, ExportDefinition, MountDefinition, Plan, RemoteMount,
};
use crate::{Error, Result};

use self::fstab::{Fstab, FstabChange};
use self::managed::ManagedExports;
pub use self::host::{Host, LocalHost, MountEntry};

pub const EXPORTS_FILE: &str = "/etc/exports";
pub const FSTAB_FILE: &str = "/etc/fstab";
pub const LOCK_FILE: &str = "/run/nfs_home.lock";
pub const MANAGED_EXPORTS_FILE: &str = "/var/lib/nfs_home/exports.toml";

/// One thing a pass changed on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    DirectoryCreated(PathBuf),
    ModeChanged(PathBuf),
    OwnerChanged(PathBuf),
    ExportUpdated(String),
    /// A path that is no longer planned stopped being exported to the clients granted on it.
    ExportWithdrawn(PathBuf),
    MountTableUpdated(PathBuf),
    Mounted(PathBuf),
    Remounted(PathBuf),
    Unmounted(PathBuf),
    AutomountUpdated(PathBuf),
}

#[derive(Debug, Default)]
pub struct ReconciliationResult {
    pub changes: Vec<Change>,
    /// Resources that could not be applied. Each is a `ReconciliationFailure` naming the
    /// resource, or an `ExportTable` error.
    pub failures: Vec<Error>,
}

impl ReconciliationResult {
    /// Nothing had to change and nothing failed.
    pub fn is_converged(&self) -> bool {
        self.changes.is_empty() && self.failures.is_empty()
    }
}

pub struct Reconciler<H> {
    host: H,
    /// Every path of the plan and every managed file lives below this directory.
    root: PathBuf,
    exports_file: PathBuf,
    managed_exports_file: PathBuf,
    fstab_file: PathBuf,
    lock_file: PathBuf,
}

impl<H: Host> Reconciler<H> {
    pub fn new(host: H, root: &Path) -> Self {
        Self {
            host,
            root: root.to_path_buf(),
            exports_file: PathBuf::from(EXPORTS_FILE),
            managed_exports_file: PathBuf::from(MANAGED_EXPORTS_FILE),
            fstab_file: PathBuf::from(FSTAB_FILE),
            lock_file: PathBuf::from(LOCK_FILE),
        }
    }

    pub fn with_exports_file(mut self, path: &Path) -> Self {
        self.exports_file = path.to_path_buf();
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Where a path of the plan is on this host.
    pub fn rooted(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Apply `plan`: directories first, then server bind mounts, then exports, then client
    /// mounts.
    ///
    /// Directory problems, a concurrent pass, and a managed file changing underneath this pass
    /// end the pass with an error. Any other failure is recorded in the result against its
    /// resource, and the remaining resources are still applied.
    pub fn apply(&mut self, plan: &Plan) -> Result<ReconciliationResult> {
        let _lock = self.lock()?;
        let mut result = ReconciliationResult::default();

        self.check_directories(&plan.directories)?;
        for dir in &plan.directories {
            self.ensure_directory(dir, &mut result)?;
        }

        let mut inactive = Vec::new();
        for mount in &plan.mounts {
            let MountDefinition::Bind(bind) = mount else {
                continue;
            };
            let outcome = self.ensure_bind_mount(bind, &mut result);
            let resource = format!("bind mount {}", bind.mount_point.display());
            if !isolate(&mut result, resource, outcome)? {
                inactive.push(bind.mount_point.clone());
            }
        }

        let outcome = self.ensure_exports(&plan.exports, &inactive, &mut result);
        isolate(&mut result, "exports table".to_string(), outcome)?;

        for mount in &plan.mounts {
            let MountDefinition::Remote(remote) = mount else {
                continue;
            };
            let outcome = self.ensure_remote_mount(remote, &mut result);
            let resource = format!("home directory mount {}", remote.mount_point.display());
            isolate(&mut result, resource, outcome)?;
        }

        info!(
            "Reconciliation done: {} changes, {} failures",
            result.changes.len(),
            result.failures.len()
        );
        Ok(result)
    }

    fn lock(&self) -> Result<Flock<File>> {
        let path = self.rooted(&self.lock_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(lock),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(Error::ConcurrentReconciliation(path))
            }
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// Refuse the whole pass if any planned directory, or any of its ancestors, is occupied by
    /// something else. Checked before anything is created.
    fn check_directories(&self, directories: &[DirectorySpec]) -> Result<()> {
        for dir in directories {
            let path = self.rooted(&dir.path);
            for ancestor in path.ancestors() {
                match fs::metadata(ancestor) {
                    Ok(metadata) if metadata.is_dir() => {}
                    Ok(_) => return Err(Error::PathConflict(ancestor.to_path_buf())),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn ensure_directory(
        &mut self,
        dir: &DirectorySpec,
        result: &mut ReconciliationResult,
    ) -> Result<()> {
        let path = self.rooted(&dir.path);
        let failed = |source: io::Error| Error::ReconciliationFailure {
            resource: format!("directory {}", path.display()),
            source,
        };

        if !path.is_dir() {
            fs::create_dir_all(&path).map_err(failed)?;
            info!("Created {}", path.display());
            result.changes.push(Change::DirectoryCreated(path.clone()));
        }

        let mode = fs::metadata(&path).map_err(failed)?.permissions().mode() & 0o7777;
        if mode != dir.mode {
            fs::set_permissions(&path, Permissions::from_mode(dir.mode)).map_err(failed)?;
            info!("Changed mode of {} from {mode:o} to {:o}", path.display(), dir.mode);
            result.changes.push(Change::ModeChanged(path.clone()));
        }

        let owner = self.host.ownership(&path).map_err(failed)?;
        if owner != (dir.uid, dir.gid) {
            self.host.chown(&path, dir.uid, dir.gid).map_err(failed)?;
            info!(
                "Changed owner of {} from {}:{} to {}:{}",
                path.display(),
                owner.0,
                owner.1,
                dir.uid,
                dir.gid
            );
            result.changes.push(Change::OwnerChanged(path.clone()));
        }

        Ok(())
    }

    fn ensure_bind_mount(
        &mut self,
        bind: &BindMount,
        result: &mut ReconciliationResult,
    ) -> Result<()> {
        let desired = MountEntry {
            device: self.rooted(&bind.device).display().to_string(),
            mount_point: self.rooted(&bind.mount_point),
            fs_type: bind.fs_type.clone(),
            options: bind.options.clone(),
        };
        // The kernel reports the backing block device for a bind mount, not the source
        // directory, so only the persistent table can tell that the source changed.
        self.ensure_mount(&desired, bind.remount_on_change, false, result)
    }

    /// Converge one mount: the live mount table first, then the persistent one. Writing the
    /// persistent table last keeps a failed mount visible to the next pass.
    fn ensure_mount(
        &mut self,
        desired: &MountEntry,
        remount_on_change: bool,
        compare_active_device: bool,
        result: &mut ReconciliationResult,
    ) -> Result<()> {
        let fstab_path = self.rooted(&self.fstab_file);
        let original = read_optional(&fstab_path)?;
        let mut fstab = Fstab::parse(original.as_deref().unwrap_or_default());
        let recorded = fstab.ensure(desired);

        let mount_point = &desired.mount_point;
        let active = self
            .host
            .active_mounts()?
            .into_iter()
            .filter(|m| m.mount_point == *mount_point)
            .last();

        match active {
            None => {
                info!("Mounting {} on {}", desired.device, mount_point.display());
                self.host.mount(desired)?;
                result.changes.push(Change::Mounted(mount_point.clone()));
            }
            Some(current) => {
                let device_changed =
                    matches!(recorded, FstabChange::Updated { device_changed: true })
                        || (compare_active_device && current.device != desired.device);

                if device_changed {
                    info!(
                        "{} moved to {}, mounting it again",
                        mount_point.display(),
                        desired.device
                    );
                    self.host.unmount(mount_point)?;
                    self.host.mount(desired)?;
                    result.changes.push(Change::Remounted(mount_point.clone()));
                } else if let FstabChange::Updated { .. } = recorded {
                    info!(
                        "Options of {} changed to {}",
                        mount_point.display(),
                        desired.options.join(",")
                    );
                    if remount_on_change {
                        self.host.remount(desired)?;
                    } else {
                        self.host.unmount(mount_point)?;
                        self.host.mount(desired)?;
                    }
                    result.changes.push(Change::Remounted(mount_point.clone()));
                } else {
                    debug!("{} is mounted", mount_point.display());
                }
            }
        }

        if recorded != FstabChange::Unchanged {
            write_if_unchanged(&fstab_path, original.as_deref(), &fstab.to_string())?;
            info!("Recorded {} in {}", mount_point.display(), fstab_path.display());
            result.changes.push(Change::MountTableUpdated(mount_point.clone()));
        }

        Ok(())
    }

    /// Bring the exports table in line with `exports`. On the paths this tool exports, clients
    /// it granted earlier and no longer plans are removed; clients added by someone else stay.
    fn ensure_exports(
        &mut self,
        exports: &[ExportDefinition],
        inactive: &[PathBuf],
        result: &mut ReconciliationResult,
    ) -> Result<()> {
        let managed_path = self.rooted(&self.managed_exports_file);
        let recorded = match read_optional(&managed_path)? {
            Some(source) => ManagedExports::parse(&source)?,
            None => ManagedExports::default(),
        };
        if exports.is_empty() && recorded.is_empty() {
            return Ok(());
        }

        let path = self.rooted(&self.exports_file);
        let original = read_optional(&path)?;
        let mut table = ExportTable::parse(original.as_deref().unwrap_or_default())?;
        let mut managed = recorded.clone();

        let mut updated = Vec::new();
        let mut planned_paths = Vec::new();
        for definition in exports {
            let export_path = self.rooted(&definition.export_path);
            planned_paths.push(export_path.clone());

            // Advertising the export before its bind mount is active would serve whatever is
            // underneath the mount point.
            if inactive.contains(&definition.export_path) {
                let source = io::Error::other(format!(
                    "bind mount {} is not active",
                    definition.export_path.display()
                ));
                warn!("Skipping export {}: {source}", definition.name);
                result.failures.push(Error::ReconciliationFailure {
                    resource: format!("export {}", definition.name),
                    source,
                });
                continue;
            }

            let mut export = definition.to_export();
            export.path = export_path;
            let planned: Vec<ClientId> = export.clients.iter().map(|c| c.client.clone()).collect();
            let revoked: Vec<ClientId> = recorded
                .clients(&export.path)?
                .into_iter()
                .filter(|client| !planned.contains(client))
                .collect();

            let retired = table.retire(&export.path, &revoked);
            let merged = table.merge(&export);
            if retired || merged {
                info!("Export {}: {export}", definition.name);
                updated.push(Change::ExportUpdated(definition.name.clone()));
            } else {
                debug!("Export {} is current", definition.name);
            }
            managed.record(&export.path, &planned);
        }

        for stale in recorded.paths() {
            if planned_paths.contains(&stale) {
                continue;
            }
            if table.retire(&stale, &recorded.clients(&stale)?) {
                info!("Withdrew the export of {}", stale.display());
                updated.push(Change::ExportWithdrawn(stale.clone()));
            }
            managed.forget(&stale);
        }

        if !updated.is_empty() {
            write_if_unchanged(&path, original.as_deref(), &table.to_string())?;
            if let Err(e) = self.host.reload_exports() {
                // Put the old table back so the next pass sees the difference and reloads again.
                restore(&path, original.as_deref())?;
                return Err(e.into());
            }
            result.changes.extend(updated);
        }

        // Recorded only once the table it describes is in effect.
        if managed != recorded {
            write_atomic(&managed_path, &managed.to_toml()?)?;
            debug!("Recorded managed export clients in {}", managed_path.display());
        }
        Ok(())
    }

    fn ensure_remote_mount(
        &mut self,
        remote: &RemoteMount,
        result: &mut ReconciliationResult,
    ) -> Result<()> {
        let mount_point = self.rooted(&remote.mount_point);

        let Some(entry) = &remote.autofs_map_entry else {
            self.remove_automount(result)?;
            fs::create_dir_all(&mount_point)?;
            let desired = MountEntry {
                device: remote.remote_device.clone(),
                mount_point,
                fs_type: remote.fs_type.clone(),
                options: remote.options.clone(),
            };
            return self.ensure_mount(&desired, false, true, result);
        };

        // The automounter owns the mount point now.
        let direct = self
            .host
            .active_mounts()?
            .into_iter()
            .any(|m| m.mount_point == mount_point && m.fs_type != "autofs");
        if direct {
            info!("Unmounting {} for the automounter", mount_point.display());
            self.host.unmount(&mount_point)?;
            result.changes.push(Change::Unmounted(mount_point.clone()));
        }

        let fstab_path = self.rooted(&self.fstab_file);
        let original = read_optional(&fstab_path)?;
        let mut fstab = Fstab::parse(original.as_deref().unwrap_or_default());
        if fstab.remove(&mount_point) {
            write_if_unchanged(&fstab_path, original.as_deref(), &fstab.to_string())?;
            info!("Removed {} from {}", mount_point.display(), fstab_path.display());
            result.changes.push(Change::MountTableUpdated(mount_point.clone()));
        }

        let entry = AutofsMapEntry {
            master_file: self.rooted(&entry.master_file),
            map_file: self.rooted(&entry.map_file),
            ..entry.clone()
        };
        let files = [
            (entry.map_file.clone(), format!("{}\n", entry.map_line())),
            (
                entry.master_file.clone(),
                format!("{}\n", entry.master_line(&mount_point)),
            ),
        ];

        let mut written = Vec::new();
        for (path, contents) in &files {
            let original = read_optional(path)?;
            if original.as_deref() == Some(contents.as_str()) {
                debug!("{} is current", path.display());
                continue;
            }
            write_if_unchanged(path, original.as_deref(), contents)?;
            info!("Wrote automount map {}", path.display());
            written.push((path.clone(), original));
        }

        if written.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.host.reload_automounter() {
            for (path, original) in &written {
                restore(path, original.as_deref())?;
            }
            return Err(e.into());
        }

        result
            .changes
            .extend(written.into_iter().map(|(path, _)| Change::AutomountUpdated(path)));
        Ok(())
    }

    /// Unregister the automount map when the home directories are mounted directly instead.
    fn remove_automount(&mut self, result: &mut ReconciliationResult) -> Result<()> {
        let master_file = self.rooted(Path::new(AUTOFS_MASTER_FILE));
        let Some(original) = read_optional(&master_file)? else {
            return Ok(());
        };

        fs::remove_file(&master_file)?;
        if let Err(e) = self.host.reload_automounter() {
            restore(&master_file, Some(&original))?;
            return Err(e.into());
        }
        info!("Removed automount registration {}", master_file.display());
        result.changes.push(Change::AutomountUpdated(master_file));
        Ok(())
    }
}

/// Sort the outcome of one resource: failures local to it are recorded and `Ok(false)` returned,
/// anything that must end the pass is passed on.
fn isolate(
    result: &mut ReconciliationResult,
    resource: String,
    outcome: Result<()>,
) -> Result<bool> {
    match outcome {
        Ok(()) => Ok(true),
        Err(Error::Io(source)) | Err(Error::ReconciliationFailure { source, .. }) => {
            warn!("Failed to apply {resource}: {source}");
            result
                .failures
                .push(Error::ReconciliationFailure { resource, source });
            Ok(false)
        }
        Err(e @ Error::ExportTable(_)) => {
            warn!("{e}");
            result.failures.push(e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace `path` with `contents`, unless it no longer holds `expected` (`None`: absent), which
/// means something else wrote it during this pass.
fn write_if_unchanged(path: &Path, expected: Option<&str>, contents: &str) -> Result<()> {
    if read_optional(path)?.as_deref() != expected {
        return Err(Error::ConcurrentReconciliation(path.to_path_buf()));
    }
    write_atomic(path, contents)?;
    Ok(())
}

fn restore(path: &Path, original: Option<&str>) -> io::Result<()> {
    match original {
        Some(contents) => write_atomic(path, contents),
        None => fs::remove_file(path),
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("/"));
    fs::create_dir_all(parent)?;

    let name = path
        .file_name()
        .ok_or_else(|| io::Error::other(format!("{} is not a file path", path.display())))?;
    let staging = parent.join(format!(".{}.nfs_home", name.to_string_lossy()));

    fs::write(&staging, contents)?;
    fs::set_permissions(&staging, Permissions::from_mode(0o644))?;
    fs::rename(&staging, path)
}
