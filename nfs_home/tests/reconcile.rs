// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use exports::ExportTable;
use nix::fcntl::{Flock, FlockArg};

use nfs_home::config::Intent;
use nfs_home::plan::{self, Plan};
use nfs_home::reconcile::{Change, Host, MountEntry, Reconciler};
use nfs_home::role::HostFacts;
use nfs_home::Error;

/// A host that keeps its mount table and ownership in memory and records what was asked of it.
#[derive(Debug, Default)]
struct FakeHost {
    mounts: Vec<MountEntry>,
    owners: HashMap<PathBuf, (u32, u32)>,
    calls: Vec<String>,
    failing_mounts: Vec<PathBuf>,
    fail_reload: bool,
    fail_automount_reload: bool,
}

impl Host for FakeHost {
    fn active_mounts(&self) -> io::Result<Vec<MountEntry>> {
        Ok(self.mounts.clone())
    }

    fn mount(&mut self, entry: &MountEntry) -> io::Result<()> {
        if self.failing_mounts.contains(&entry.mount_point) {
            return Err(io::Error::other("mount: permission denied"));
        }
        self.calls
            .push(format!("mount {}", entry.mount_point.display()));
        self.mounts.push(entry.clone());
        Ok(())
    }

    fn remount(&mut self, entry: &MountEntry) -> io::Result<()> {
        self.calls
            .push(format!("remount {}", entry.mount_point.display()));
        for mount in &mut self.mounts {
            if mount.mount_point == entry.mount_point {
                mount.options = entry.options.clone();
            }
        }
        Ok(())
    }

    fn unmount(&mut self, mount_point: &Path) -> io::Result<()> {
        self.calls.push(format!("unmount {}", mount_point.display()));
        self.mounts.retain(|m| m.mount_point != mount_point);
        Ok(())
    }

    fn ownership(&self, path: &Path) -> io::Result<(u32, u32)> {
        Ok(self.owners.get(path).copied().unwrap_or((1000, 1000)))
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.owners.insert(path.to_path_buf(), (uid, gid));
        Ok(())
    }

    fn reload_exports(&mut self) -> io::Result<()> {
        if self.fail_reload {
            return Err(io::Error::other("exportfs: nfsd is not running"));
        }
        self.calls.push("exportfs".to_string());
        Ok(())
    }

    fn reload_automounter(&mut self) -> io::Result<()> {
        if self.fail_automount_reload {
            return Err(io::Error::other("autofs.service is not active"));
        }
        self.calls.push("automount".to_string());
        Ok(())
    }
}

fn plan_for(intent: Intent) -> Plan {
    plan::build(&intent, &HostFacts::default()).unwrap()
}

fn exporting() -> Intent {
    Intent {
        export_home_dirs: true,
        ..Intent::default()
    }
}

fn mounting(server: &str) -> Intent {
    Intent {
        home_dir_server: Some(server.to_string()),
        ..Intent::default()
    }
}

fn combined() -> Intent {
    Intent {
        export_home_dirs: true,
        ..mounting("1.2.3.4")
    }
}

fn reconciler(root: &Path) -> Reconciler<FakeHost> {
    Reconciler::new(FakeHost::default(), root)
}

fn failed_resources(failures: &[Error]) -> Vec<String> {
    failures
        .iter()
        .map(|e| match e {
            Error::ReconciliationFailure { resource, .. } => resource.clone(),
            other => panic!("unexpected failure {other:?}"),
        })
        .collect()
}

#[test]
fn combined_host_converges() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let r = root.display();
    let plan = plan_for(combined());
    let mut reconciler = reconciler(root);

    let first = reconciler.apply(&plan).unwrap();
    assert!(first.failures.is_empty(), "{:?}", first.failures);
    assert!(first
        .changes
        .contains(&Change::Mounted(root.join("var/nfs/exports/home"))));
    assert!(first
        .changes
        .contains(&Change::ExportUpdated("nfs4_root".into())));
    assert!(first
        .changes
        .contains(&Change::ExportUpdated("home_dirs".into())));

    for dir in ["var/nfs", "var/nfs/exports", "var/nfs/exports/home", "var/nfs/home"] {
        let path = root.join(dir);
        assert!(path.is_dir());
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o755);
        assert_eq!(reconciler.host().owners.get(&path), Some(&(0, 0)));
    }

    assert_eq!(
        fs::read_to_string(root.join("etc/exports")).unwrap(),
        format!(
            "{r}/var/nfs/exports 127.0.0.1(ro,sync,sec=sys,secure,root_squash,fsid=0,crossmnt)\n\
             {r}/var/nfs/exports/home 127.0.0.1(rw,sync,sec=sys,secure,root_squash)\n"
        )
    );
    assert_eq!(
        fs::read_to_string(root.join("etc/fstab")).unwrap(),
        format!("{r}/var/nfs/home\t{r}/var/nfs/exports/home\tnone\trw,bind\t0 0\n")
    );
    assert_eq!(
        fs::read_to_string(root.join("etc/autofs/home.map")).unwrap(),
        "* -fstype=nfs4,port=2049,sec=sys,soft 127.0.0.1:/home/&\n"
    );
    assert_eq!(
        fs::read_to_string(root.join("etc/auto.master.d/home.autofs")).unwrap(),
        format!("{r}/home {r}/etc/autofs/home.map\n")
    );
    assert_eq!(
        reconciler.host().calls,
        vec![
            format!("mount {r}/var/nfs/exports/home"),
            "exportfs".to_string(),
            "automount".to_string(),
        ]
    );

    let second = reconciler.apply(&plan).unwrap();
    assert!(second.is_converged(), "{second:?}");
    assert_eq!(reconciler.host().calls.len(), 3);
}

#[test]
fn drifted_mode_is_repaired() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let plan = plan_for(exporting());
    let mut reconciler = reconciler(root);
    reconciler.apply(&plan).unwrap();

    let store = root.join("var/nfs/home");
    fs::set_permissions(&store, fs::Permissions::from_mode(0o700)).unwrap();

    let result = reconciler.apply(&plan).unwrap();
    assert_eq!(result.changes, vec![Change::ModeChanged(store.clone())]);
    assert_eq!(fs::metadata(&store).unwrap().permissions().mode() & 0o7777, 0o755);
}

#[test]
fn path_conflict_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("var/nfs")).unwrap();
    fs::write(root.join("var/nfs/exports"), "not a directory").unwrap();

    let mut reconciler = reconciler(root);
    let err = reconciler.apply(&plan_for(exporting())).unwrap_err();

    assert!(matches!(err, Error::PathConflict(ref p) if *p == root.join("var/nfs/exports")));
    assert!(!root.join("var/nfs/home").exists());
    assert!(!root.join("etc").exists());
    assert!(reconciler.host().calls.is_empty());
    assert!(reconciler.host().owners.is_empty());
}

#[test]
fn unmanaged_exports_are_preserved() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let r = root.display();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(
        root.join("etc/exports"),
        format!("# local exports\n/srv/other host1(rw)\n{r}/var/nfs/exports 10.9.9.9(rw)\n"),
    )
    .unwrap();

    let plan = plan_for(exporting());
    let mut reconciler = reconciler(root);
    reconciler.apply(&plan).unwrap();

    let contents = fs::read_to_string(root.join("etc/exports")).unwrap();
    assert!(contents.starts_with("# local exports\n/srv/other host1(rw)\n"));

    let table = ExportTable::parse(&contents).unwrap();
    let pseudo_root = table.get(&root.join("var/nfs/exports")).unwrap();
    let clients: Vec<String> = pseudo_root
        .clients
        .iter()
        .map(|c| c.client.to_string())
        .collect();
    assert_eq!(clients, vec!["10.9.9.9", "127.0.0.1"]);
    assert!(!pseudo_root.clients[0].options.read_only);
    assert!(table.get(&root.join("var/nfs/exports/home")).is_some());

    assert!(reconciler.apply(&plan).unwrap().is_converged());
}

#[test]
fn tunnel_exports_to_loopback_only() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let plan = plan_for(Intent {
        trusted_nets: vec!["1.2.3.0/255.255.255.0".into()],
        tunnel_secured: true,
        ..exporting()
    });
    reconciler(root).apply(&plan).unwrap();

    let contents = fs::read_to_string(root.join("etc/exports")).unwrap();
    let table = ExportTable::parse(&contents).unwrap();
    assert_eq!(table.exports().count(), 2);
    for export in table.exports() {
        assert_eq!(export.clients.len(), 1);
        assert_eq!(export.clients[0].client.to_string(), "127.0.0.1");
        assert!(!export.clients[0].options.secure);
    }
}

#[test]
fn failed_bind_mount_holds_back_home_export() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let bind_point = root.join("var/nfs/exports/home");
    let plan = plan_for(exporting());
    let mut reconciler = reconciler(root);
    reconciler.host_mut().failing_mounts.push(bind_point.clone());

    let first = reconciler.apply(&plan).unwrap();
    assert_eq!(
        failed_resources(&first.failures),
        vec!["bind mount /var/nfs/exports/home", "export home_dirs"]
    );
    assert!(first
        .changes
        .contains(&Change::ExportUpdated("nfs4_root".into())));

    let table = ExportTable::parse(&fs::read_to_string(root.join("etc/exports")).unwrap()).unwrap();
    assert!(table.get(&root.join("var/nfs/exports")).is_some());
    assert!(table.get(&bind_point).is_none());
    assert!(!root.join("etc/fstab").exists());

    reconciler.host_mut().failing_mounts.clear();
    let second = reconciler.apply(&plan).unwrap();
    assert!(second.failures.is_empty());
    assert!(second.changes.contains(&Change::Mounted(bind_point.clone())));
    assert!(second
        .changes
        .contains(&Change::MountTableUpdated(bind_point.clone())));
    assert_eq!(
        second
            .changes
            .iter()
            .filter(|c| matches!(c, Change::ExportUpdated(_)))
            .collect::<Vec<_>>(),
        vec![&Change::ExportUpdated("home_dirs".into())]
    );

    assert!(reconciler.apply(&plan).unwrap().is_converged());
}

#[test]
fn moved_store_is_mounted_again() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let r = root.display();
    let bind_point = root.join("var/nfs/exports/home");
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(
        root.join("etc/fstab"),
        format!("/old/store {r}/var/nfs/exports/home none rw,bind 0 0\n"),
    )
    .unwrap();

    let mut reconciler = reconciler(root);
    reconciler.host_mut().mounts.push(MountEntry {
        device: "/dev/sdb1".into(),
        mount_point: bind_point.clone(),
        fs_type: "xfs".into(),
        options: vec!["rw".into()],
    });

    let result = reconciler.apply(&plan_for(exporting())).unwrap();
    assert!(result.changes.contains(&Change::Remounted(bind_point.clone())));
    assert!(result
        .changes
        .contains(&Change::MountTableUpdated(bind_point.clone())));
    assert_eq!(
        reconciler.host().calls[..2],
        [format!("unmount {r}/var/nfs/exports/home"), format!("mount {r}/var/nfs/exports/home")]
    );
    assert!(fs::read_to_string(root.join("etc/fstab"))
        .unwrap()
        .starts_with(&format!("{r}/var/nfs/home\t")));
}

#[test]
fn changed_options_remount_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let r = root.display();
    let bind_point = root.join("var/nfs/exports/home");
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(
        root.join("etc/fstab"),
        format!("{r}/var/nfs/home {r}/var/nfs/exports/home none ro,bind 0 0\n"),
    )
    .unwrap();

    let mut reconciler = reconciler(root);
    reconciler.host_mut().mounts.push(MountEntry {
        device: "/dev/sdb1".into(),
        mount_point: bind_point.clone(),
        fs_type: "xfs".into(),
        options: vec!["ro".into()],
    });

    let result = reconciler.apply(&plan_for(exporting())).unwrap();
    assert!(result.changes.contains(&Change::Remounted(bind_point.clone())));
    assert_eq!(reconciler.host().calls[0], format!("remount {r}/var/nfs/exports/home"));
    assert!(!reconciler
        .host()
        .calls
        .iter()
        .any(|c| c.starts_with("unmount")));
}

#[test]
fn direct_client_mount_follows_the_server() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let r = root.display();
    let home = root.join("home");
    let direct = |server: &str| {
        plan_for(Intent {
            use_autofs: false,
            ..mounting(server)
        })
    };

    let mut reconciler = reconciler(root);
    let first = reconciler.apply(&direct("1.2.3.4")).unwrap();
    assert!(first.failures.is_empty());
    assert!(home.is_dir());
    assert_eq!(
        fs::read_to_string(root.join("etc/fstab")).unwrap(),
        format!("1.2.3.4:/home\t{r}/home\tnfs4\tport=2049,sec=sys,soft\t0 0\n")
    );
    assert!(reconciler.apply(&direct("1.2.3.4")).unwrap().is_converged());

    let moved = reconciler.apply(&direct("5.6.7.8")).unwrap();
    assert!(moved.changes.contains(&Change::Remounted(home.clone())));
    assert_eq!(reconciler.host().mounts.len(), 1);
    assert_eq!(reconciler.host().mounts[0].device, "5.6.7.8:/home");
}

#[test]
fn switching_between_autofs_and_direct_mounts() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let home = root.join("home");
    let master = root.join("etc/auto.master.d/home.autofs");
    let mut reconciler = reconciler(root);

    reconciler
        .apply(&plan_for(Intent {
            use_autofs: false,
            ..mounting("1.2.3.4")
        }))
        .unwrap();

    assert!(reconciler.host().mounts.iter().any(|m| m.mount_point == home));

    let autofs = reconciler.apply(&plan_for(mounting("1.2.3.4"))).unwrap();
    assert!(autofs.failures.is_empty());
    assert!(autofs.changes.contains(&Change::Unmounted(home.clone())));
    assert!(!reconciler.host().mounts.iter().any(|m| m.mount_point == home));
    assert!(autofs.changes.contains(&Change::MountTableUpdated(home.clone())));
    assert!(autofs.changes.contains(&Change::AutomountUpdated(master.clone())));
    assert_eq!(fs::read_to_string(root.join("etc/fstab")).unwrap(), "");

    let direct = reconciler
        .apply(&plan_for(Intent {
            use_autofs: false,
            ..mounting("1.2.3.4")
        }))
        .unwrap();
    assert!(direct.changes.contains(&Change::AutomountUpdated(master.clone())));
    assert!(!master.exists());
}

#[test]
fn failed_automount_reload_keeps_the_registration() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let master = root.join("etc/auto.master.d/home.autofs");
    let direct = plan_for(Intent {
        use_autofs: false,
        ..mounting("1.2.3.4")
    });
    let mut reconciler = reconciler(root);
    reconciler.apply(&plan_for(mounting("1.2.3.4"))).unwrap();
    let registration = fs::read_to_string(&master).unwrap();

    reconciler.host_mut().fail_automount_reload = true;
    let failed = reconciler.apply(&direct).unwrap();
    assert_eq!(
        failed_resources(&failed.failures),
        vec!["home directory mount /home"]
    );
    assert_eq!(fs::read_to_string(&master).unwrap(), registration);

    reconciler.host_mut().fail_automount_reload = false;
    let retried = reconciler.apply(&direct).unwrap();
    assert!(retried.failures.is_empty());
    assert!(retried.changes.contains(&Change::AutomountUpdated(master.clone())));
    assert!(!master.exists());

    assert!(reconciler.apply(&direct).unwrap().is_converged());
}

#[test]
fn revoked_networks_lose_access() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let r = root.display();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(
        root.join("etc/exports"),
        format!("{r}/var/nfs/exports/home 10.9.9.9(rw)\n"),
    )
    .unwrap();
    let trusting = |nets: &[&str]| {
        plan_for(Intent {
            trusted_nets: nets.iter().map(|n| n.to_string()).collect(),
            ..exporting()
        })
    };
    let client_names = |path: PathBuf| -> Vec<String> {
        let contents = fs::read_to_string(root.join("etc/exports")).unwrap();
        let table = ExportTable::parse(&contents).unwrap();
        table
            .get(&path)
            .unwrap()
            .clients
            .iter()
            .map(|c| c.client.to_string())
            .collect()
    };

    let mut reconciler = reconciler(root);
    reconciler.apply(&plan_for(exporting())).unwrap();
    reconciler.apply(&trusting(&["10.0.0.0/8"])).unwrap();
    assert_eq!(
        client_names(root.join("var/nfs/exports/home")),
        vec!["10.9.9.9", "10.0.0.0/8"]
    );

    let narrowed = reconciler.apply(&trusting(&["10.1.0.0/16"])).unwrap();
    assert!(narrowed.failures.is_empty());
    assert!(narrowed
        .changes
        .contains(&Change::ExportUpdated("nfs4_root".into())));
    assert!(narrowed
        .changes
        .contains(&Change::ExportUpdated("home_dirs".into())));
    assert_eq!(client_names(root.join("var/nfs/exports")), vec!["10.1.0.0/16"]);
    assert_eq!(
        client_names(root.join("var/nfs/exports/home")),
        vec!["10.9.9.9", "10.1.0.0/16"]
    );

    assert!(reconciler
        .apply(&trusting(&["10.1.0.0/16"]))
        .unwrap()
        .is_converged());
}

#[test]
fn exports_are_withdrawn_when_no_longer_planned() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(root.join("etc/exports"), "/srv/other host1(rw)\n").unwrap();

    let mut reconciler = reconciler(root);
    reconciler.apply(&plan_for(exporting())).unwrap();

    let idle = plan_for(Intent::default());
    let withdrawn = reconciler.apply(&idle).unwrap();
    assert!(withdrawn.failures.is_empty());
    assert!(withdrawn
        .changes
        .contains(&Change::ExportWithdrawn(root.join("var/nfs/exports"))));
    assert!(withdrawn
        .changes
        .contains(&Change::ExportWithdrawn(root.join("var/nfs/exports/home"))));
    assert_eq!(
        fs::read_to_string(root.join("etc/exports")).unwrap(),
        "/srv/other host1(rw)\n"
    );

    assert!(reconciler.apply(&idle).unwrap().is_converged());
}

#[test]
fn failed_export_reload_is_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let plan = plan_for(exporting());
    let mut reconciler = reconciler(root);
    reconciler.host_mut().fail_reload = true;

    let first = reconciler.apply(&plan).unwrap();
    assert_eq!(failed_resources(&first.failures), vec!["exports table"]);
    assert!(!root.join("etc/exports").exists());

    reconciler.host_mut().fail_reload = false;
    let second = reconciler.apply(&plan).unwrap();
    assert!(second.failures.is_empty());
    assert!(second
        .changes
        .contains(&Change::ExportUpdated("home_dirs".into())));
}

#[test]
fn unreadable_exports_table_is_left_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(root.join("etc/exports"), "/srv/broken host(rw\n").unwrap();

    let result = reconciler(root).apply(&plan_for(exporting())).unwrap();
    assert_eq!(result.failures.len(), 1);
    assert!(matches!(result.failures[0], Error::ExportTable(_)));
    assert_eq!(
        fs::read_to_string(root.join("etc/exports")).unwrap(),
        "/srv/broken host(rw\n"
    );
    assert!(result
        .changes
        .contains(&Change::Mounted(root.join("var/nfs/exports/home"))));
}

#[test]
fn concurrent_pass_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let lock_path = root.join("run/nfs_home.lock");
    fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    let _held = Flock::lock(File::create(&lock_path).unwrap(), FlockArg::LockExclusiveNonblock)
        .unwrap();

    let err = reconciler(root).apply(&plan_for(exporting())).unwrap_err();
    assert!(matches!(err, Error::ConcurrentReconciliation(_)));
    assert!(!root.join("var").exists());
}
