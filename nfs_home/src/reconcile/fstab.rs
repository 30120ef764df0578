// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::Path;

use super::host::{escape, MountEntry};

/// The persistent mount table. Lines the reconciler does not manage are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fstab {
    lines: Vec<Line>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        entry: MountEntry,
        raw: Option<String>,
    },
    Other(String),
}

/// What [`Fstab::ensure`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FstabChange {
    Unchanged,
    Added,
    Updated { device_changed: bool },
}

impl Fstab {
    pub fn parse(source: &str) -> Self {
        let lines = source
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(line.to_string());
                }
                match MountEntry::parse(line) {
                    Some(entry) => Line::Entry {
                        entry,
                        raw: Some(line.to_string()),
                    },
                    None => Line::Other(line.to_string()),
                }
            })
            .collect();

        Self { lines }
    }

    pub fn get(&self, mount_point: &Path) -> Option<&MountEntry> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { entry, .. } if entry.mount_point == mount_point => Some(entry),
            _ => None,
        })
    }

    /// Record `desired` for its mount point, replacing whatever was recorded there.
    pub fn ensure(&mut self, desired: &MountEntry) -> FstabChange {
        let existing = self.lines.iter_mut().find_map(|line| match line {
            Line::Entry { entry, raw } if entry.mount_point == desired.mount_point => {
                Some((entry, raw))
            }
            _ => None,
        });

        let Some((entry, raw)) = existing else {
            self.lines.push(Line::Entry {
                entry: desired.clone(),
                raw: None,
            });
            return FstabChange::Added;
        };

        if entry == desired {
            return FstabChange::Unchanged;
        }

        let device_changed = entry.device != desired.device;
        *entry = desired.clone();
        *raw = None;
        FstabChange::Updated { device_changed }
    }

    /// Drop every entry for `mount_point`, returning whether there was one.
    pub fn remove(&mut self, mount_point: &Path) -> bool {
        let before = self.lines.len();
        self.lines.retain(|line| {
            !matches!(line, Line::Entry { entry, .. } if entry.mount_point == mount_point)
        });
        self.lines.len() != before
    }
}

impl fmt::Display for Fstab {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Entry { raw: Some(raw), .. } | Line::Other(raw) => writeln!(f, "{raw}")?,
                Line::Entry { entry, raw: None } => writeln!(
                    f,
                    "{}\t{}\t{}\t{}\t0 0",
                    escape(&entry.device),
                    escape(&entry.mount_point.display().to_string()),
                    entry.fs_type,
                    entry.options.join(",")
                )?,
            }
        }
        Ok(())
    }
}
