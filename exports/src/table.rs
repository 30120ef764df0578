// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ClientId, Error, Export, ExportClient, ExportOptions};

/// The contents of an exports(5) file.
///
/// Lines that are not touched by [`ExportTable::merge`] are written back exactly as they were
/// read, comments and continuation lines included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
    lines: Vec<Line>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Export {
        export: Export,
        /// The original text, or `None` once the export was modified.
        raw: Option<String>,
    },
    Other(String),
}

impl ExportTable {
    pub fn parse(source: &str) -> Result<Self, Error> {
        let mut lines = Vec::new();
        let mut physical = source.lines().enumerate();

        while let Some((index, line)) = physical.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Other(line.to_string()));
                continue;
            }

            // A trailing backslash continues the entry on the next line.
            let mut raw = line.to_string();
            let mut logical = String::new();
            let mut current = line;
            while let Some(head) = current.trim_end().strip_suffix('\\') {
                logical.push_str(head);
                logical.push(' ');
                match physical.next() {
                    Some((_, next)) => {
                        raw.push('\n');
                        raw.push_str(next);
                        current = next;
                    }
                    None => {
                        current = "";
                        break;
                    }
                }
            }
            logical.push_str(current);

            let export = parse_export(&logical, index + 1)?;
            lines.push(Line::Export {
                export,
                raw: Some(raw),
            });
        }

        Ok(Self { lines })
    }

    pub fn exports(&self) -> impl Iterator<Item = &Export> {
        self.lines.iter().filter_map(|line| match line {
            Line::Export { export, .. } => Some(export),
            Line::Other(_) => None,
        })
    }

    pub fn get(&self, path: &Path) -> Option<&Export> {
        self.exports().find(|export| export.path == path)
    }

    /// Merge `export` into the table and return whether anything changed.
    ///
    /// A path that is not in the table yet is appended. For a path that is, every client of
    /// `export` is added or has its options replaced; clients of that path which `export` does
    /// not mention are left alone.
    pub fn merge(&mut self, export: &Export) -> bool {
        let existing = self.lines.iter_mut().find_map(|line| match line {
            Line::Export { export: current, raw } if current.path == export.path => {
                Some((current, raw))
            }
            _ => None,
        });

        let Some((current, raw)) = existing else {
            self.lines.push(Line::Export {
                export: export.clone(),
                raw: None,
            });
            return true;
        };

        let mut changed = false;
        for client in &export.clients {
            match current.clients.iter_mut().find(|c| c.client == client.client) {
                Some(c) if c.options == client.options => {}
                Some(c) => {
                    c.options = client.options.clone();
                    changed = true;
                }
                None => {
                    current.clients.push(client.clone());
                    changed = true;
                }
            }
        }

        if changed {
            *raw = None;
        }
        changed
    }

    /// Take `clients` off the export of `path` and return whether anything changed.
    ///
    /// An export left without clients is dropped, since exports(5) reads a bare path as open to
    /// every host.
    pub fn retire(&mut self, path: &Path, clients: &[ClientId]) -> bool {
        let mut changed = false;
        self.lines.retain_mut(|line| {
            let Line::Export { export, raw } = line else {
                return true;
            };
            if export.path != path {
                return true;
            }

            let before = export.clients.len();
            export.clients.retain(|c| !clients.contains(&c.client));
            if export.clients.len() == before {
                return true;
            }
            *raw = None;
            changed = true;
            !export.clients.is_empty()
        });
        changed
    }
}

/// Parse a single logical exports line: `path [-defaults] client[(options)] ...`
fn parse_export(line: &str, number: usize) -> Result<Export, Error> {
    let parse_error = |reason: String| Error::Parse {
        line: number,
        reason,
    };

    let line = line.trim();
    let (path, rest) = match line.strip_prefix('"') {
        Some(quoted) => {
            let end = quoted
                .find('"')
                .ok_or_else(|| parse_error("unterminated quoted path".to_string()))?;
            (&quoted[..end], &quoted[end + 1..])
        }
        None => line.split_at(line.find(char::is_whitespace).unwrap_or(line.len())),
    };

    if !path.starts_with('/') {
        return Err(parse_error(format!("export path '{path}' is not absolute")));
    }

    let mut defaults = ExportOptions::default();
    let mut clients = Vec::new();

    for token in rest.split_whitespace() {
        if let Some(options) = token.strip_prefix('-') {
            defaults.apply(options).map_err(&parse_error)?;
            continue;
        }

        let (name, options) = match token.split_once('(') {
            Some((name, options)) => {
                let options = options
                    .strip_suffix(')')
                    .ok_or_else(|| parse_error(format!("unbalanced parenthesis in '{token}'")))?;
                (name, Some(options))
            }
            None => (token, None),
        };

        let client = if name.is_empty() {
            ClientId::Name("*".to_string())
        } else {
            ClientId::parse(name).map_err(|e| parse_error(e.to_string()))?
        };

        let mut client_options = defaults.clone();
        if let Some(options) = options {
            client_options.apply(options).map_err(&parse_error)?;
        }

        clients.push(ExportClient {
            client,
            options: client_options,
        });
    }

    Ok(Export {
        path: PathBuf::from(path),
        clients,
    })
}

impl fmt::Display for ExportTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Export { raw: Some(raw), .. } => writeln!(f, "{raw}")?,
                Line::Export { export, raw: None } => writeln!(f, "{export}")?,
                Line::Other(text) => writeln!(f, "{text}")?,
            }
        }
        Ok(())
    }
}
