// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::*;

use nfs_home::config::Intent;
use nfs_home::plan;
use nfs_home::reconcile::{LocalHost, Reconciler};
use nfs_home::role::HostFacts;

#[derive(Debug, Parser)]
struct Cli {
    /// TOML file with the intent parameters. Without it every parameter has its default.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory every managed path is placed below.
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Export home directories from this host.
    #[arg(long)]
    export_home_dirs: bool,

    /// Mount home directories from this server.
    #[arg(long)]
    home_dir_server: Option<String>,

    /// A client network allowed to mount the exports. Repeat for more; replaces the configured
    /// list.
    #[arg(long = "trusted-net")]
    trusted_nets: Vec<String>,

    /// NFS traffic is carried through an encrypted tunnel.
    #[arg(long)]
    tunnel_secured: bool,

    /// Mount directly instead of through the automounter.
    #[arg(long)]
    no_autofs: bool,

    #[arg(long)]
    exports_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resources the intent resolves to.
    Plan,
    /// Converge this host to the plan.
    Apply,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();
    debug!("{args:?}");

    let mut intent = match &args.config {
        Some(path) => Intent::load(path)?,
        None => Intent::default(),
    };
    if args.export_home_dirs {
        intent.export_home_dirs = true;
    }
    if args.home_dir_server.is_some() {
        intent.home_dir_server = args.home_dir_server.clone();
    }
    if !args.trusted_nets.is_empty() {
        intent.trusted_nets = args.trusted_nets.clone();
    }
    if args.tunnel_secured {
        intent.tunnel_secured = true;
    }
    if args.no_autofs {
        intent.use_autofs = false;
    }

    let facts = HostFacts::from_system()?;
    let plan = plan::build(&intent, &facts)?;

    match args.command {
        Command::Plan => print!("{plan}"),
        Command::Apply => {
            let mut reconciler = Reconciler::new(LocalHost, &args.root);
            if let Some(path) = &args.exports_file {
                reconciler = reconciler.with_exports_file(path);
            }

            let result = reconciler.apply(&plan)?;
            for change in &result.changes {
                println!("changed: {change:?}");
            }
            for failure in &result.failures {
                eprintln!("failed: {failure}");
            }
            if !result.failures.is_empty() {
                return Err(format!("{} resources failed to apply", result.failures.len()).into());
            }
            if result.changes.is_empty() {
                println!("Already converged");
            }
        }
    }

    Ok(())
}
