// SPDX-License-Identifier: GPL-3.0-only

//! elemental-deploy - partitions disks and deploys elemental OS images
//!
//! Runs as root. Settings come from a TOML file, flags override them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use elemental::{
    Config, InstallOptions, dump_source, install, load_settings, mount_partitions,
    partition_and_format_device, unmount_partitions,
};
use elemental_types::{DeploySettings, InstallSpec};

mod cli;
mod logging;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.debug |= cli.debug;
    logging::init(settings.debug, settings.log_file.as_deref());

    tracing::debug!(
        "elemental-deploy v{} using {}",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("elemental-deploy must run as root");
        anyhow::bail!("elemental-deploy must run with root privileges");
    }

    match cli.command {
        Commands::Partition { target } => {
            let cfg = Config::new(settings);
            let mut spec = install_spec(&cfg.settings, target)?;
            partition_and_format_device(&cfg, &mut spec)
                .with_context(|| format!("partitioning {}", spec.target.display()))?;
        }
        Commands::Deploy {
            target,
            source,
            iso,
            cloud_init,
            image_size,
            force,
        } => {
            let cfg = Config::new(settings);
            let mut spec = install_spec(&cfg.settings, target)?;
            let opts = InstallOptions {
                source: source.unwrap_or_default(),
                iso,
                cloud_init,
                image_size,
                force,
            };
            install(&cfg, &mut spec, &opts)
                .with_context(|| format!("installing to {}", spec.target.display()))?;
        }
        Commands::Dump { mut source, target } => {
            let cfg = Config::new(settings);
            dump_source(&cfg, &target, &mut source)
                .with_context(|| format!("dumping {source} to {}", target.display()))?;
            if let Some(digest) = source.digest() {
                println!("{digest}");
            }
        }
        Commands::MountPartitions => {
            let cfg = Config::new(settings);
            let spec = layout(&cfg.settings)?;
            mount_partitions(&cfg, spec.partitions.iter(), &[])?;
        }
        Commands::UnmountPartitions => {
            let cfg = Config::new(settings);
            let spec = layout(&cfg.settings)?;
            unmount_partitions(&cfg, spec.partitions.iter())?;
        }
    }

    Ok(())
}

fn install_spec(settings: &DeploySettings, target: Option<PathBuf>) -> Result<InstallSpec> {
    let Some(target) = target.or_else(|| settings.install.target.clone()) else {
        anyhow::bail!("no target device, pass --target or set install.target");
    };
    Ok(InstallSpec::new(target, &settings.install)?)
}

/// Partition layout of an installed system. Devices are found by label.
fn layout(settings: &DeploySettings) -> Result<InstallSpec> {
    let target = settings.install.target.clone().unwrap_or_default();
    Ok(InstallSpec::new(target, &settings.install)?)
}
