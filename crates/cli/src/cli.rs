//! Command line parsing and dispatch.

use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use fn_error_context::context;

use osimg_blockdev::LoopDevice;
use osimg_content::{
    checksum_path, diff_manifests, walk_tree, ChecksumFlags, ManifestDifference, PathInfo,
};
use osimg_mount::{MountOrchestrator, MountTable};
use osimg_sysops::{HostOps, SystemOps};

use crate::config::{Config, ConfigAccessor, ImagerConfig};

/// How many mountpoints left behind to name in a warning.
const MAX_LISTED_MOUNTS: usize = 20;

/// Options shared by the commands that hash content.
#[derive(Debug, Clone, Copy, clap::Args, PartialEq, Eq)]
pub(crate) struct ChecksumOpts {
    /// Hash regular files and directories as owned by root.
    #[clap(long)]
    pub(crate) canonical_permissions: bool,

    /// Do not read extended attributes.
    #[clap(long)]
    pub(crate) ignore_xattrs: bool,
}

impl ChecksumOpts {
    /// Flags from the command line, falling back to the config file.
    fn flags(&self, config: &ImagerConfig) -> ChecksumFlags {
        ChecksumFlags {
            canonical_permissions: self.canonical_permissions
                || config.checksum.canonical_permissions,
            ignore_xattrs: self.ignore_xattrs || config.checksum.ignore_xattrs,
        }
    }
}

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
pub(crate) enum LoopOpts {
    /// Attach an image to a free loop device and print the device path.
    ///
    /// If the image is already attached, the existing device is printed.
    Attach {
        /// Image path; relative paths are taken from `paths.image_dir`.
        image: Utf8PathBuf,
    },
    /// Detach a loop device.
    Detach {
        /// e.g. /dev/loop0
        device: Utf8PathBuf,
    },
    /// Print the file backing a loop device.
    BackingFile {
        /// e.g. /dev/loop0
        device: Utf8PathBuf,
    },
}

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
pub(crate) enum ConfigOpts {
    /// Print a value by dotted key, e.g. `paths.mount_dir`.
    Get {
        /// The key to look up.
        key: String,
    },
}

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Print the content checksum of a file, directory or symlink.
    Checksum {
        /// The path to hash; a final symlink is not followed.
        path: Utf8PathBuf,
        #[clap(flatten)]
        opts: ChecksumOpts,
    },
    /// Describe every node under a directory.
    Manifest {
        /// The tree to walk.
        root: Utf8PathBuf,
        /// Output JSON.
        #[clap(long)]
        json: bool,
        #[clap(flatten)]
        opts: ChecksumOpts,
    },
    /// Compare two trees or JSON manifests; fails if they differ.
    DiffManifest {
        /// A directory, or a manifest written by `manifest --json`.
        left: Utf8PathBuf,
        /// A directory, or a manifest written by `manifest --json`.
        right: Utf8PathBuf,
        /// Output JSON.
        #[clap(long)]
        json: bool,
        #[clap(flatten)]
        opts: ChecksumOpts,
    },
    /// List mounts.
    Mounts {
        /// Only list mounts at or below this path.
        #[clap(long)]
        under: Option<Utf8PathBuf>,
        /// Output JSON.
        #[clap(long)]
        json: bool,
    },
    /// Fail if anything is mounted at or below a directory.
    CheckMounts {
        /// The directory to check.
        dir: Utf8PathBuf,
    },
    /// Loop device operations.
    #[clap(subcommand)]
    Loop(LoopOpts),
    /// Run a program chrooted into a root filesystem, with the pseudo
    /// filesystems and configured caches mounted for its duration.
    RunChroot {
        /// Root filesystem; relative paths are taken from `paths.mount_dir`.
        root: Utf8PathBuf,
        /// Program to run inside the root.
        program: String,
        /// Arguments for the program.
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Query the configuration.
    #[clap(subcommand)]
    Config(ConfigOpts),
}

/// Inspect and drive the pieces of an OS image build.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "osimg", version)]
pub(crate) struct Cli {
    /// Configuration file; defaults to `$OSIMG_CONFIG`, then
    /// `/etc/osimg/config.toml`.
    #[clap(long, global = true)]
    pub(crate) config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) opt: Opt,
}

fn resolve(base: impl FnOnce(&Utf8Path) -> Utf8PathBuf, path: Utf8PathBuf) -> Utf8PathBuf {
    if path.is_absolute() {
        path
    } else {
        base(&path)
    }
}

fn write_json<T: serde::Serialize + ?Sized>(v: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, v)?;
    writeln!(out)?;
    Ok(())
}

/// A manifest from a directory walk, or from JSON if `path` is a file.
#[context("Loading manifest from {path}")]
fn load_manifest(path: &Utf8Path, flags: ChecksumFlags) -> Result<Vec<PathInfo>> {
    if path.is_dir() {
        return Ok(walk_tree(path, flags)?);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn print_differences(diffs: &[ManifestDifference]) {
    for d in diffs {
        let kind = match d {
            ManifestDifference::Added { .. } => "added",
            ManifestDifference::Removed { .. } => "removed",
            ManifestDifference::Changed { .. } => "changed",
        };
        println!("{kind} {}", d.path());
    }
}

/// Attach `image`, or reuse the device it is already attached to.
pub(crate) fn attach_image<S: SystemOps + Clone>(ops: S, image: &Utf8Path) -> Result<Utf8PathBuf> {
    if let Some(dev) = LoopDevice::find_by_backing_file(&ops, image)? {
        if let Some(device) = dev.device_path() {
            tracing::info!("{image} is already attached to {device}");
            return Ok(device);
        }
    }
    let dev = LoopDevice::for_image(ops, image);
    Ok(dev.attach()?)
}

fn bind_caches<S: SystemOps>(
    orch: &MountOrchestrator<S>,
    config: &ImagerConfig,
    root: &Utf8Path,
) -> Result<()> {
    if let Some(src) = config.paths.distfiles_dir.as_deref() {
        orch.bind_distfiles(src, root)?;
    }
    if let Some(src) = config.paths.binpkgs_dir.as_deref() {
        orch.bind_binpkgs(src, root)?;
    }
    Ok(())
}

fn unbind_caches<S: SystemOps>(
    orch: &MountOrchestrator<S>,
    config: &ImagerConfig,
    root: &Utf8Path,
) -> Result<()> {
    // Both are attempted even if the first fails
    let binpkgs = match config.paths.binpkgs_dir {
        Some(_) => orch.umount_binpkgs(root),
        None => Ok(()),
    };
    let distfiles = match config.paths.distfiles_dir {
        Some(_) => orch.umount_distfiles(root),
        None => Ok(()),
    };
    binpkgs.and(distfiles)
}

/// Mount the pseudo filesystems and caches into `root`, run `program` there
/// and tear everything down again, whether or not it succeeded.
pub(crate) fn run_chroot_session<S: SystemOps>(
    orch: &MountOrchestrator<S>,
    config: &ImagerConfig,
    root: &Utf8Path,
    program: &str,
    args: &[String],
) -> Result<()> {
    let (record, r) = orch.setup_common_rootfs_mounts(root);
    let r = r
        .and_then(|()| bind_caches(orch, config, root))
        .and_then(|()| orch.run_in_chroot(root, program, args));
    let unbound = unbind_caches(orch, config, root);
    let report = orch.cleanup_mounts(&record);
    if !report.is_clean() {
        tracing::warn!(
            "Left mounted under {root}: {}",
            osimg_utils::format_path_list(
                report.failed.iter().map(|p| p.as_path()),
                MAX_LISTED_MOUNTS
            )
        );
    }
    match (r, unbound) {
        (Err(e), Err(u)) => {
            tracing::warn!("Unmounting caches: {u:#}");
            Err(e)
        }
        (r, unbound) => r.and(unbound),
    }
}

/// Execute the parsed command line.
pub(crate) fn run_from_opt(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let imager = &config.imager;
    match cli.opt {
        Opt::Checksum { path, opts } => {
            let r = checksum_path(&path, opts.flags(imager))?;
            println!("{r}");
        }
        Opt::Manifest { root, json, opts } => {
            let m = walk_tree(&root, opts.flags(imager))?;
            if json {
                write_json(&m)?;
            } else {
                for e in &m {
                    let detail = e
                        .checksum
                        .as_deref()
                        .or(e.link_target.as_deref())
                        .unwrap_or("-");
                    println!("{:o} {}:{} {} {detail}", e.perms, e.uid, e.gid, e.path);
                }
            }
        }
        Opt::DiffManifest {
            left,
            right,
            json,
            opts,
        } => {
            let flags = opts.flags(imager);
            let diffs = diff_manifests(
                &load_manifest(&left, flags)?,
                &load_manifest(&right, flags)?,
            );
            if json {
                write_json(&diffs)?;
            } else {
                print_differences(&diffs);
            }
            if !diffs.is_empty() {
                anyhow::bail!("{} difference(s) between {left} and {right}", diffs.len());
            }
        }
        Opt::Mounts { under, json } => {
            let table = MountTable::host();
            let entries = match under {
                Some(p) => table.find_under(&p)?,
                None => table.entries()?,
            };
            if json {
                write_json(&entries)?;
            } else {
                for e in &entries {
                    println!("{}\t{}\t{}", e.mountpoint, e.fstype, e.source);
                }
            }
        }
        Opt::CheckMounts { dir } => {
            MountOrchestrator::host().ensure_no_active_mounts(&dir)?;
        }
        Opt::Loop(LoopOpts::Attach { image }) => {
            let image = resolve(|p| imager.in_image_dir(p), image);
            let image = image
                .canonicalize_utf8()
                .with_context(|| format!("Resolving {image}"))?;
            println!("{}", attach_image(HostOps, &image)?);
        }
        Opt::Loop(LoopOpts::Detach { device }) => {
            LoopDevice::existing(device).detach()?;
        }
        Opt::Loop(LoopOpts::BackingFile { device }) => {
            println!("{}", LoopDevice::existing(device).backing_file());
        }
        Opt::RunChroot {
            root,
            program,
            args,
        } => {
            let root = resolve(|p| imager.in_mount_dir(p), root);
            run_chroot_session(&MountOrchestrator::host(), imager, &root, &program, &args)?;
        }
        Opt::Config(ConfigOpts::Get { key }) => {
            let v = config
                .get_string(&key)
                .or_else(|| config.get_bool(&key).map(|b| b.to_string()))
                .with_context(|| format!("No string or boolean value for {key}"))?;
            println!("{v}");
        }
    }
    Ok(())
}
