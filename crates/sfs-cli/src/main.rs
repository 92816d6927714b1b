#![forbid(unsafe_code)]
//! slicefs: mount a contiguous byte range of a file as its own file.
//!
//! The window is chosen either with explicit `offset`/`sizelimit` options or
//! by naming a partition of the source image, in which case the partition
//! table supplies the pair. All configuration errors are reported through a
//! single exit path that also removes a mountpoint file this invocation
//! created.

use anyhow::{Context, Result, bail};
use sfs_core::{WindowOptions, WindowedFile, parse_byte_size};
use sfs_part::PartitionEntry;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("slicefs: error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = match parse_args(&args)? {
        Invocation::Help => {
            print_usage();
            return Ok(());
        }
        Invocation::Version => {
            eprintln!("slicefs version {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Invocation::Run(config) => config,
    };

    if config.list_partitions {
        return list_partitions_cmd(&config);
    }
    mount_cmd(&config)
}

fn print_usage() {
    eprintln!("usage: slicefs <source> <mountpoint> [options]");
    eprintln!();
    eprintln!("general options:");
    eprintln!("    -o opt[,opt...]      mount options");
    eprintln!("    -h, --help           print help");
    eprintln!("    -V, --version        print version");
    eprintln!();
    eprintln!("slicefs options:");
    eprintln!("    -o offset=NBYTES     window start within the source file");
    eprintln!("    -o sizelimit=NBYTES  window size ceiling");
    eprintln!("    -o ro                mount read-only");
    eprintln!("    -o nonempty          allow a non-empty mountpoint file");
    eprintln!("    -o allow_other       allow access by other users");
    eprintln!("    -p, --partition NUM  take the window from partition NUM (1-based)");
    eprintln!("    --list-partitions    print the source's partition table and exit");
    eprintln!("    --json               emit the partition listing as JSON");
    eprintln!();
    eprintln!("NBYTES accepts an optional suffix: K=2^10, M=2^20, G=2^30, T=2^40, B=1.");
}

// ── Option parsing ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Config {
    source: PathBuf,
    mountpoint: Option<PathBuf>,
    offset: Option<u64>,
    size_limit: Option<u64>,
    read_only: bool,
    nonempty: bool,
    allow_other: bool,
    partition: Option<usize>,
    list_partitions: bool,
    json: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Help,
    Version,
    Run(Config),
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config = Config::default();
    let mut positionals: Vec<&str> = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-V" | "--version" => return Ok(Invocation::Version),
            "-o" => {
                let value = iter
                    .next()
                    .context("-o requires a comma-separated option list")?;
                for opt in value.split(',').filter(|opt| !opt.is_empty()) {
                    apply_mount_option(&mut config, opt)?;
                }
            }
            "-p" | "--partition" => {
                let value = iter.next().context("--partition requires a number")?;
                let number: usize = value
                    .parse()
                    .with_context(|| format!("invalid partition number [{value}]"))?;
                if number == 0 {
                    bail!("partition numbers are 1-based");
                }
                config.partition = Some(number);
            }
            "--offset" => {
                let value = iter.next().context("--offset requires a byte value")?;
                config.offset = Some(parse_byte_size(value)?);
            }
            "--sizelimit" => {
                let value = iter.next().context("--sizelimit requires a byte value")?;
                config.size_limit = Some(parse_byte_size(value)?);
            }
            "--read-only" | "--ro" => config.read_only = true,
            "--nonempty" => config.nonempty = true,
            "--allow-other" => config.allow_other = true,
            "--list-partitions" => config.list_partitions = true,
            "--json" => config.json = true,
            other if other.starts_with('-') => {
                bail!("unknown option [{other}]");
            }
            other => positionals.push(other),
        }
    }

    let mut positionals = positionals.into_iter();
    match positionals.next() {
        Some(source) if !source.is_empty() => config.source = PathBuf::from(source),
        Some(_) => bail!("source must not be an empty string"),
        None => bail!("source not specified"),
    }
    match positionals.next() {
        Some(mountpoint) if !mountpoint.is_empty() => {
            config.mountpoint = Some(PathBuf::from(mountpoint));
        }
        Some(_) => bail!("mount-point must not be an empty string"),
        None => {
            if !config.list_partitions {
                bail!("mount-point not specified");
            }
        }
    }
    if let Some(extra) = positionals.next() {
        bail!("invalid additional argument [{extra}]");
    }

    if config.partition.is_some() && (config.offset.is_some() || config.size_limit.is_some()) {
        bail!("--partition cannot be combined with offset or sizelimit");
    }
    if config.json && !config.list_partitions {
        bail!("--json only applies to --list-partitions");
    }

    Ok(Invocation::Run(config))
}

fn apply_mount_option(config: &mut Config, opt: &str) -> Result<()> {
    match opt.split_once('=') {
        Some(("offset", value)) => config.offset = Some(parse_byte_size(value)?),
        Some(("sizelimit", value)) => config.size_limit = Some(parse_byte_size(value)?),
        None if opt == "ro" => config.read_only = true,
        None if opt == "rw" => config.read_only = false,
        None if opt == "nonempty" => config.nonempty = true,
        None if opt == "allow_other" => config.allow_other = true,
        _ => bail!("unknown mount option [{opt}]"),
    }
    Ok(())
}

// ── Partition listing ───────────────────────────────────────────────────────

fn list_partitions_cmd(config: &Config) -> Result<()> {
    let entries = sfs_part::list_partitions(&config.source)
        .with_context(|| format!("couldn't read partition table of {}", config.source.display()))?;

    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize partition listing")?
        );
    } else {
        print!("{}", render_table(&entries));
    }
    Ok(())
}

fn render_table(entries: &[PartitionEntry]) -> String {
    let mut out = String::from("Number:Name:UUID:Type:Offset:Size\n");
    for entry in entries {
        out.push_str(&format!(
            "{}:{}:{}:{}:{}:{}\n",
            entry.number, entry.name, entry.uuid, entry.kind, entry.offset, entry.length
        ));
    }
    out
}

// ── Mounting ────────────────────────────────────────────────────────────────

fn mount_cmd(config: &Config) -> Result<()> {
    let mountpoint = config
        .mountpoint
        .as_deref()
        .context("mount-point not specified")?;

    let (offset, size_limit) = resolve_window(config)?;

    // Claim the mountpoint before touching the source so a bad mountpoint
    // never leaves a half-configured mount behind. The guard removes a file
    // we created, whether the mount succeeds, fails, or is unmounted.
    let _guard = prepare_mountpoint(mountpoint, config.nonempty)?;

    let window = WindowedFile::open(
        &config.source,
        &WindowOptions {
            offset,
            size_limit,
            read_only: config.read_only,
        },
    )
    .with_context(|| format!("couldn't open file [{}]", config.source.display()))?;

    info!(
        source = %config.source.display(),
        mountpoint = %mountpoint.display(),
        offset,
        capacity = window.capacity(),
        read_only = config.read_only,
        "mounting window"
    );

    let options = sfs_fuse::MountOptions {
        read_only: config.read_only,
        allow_other: config.allow_other,
        auto_unmount: true,
    };
    sfs_fuse::mount(Arc::new(window), mountpoint, &options)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;

    Ok(())
}

/// Turn the configuration into the window's `(offset, size_limit)` pair,
/// consulting the partition table when a partition index is given.
fn resolve_window(config: &Config) -> Result<(u64, Option<u64>)> {
    match config.partition {
        None => Ok((config.offset.unwrap_or(0), config.size_limit)),
        Some(number) => {
            let entry = sfs_part::get_partition_info(&config.source, number - 1)
                .with_context(|| {
                    format!(
                        "couldn't resolve partition {number} of {}",
                        config.source.display()
                    )
                })?;
            info!(
                number,
                offset = entry.offset,
                length = entry.length,
                kind = %entry.kind,
                "resolved partition"
            );
            Ok((entry.offset, Some(entry.length)))
        }
    }
}

/// Removes a mountpoint file that this invocation created.
#[derive(Debug)]
struct MountpointGuard {
    path: PathBuf,
    created: bool,
}

impl Drop for MountpointGuard {
    fn drop(&mut self) {
        if self.created {
            if let Err(err) = fs::remove_file(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "couldn't remove created mountpoint"
                );
            }
        }
    }
}

/// Validate the mountpoint: it must be a regular, empty file (non-empty is
/// allowed with `nonempty`), or be creatable as one.
fn prepare_mountpoint(path: &Path, nonempty: bool) -> Result<MountpointGuard> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.is_file() {
                bail!("mount-point [{}] is not a regular file", path.display());
            }
            if meta.len() != 0 && !nonempty {
                bail!("mount-point [{}] is not an empty file", path.display());
            }
            Ok(MountpointGuard {
                path: path.to_owned(),
                created: false,
            })
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            fs::File::create(path)
                .with_context(|| format!("couldn't create mount-point [{}]", path.display()))?;
            Ok(MountpointGuard {
                path: path.to_owned(),
                created: true,
            })
        }
        Err(err) => Err(err)
            .with_context(|| format!("couldn't open mount-point [{}]", path.display())),
    }
}
