#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use dfs_block::{BufCache, FileByteDevice};
use dfs_ditto::DittoManager;
use dfs_error::DfsError;
use dfs_fs::{
    DEFAULT_INODE_COUNT, DEFAULT_LOG_BLOCKS, DEFAULT_TOTAL_BLOCKS, Fs, FsOptions, mkfs,
};
use dfs_inject::Injector;
use dfs_ondisk::InodeType;
use dfs_types::{DeviceId, InodeNumber, SECTOR_SIZE};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const IMAGE_DEV: DeviceId = DeviceId(0);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .downcast_ref::<DfsError>()
            .map_or(1, DfsError::to_errno);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(img) = args.next() else {
                bail!("mkfs requires an image path");
            };
            let rest: Vec<String> = args.collect();
            mkfs_cmd(Path::new(&img), &rest)
        }
        "put" => {
            let Some(img) = args.next() else {
                bail!("put requires <img> <src> <dst-path>");
            };
            let Some(src) = args.next() else {
                bail!("put requires <img> <src> <dst-path>");
            };
            let Some(dst) = args.next() else {
                bail!("put requires <img> <src> <dst-path>");
            };
            let rest: Vec<String> = args.collect();
            put_cmd(Path::new(&img), Path::new(&src), &dst, &rest)
        }
        "ls" => {
            let Some(img) = args.next() else {
                bail!("ls requires <img> <path>");
            };
            let Some(path) = args.next() else {
                bail!("ls requires <img> <path>");
            };
            let rest: Vec<String> = args.collect();
            ls_cmd(Path::new(&img), &path, &rest)
        }
        "stat" => {
            let Some(img) = args.next() else {
                bail!("stat requires <img> <path|--inum N>");
            };
            let target = next_target(&mut args, "stat")?;
            let rest: Vec<String> = args.collect();
            stat_cmd(Path::new(&img), &target, &rest)
        }
        "cat" => {
            let Some(img) = args.next() else {
                bail!("cat requires <img> <path|--inum N>");
            };
            let target = next_target(&mut args, "cat")?;
            let rest: Vec<String> = args.collect();
            cat_cmd(Path::new(&img), &target, &rest)
        }
        "duplicate" => {
            let Some(img) = args.next() else {
                bail!("duplicate requires <img> <path> <count>");
            };
            let Some(path) = args.next() else {
                bail!("duplicate requires <img> <path> <count>");
            };
            let Some(count_raw) = args.next() else {
                bail!("duplicate requires <img> <path> <count>");
            };
            let count: u8 = count_raw
                .parse()
                .with_context(|| format!("invalid replica count: {count_raw}"))?;
            let rest: Vec<String> = args.collect();
            duplicate_cmd(Path::new(&img), &path, count, &rest)
        }
        "backup" => {
            let Some(img) = args.next() else {
                bail!("backup requires an image path");
            };
            let rest: Vec<String> = args.collect();
            backup_cmd(Path::new(&img), &rest)
        }
        "verify" => {
            let Some(img) = args.next() else {
                bail!("verify requires <img> <path|--inum N>");
            };
            let target = next_target(&mut args, "verify")?;
            let rest: Vec<String> = args.collect();
            verify_cmd(Path::new(&img), &target, &rest)
        }
        "rescue" => {
            let Some(img) = args.next() else {
                bail!("rescue requires <img> <path|--inum N> [--slot 1|2]");
            };
            let target = next_target(&mut args, "rescue")?;
            let rest: Vec<String> = args.collect();
            rescue_cmd(Path::new(&img), &target, &rest)
        }
        "makebig" => {
            let Some(img) = args.next() else {
                bail!("makebig requires an image path");
            };
            let rest: Vec<String> = args.collect();
            makebig_cmd(Path::new(&img), &rest)
        }
        "inject" => {
            let Some(img) = args.next() else {
                bail!("inject requires <img> <inum>... <chance>");
            };
            let rest: Vec<String> = args.collect();
            inject_cmd(Path::new(&img), &rest)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("dfs-cli\n");
    println!("USAGE:");
    println!("  dfs-cli mkfs <img> [--blocks N] [--inodes N] [--log N]");
    println!("  dfs-cli put <img> <src> <dst-path>");
    println!("  dfs-cli ls <img> <path>");
    println!("  dfs-cli stat <img> <path|--inum N> [--json]");
    println!("  dfs-cli cat <img> <path|--inum N> [--force]");
    println!("  dfs-cli duplicate <img> <path> <count>");
    println!("  dfs-cli backup <img>");
    println!("  dfs-cli verify <img> <path|--inum N>");
    println!("  dfs-cli rescue <img> <path|--inum N> [--slot 1|2]");
    println!("  dfs-cli makebig <img> [--seed S]");
    println!("  dfs-cli inject <img> <inum>... <chance> [--seed S] [--json]");
    println!();
    println!("Commands that mount an image also accept --config <file> (JSON FsOptions).");
}

/// A file addressed by path, or by raw inode number for things paths cannot
/// reach (replicas, damaged directories).
enum Target {
    Path(String),
    Inum(InodeNumber),
}

impl Target {
    fn resolve(&self, mgr: &DittoManager) -> Result<InodeNumber> {
        match self {
            Target::Path(path) => Ok(mgr.fs().resolve(path)?),
            Target::Inum(inum) => Ok(*inum),
        }
    }
}

fn next_target(args: &mut impl Iterator<Item = String>, command: &str) -> Result<Target> {
    let Some(first) = args.next() else {
        bail!("{command} requires a path or --inum <n>");
    };
    if first == "--inum" {
        let Some(raw) = args.next() else {
            bail!("--inum requires an inode number");
        };
        let inum: u32 = raw
            .parse()
            .with_context(|| format!("invalid inode number: {raw}"))?;
        Ok(Target::Inum(InodeNumber(inum)))
    } else {
        Ok(Target::Path(first))
    }
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == name)
        .and_then(|idx| args.get(idx + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|arg| arg == name)
}

fn parse_flag<T>(args: &[String], name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match flag_value(args, name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw}")),
        None => Ok(default),
    }
}

fn load_options(rest: &[String]) -> Result<FsOptions> {
    let Some(path) = flag_value(rest, "--config") else {
        return Ok(FsOptions::default());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {path}"))
}

fn open_image(path: &Path, rest: &[String]) -> Result<DittoManager> {
    let options = load_options(rest)?;
    let device = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let cache = Arc::new(BufCache::new(options.cache_capacity));
    let fs = Fs::mount(cache, IMAGE_DEV, Arc::new(device), options)
        .with_context(|| format!("failed to mount image {}", path.display()))?;
    Ok(DittoManager::new(Arc::new(fs)))
}

fn mkfs_cmd(path: &Path, rest: &[String]) -> Result<()> {
    let blocks: u32 = parse_flag(rest, "--blocks", DEFAULT_TOTAL_BLOCKS)?;
    let inodes: u32 = parse_flag(rest, "--inodes", DEFAULT_INODE_COUNT)?;
    let log: u32 = parse_flag(rest, "--log", DEFAULT_LOG_BLOCKS)?;

    let device = FileByteDevice::create(path, u64::from(blocks) * SECTOR_SIZE as u64)
        .with_context(|| format!("failed to create image {}", path.display()))?;
    let sb = mkfs(&device, blocks, inodes, log)?;
    println!(
        "formatted {} ({} blocks, {} inodes, {}-block log)",
        path.display(),
        sb.total_blocks,
        sb.inode_count,
        sb.log_blocks
    );
    println!(
        "inode table at {}, bitmap at {}, data at {}, log at {}",
        sb.inode_start, sb.bitmap_start, sb.data_start, sb.log_start
    );
    Ok(())
}

fn put_cmd(img: &Path, src: &Path, dst: &str, rest: &[String]) -> Result<()> {
    let data = std::fs::read(src).with_context(|| format!("failed to read {}", src.display()))?;
    let mgr = open_image(img, rest)?;
    let inum = mgr.import(dst, &data)?;
    println!("imported {} bytes into {dst} (inode {inum})", data.len());
    Ok(())
}

fn ls_cmd(img: &Path, path: &str, rest: &[String]) -> Result<()> {
    let mgr = open_image(img, rest)?;
    let fs = mgr.fs();
    let inum = fs.resolve(path)?;
    let node = fs.inode(inum);
    let guard = node.lock(fs)?;
    let entries = guard.entries()?;
    drop(guard);

    for entry in entries {
        let record = fs.read_record(entry.inum)?;
        println!(
            "{:<14} {:>4} {:<13} {:>8}",
            entry.name,
            entry.inum.0,
            record.itype.to_string(),
            record.size
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatOutput {
    inode: u32,
    itype: String,
    nlink: u16,
    size: u32,
    children: [u32; 2],
    stored_checksum: u32,
    computed_checksum: u32,
    healthy: bool,
}

fn stat_cmd(img: &Path, target: &Target, rest: &[String]) -> Result<()> {
    let mgr = open_image(img, rest)?;
    let inum = target.resolve(&mgr)?;
    let node = mgr.fs().inode(inum);
    let guard = node.lock(mgr.fs())?;
    let computed = guard.content_checksum()?;
    let record = guard.record();
    let output = StatOutput {
        inode: inum.0,
        itype: record.itype.to_string(),
        nlink: record.nlink,
        size: record.size,
        children: record.children(),
        stored_checksum: record.checksum,
        computed_checksum: computed,
        healthy: computed == record.checksum,
    };
    drop(guard);

    if has_flag(rest, "--json") {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("inode: {}", output.inode);
        println!("type: {}", output.itype);
        println!("nlink: {}", output.nlink);
        println!("size: {}", output.size);
        println!("children: {} {}", output.children[0], output.children[1]);
        println!("stored_checksum: {:#010x}", output.stored_checksum);
        println!("computed_checksum: {:#010x}", output.computed_checksum);
        println!("healthy: {}", output.healthy);
    }
    Ok(())
}

fn cat_cmd(img: &Path, target: &Target, rest: &[String]) -> Result<()> {
    let mgr = open_image(img, rest)?;
    let inum = target.resolve(&mgr)?;
    let data = if has_flag(rest, "--force") {
        mgr.read_forced_inode(inum)?
    } else {
        mgr.read_verified_inode(inum)?
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

fn duplicate_cmd(img: &Path, path: &str, count: u8, rest: &[String]) -> Result<()> {
    let mgr = open_image(img, rest)?;
    let replicas = mgr.duplicate(path, count)?;
    for replica in &replicas {
        println!("placed replica inode {replica} for {path}");
    }
    Ok(())
}

fn backup_cmd(img: &Path, rest: &[String]) -> Result<()> {
    let mgr = open_image(img, rest)?;
    let fs = mgr.fs();
    let root = fs.inode(InodeNumber::ROOT);
    let guard = root.lock(fs)?;
    let entries = guard.entries()?;
    drop(guard);

    let mut replicated = 0usize;
    for entry in entries {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let record = fs.read_record(entry.inum)?;
        if record.itype != InodeType::File || record.children() != [0, 0] {
            continue;
        }
        let path = format!("/{}", entry.name);
        mgr.duplicate(&path, 2)?;
        println!("replicated {path} x2");
        replicated += 1;
    }
    println!("replicated {replicated} files");
    Ok(())
}

fn verify_cmd(img: &Path, target: &Target, rest: &[String]) -> Result<()> {
    let mgr = open_image(img, rest)?;
    let inum = target.resolve(&mgr)?;
    let checksum = mgr.verify_inode(inum)?;
    println!("inode {inum} ok (checksum {checksum:#010x})");
    Ok(())
}

fn rescue_cmd(img: &Path, target: &Target, rest: &[String]) -> Result<()> {
    let slot: u8 = parse_flag(rest, "--slot", 1)?;
    if !(1..=2).contains(&slot) {
        bail!("--slot must be 1 or 2");
    }
    let mgr = open_image(img, rest)?;
    let inum = target.resolve(&mgr)?;
    mgr.rescue_inode(inum, slot - 1)?;
    println!("rescued inode {inum} from replica slot {slot}");
    Ok(())
}

fn makebig_cmd(img: &Path, rest: &[String]) -> Result<()> {
    let seed: u64 = parse_flag(rest, "--seed", 1)?;
    let mgr = open_image(img, rest)?;
    for (name, blocks) in [("/big", 15usize), ("/medium", 10), ("/small", 5)] {
        let data = fixture_bytes(blocks, seed);
        let inum = mgr.import(name, &data)?;
        println!("wrote {name} ({} bytes, inode {inum})", data.len());
    }
    Ok(())
}

/// Seeded rolling-alphabet content, distinct per byte offset so torn or
/// crossed blocks are visible in a diff.
fn fixture_bytes(blocks: usize, seed: u64) -> Vec<u8> {
    (0..blocks * SECTOR_SIZE)
        .map(|i| b'a' + ((i as u64).wrapping_mul(seed) % 26) as u8)
        .collect()
}

fn inject_cmd(img: &Path, rest: &[String]) -> Result<()> {
    let seed: u64 = parse_flag(rest, "--seed", 0)?;
    let json = has_flag(rest, "--json");

    let mut positionals = Vec::new();
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        if arg == "--seed" {
            iter.next();
        } else if arg == "--json" {
            continue;
        } else if arg.starts_with("--") {
            bail!("unknown inject option: {arg}");
        } else {
            positionals.push(arg.as_str());
        }
    }
    let Some((chance_raw, inums_raw)) = positionals.split_last() else {
        bail!("inject requires <inum>... <chance>");
    };
    if inums_raw.is_empty() {
        bail!("inject requires at least one inode number");
    }
    let chance: i64 = chance_raw
        .parse()
        .with_context(|| format!("invalid flip chance: {chance_raw}"))?;

    let device = FileByteDevice::open(img)
        .with_context(|| format!("failed to open image {}", img.display()))?;
    let mut injector = Injector::open(&device, seed)?;
    let mut reports = Vec::new();
    for raw in inums_raw {
        let inum: u32 = raw
            .parse()
            .with_context(|| format!("invalid inode number: {raw}"))?;
        reports.push(injector.inject(InodeNumber(inum), chance)?);
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("serialize output")?
        );
    } else {
        for report in &reports {
            println!(
                "inode {}: flipped {} of {} bits across {} blocks",
                report.inode,
                report.bits_flipped,
                report.bits_examined,
                report.affected_blocks.len()
            );
        }
    }
    Ok(())
}
