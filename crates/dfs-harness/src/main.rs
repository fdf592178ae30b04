#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use dfs_harness::e2e::{SelfHealConfig, run_self_heal};
use std::env;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("self-heal") => self_heal(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn self_heal(args: &[String]) -> Result<()> {
    let mut config = SelfHealConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--seed" => {
                let raw = args.get(index + 1).context("--seed requires a value")?;
                config.seed = raw.parse().context("invalid --seed value")?;
                index += 2;
            }
            "--files" => {
                let raw = args.get(index + 1).context("--files requires a value")?;
                config.file_count = raw.parse().context("invalid --files value")?;
                index += 2;
            }
            "--bytes" => {
                let raw = args.get(index + 1).context("--bytes requires a value")?;
                config.file_bytes = raw.parse().context("invalid --bytes value")?;
                index += 2;
            }
            "--chance" => {
                let raw = args.get(index + 1).context("--chance requires a value")?;
                config.flip_chance = raw.parse().context("invalid --chance value")?;
                index += 2;
            }
            other => bail!("unknown self-heal option: {other}"),
        }
    }

    let report = run_self_heal(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!(
            "self-heal scenario left {} file(s) unrescued",
            report.corrupted - report.rescued
        );
    }
    Ok(())
}

fn print_usage() {
    println!("dfs-harness — scripted DittoFS scenarios");
    println!();
    println!("USAGE:");
    println!("  dfs-harness self-heal [--seed S] [--files N] [--bytes N] [--chance N]");
    println!();
    println!("SELF-HEAL:");
    println!("  Populates a scratch image, replicates every file, rots the primaries");
    println!("  with the bit-flip injector, then rescues and re-verifies each one.");
    println!("  Emits a JSON report and fails if any detected corruption stays.");
}
