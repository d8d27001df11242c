use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, warn};

mod board;
mod config;
mod digest;
mod fdt;
mod firmware;
mod fit;
mod patch;
#[cfg(test)]
mod testutil;

use crate::board::BoardReport;
use crate::config::{BoardProfile, PatchConfig};
use crate::firmware::Firmware;

#[derive(Debug, Clone, Parser)]
struct CliPatch {
    /// Board profile config (JSON)
    #[arg(long, default_value = config::DEFAULT_CONFIG)]
    config: PathBuf,

    /// Board name; when omitted every board in the config is processed
    #[arg(short, long)]
    board: Option<String>,

    /// Output path (single-board runs only; default: <board>-<input name>)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Force a DTB index when the profile omits one
    #[arg(long)]
    dtb_index: Option<usize>,

    /// Leave FIT hash values untouched
    #[arg(long, default_value_t = false)]
    no_fit_hash: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// List embedded DTBs and their /leds nodes
    #[command(name = "list")]
    List,

    /// Patch LED gpios per board profile and re-sync FIT hashes
    #[command(name = "patch")]
    Patch(CliPatch),
}

#[derive(Debug, Clone, Parser)]
struct CliArgs {
    firmware_path: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

fn list(firmware: Firmware) -> Result<()> {
    let blobs = fdt::scan(&firmware);
    if blobs.is_empty() {
        println!("No DTB found");
        return Ok(());
    }
    for blob in &blobs {
        println!(
            "[DTB {}] offset={:#x} total={} version={}",
            blob.index,
            blob.offset,
            blob.len(),
            blob.header.version
        );
        match fdt::walk(&firmware, blob) {
            Ok(tree) => {
                for (path, cells) in tree.led_gpios(&firmware) {
                    println!(
                        "  {path} gpios = <{:#x} {:#x} {:#x}>",
                        cells[0], cells[1], cells[2]
                    );
                }
            }
            Err(err) => warn!("DTB {} not parseable: {err:#}", blob.index),
        }
    }
    Ok(())
}

fn patch(firmware: Firmware, firmware_path: &Path, args: CliPatch) -> Result<()> {
    let blobs = fdt::scan(&firmware);
    ensure!(!blobs.is_empty(), "No DTB found in {}", firmware_path.display());

    let config = PatchConfig::load(&args.config)?;
    let selected: Vec<(String, BoardProfile)> = match &args.board {
        Some(name) => vec![(name.clone(), config.board(name)?.clone())],
        None => {
            let mut boards = vec![];
            for (name, _) in config.boards() {
                match config.board(name) {
                    Ok(profile) => boards.push((name.to_string(), profile.clone())),
                    Err(err) => warn!("Skipping invalid board profile: {err:#}"),
                }
            }
            ensure!(
                !boards.is_empty(),
                "No valid board profiles in {}",
                args.config.display()
            );
            boards
        }
    };
    ensure!(
        selected.len() == 1 || args.output.is_none(),
        "--output cannot be used when processing multiple boards"
    );

    let mut failures = 0usize;
    let mut written = vec![];
    for (name, profile) in &selected {
        match patch_one(&firmware, firmware_path, &blobs, name, profile, &args) {
            Ok(out_path) => written.push(out_path),
            Err(err) => {
                error!("Board '{name}' failed: {err:#}");
                failures += 1;
            }
        }
    }

    if selected.len() > 1 {
        println!(
            "Processed {} board(s), wrote {} file(s)",
            selected.len(),
            written.len()
        );
        for path in &written {
            println!("  {}", path.display());
        }
    }
    ensure!(failures == 0, "{failures} board(s) failed");
    ensure!(!written.is_empty(), "no output produced");
    Ok(())
}

/// One board's whole transform over its own copy of the image, so a
/// failure here never contaminates another board's output.
fn patch_one(
    original: &Firmware,
    firmware_path: &Path,
    blobs: &[fdt::DtbBlob],
    name: &str,
    profile: &BoardProfile,
    args: &CliPatch,
) -> Result<PathBuf> {
    let mut fw = original.clone();
    let report = board::patch_board(
        &mut fw,
        blobs,
        name,
        profile,
        args.dtb_index,
        !args.no_fit_hash,
    )?;
    print_report(&report);
    ensure!(report.changed() > 0, "no rule changed any bytes");

    let out_path = match &args.output {
        Some(path) => path.clone(),
        None => default_output(name, firmware_path),
    };
    fw.write(&out_path, firmware_path)?;
    println!(
        "Wrote patched firmware: {} (changes: {})",
        out_path.display(),
        report.changed()
    );
    Ok(out_path)
}

fn default_output(board: &str, firmware_path: &Path) -> PathBuf {
    let base = firmware_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware.bin".to_string());
    firmware_path.with_file_name(format!("{board}-{base}"))
}

fn print_report(report: &BoardReport) {
    println!("Board '{}' on DTB {}:", report.board, report.dtb_index);
    for rule in &report.rules {
        println!("  /leds/{}: {}", rule.led, rule.outcome);
    }
    for hash in &report.hashes {
        println!("  {hash}");
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();
    let firmware = Firmware::read(&args.firmware_path).context("Could not open firmware")?;
    match args.command {
        CliCommand::List => list(firmware),
        CliCommand::Patch(patch_args) => patch(firmware, &args.firmware_path, patch_args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_is_sibling_of_input() {
        let out = default_output("komi-a31", Path::new("/tmp/images/firmware.bin"));
        assert_eq!(out, PathBuf::from("/tmp/images/komi-a31-firmware.bin"));
    }

    #[test]
    fn cli_parses_patch_flags() {
        let args = CliArgs::parse_from([
            "dtbpatch",
            "fw.bin",
            "patch",
            "--config",
            "boards.json",
            "--board",
            "komi-a31",
            "--no-fit-hash",
        ]);
        match args.command {
            CliCommand::Patch(p) => {
                assert_eq!(p.board.as_deref(), Some("komi-a31"));
                assert!(p.no_fit_hash);
                assert_eq!(p.dtb_index, None);
            }
            _ => panic!("expected patch subcommand"),
        }
    }
}
