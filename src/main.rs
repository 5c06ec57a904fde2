//! Entry point for the GBA ARM7TDMI assembler/disassembler CLI.
//!
//! Subcommands: `make` assembles a source tree to a raw binary, `dis`
//! disassembles a binary back to text, `watch` reassembles on every save,
//! `run` hands a built image to an external emulator, and `itest` runs a
//! directory of instruction test fixtures.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use asm::cartridge_header::CartridgeHeader;
use asm::disasm;
use asm::driver::{Driver, FsReader};
use asm::error::ErrorPolicy;
use asm::watch::{ChangeSource, Coordinator, OsWatcher, RebuildOutcome};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gba-asm", about = "Assembler and disassembler for the ARM7TDMI CPU used in the Game Boy Advance.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble `input` into a raw binary written to `-o`.
    Make {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long = "define", value_parser = parse_define)]
        defines: Vec<(String, String)>,
    },
    /// Disassemble `input` and print the decoded instructions.
    Dis {
        input: PathBuf,
        #[arg(long, value_parser = parse_hex, default_value = "0x08000000")]
        base: u32,
        #[arg(long)]
        thumb: bool,
    },
    /// Assemble and hand the result to an external emulator.
    Run { input: PathBuf },
    /// Rebuild `input` into `-o` every time a dependency changes.
    Watch {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run every fixture under `path`, optionally filtered by name.
    Itest { path: PathBuf, filters: Vec<String> },
}

fn parse_define(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| "expected KEY=VALUE".to_string())
}

fn parse_hex(raw: &str) -> Result<u32, std::num::ParseIntError> {
    raw.strip_prefix("0x").map_or_else(|| raw.parse(), |hex| u32::from_str_radix(hex, 16))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Make { input, output, defines } => cmd_make(&input, &output, &defines),
        Command::Dis { input, base, thumb } => cmd_dis(&input, base, thumb),
        Command::Run { input } => cmd_run(&input),
        Command::Watch { input, output } => cmd_watch(&input, &output),
        Command::Itest { path, filters } => cmd_itest(&path, &filters),
    }
}

const ROM_BASE: u32 = 0x0800_0000;

fn cmd_make(input: &Path, output: &Path, defines: &[(String, String)]) -> Result<()> {
    let mut parsed = Vec::with_capacity(defines.len());
    for (key, value) in defines {
        let number = parse_hex(value).map_err(|_| anyhow::anyhow!("--define {key}={value}: expected an integer value"))?;
        tracing::debug!(key, value, "define passed on the command line");
        parsed.push((key.clone(), i64::from(number)));
    }
    let reader = FsReader;
    let mut driver = Driver::new(&reader, ROM_BASE, ErrorPolicy::Abort).with_defines(&parsed)?;
    match driver.assemble(input) {
        Ok(bytes) => {
            std::fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(bytes = bytes.len(), path = %output.display(), "build succeeded");
            Ok(())
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn cmd_dis(input: &Path, base: u32, thumb: bool) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    if base == ROM_BASE {
        if let Ok(header) = CartridgeHeader::new(&bytes) {
            println!("; {} ({}) checksum {}", header.game_title, header.game_code, if header.checksum_ok { "ok" } else { "BAD" });
        }
    }
    for line in disasm::disassemble(&bytes, base, thumb) {
        println!("{:08x}  {}", line.address, line.text);
    }
    Ok(())
}

fn cmd_run(_input: &Path) -> Result<()> {
    bail!("running a built ROM requires an external emulator, which this binary does not bundle")
}

fn cmd_watch(input: &Path, output: &Path) -> Result<()> {
    let reader = FsReader;
    let mut coordinator = Coordinator::new(&reader, input.to_path_buf(), ROM_BASE);

    // The set of files worth watching is only known once the first build has
    // run and recorded every `.include`/`.import`/`.embed` it actually read,
    // so the `watch: …` marker (and the watcher itself) can't be set up until
    // after this first build.
    print_rebuild_outcome(&coordinator.build(), output);
    let watched = coordinator.watched_paths();
    let paths = watched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" ");
    println!("watch: {paths}");

    let mut os_watcher = OsWatcher::new(&watched)?;
    while let Some(batch) = os_watcher.next_batch(std::time::Duration::from_secs(3600)) {
        if coordinator.affected_by(&batch).is_empty() {
            continue;
        }
        print_rebuild_outcome(&coordinator.build(), output);
    }
    Ok(())
}

fn print_rebuild_outcome(outcome: &RebuildOutcome, output: &Path) {
    match outcome {
        RebuildOutcome::Ok { bytes, read } => {
            if std::fs::write(output, bytes).is_ok() {
                println!("> {}", hex_preview(bytes));
            }
            for path in read {
                println!("read: {}", path.display());
            }
        }
        RebuildOutcome::Err(diag) => println!("! {diag}"),
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().take(16).map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn cmd_itest(path: &Path, filters: &[String]) -> Result<()> {
    let mut ran = 0usize;
    let mut failed = 0usize;
    for entry in std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !filters.is_empty() && !filters.iter().any(|f| name.contains(f.as_str())) {
            continue;
        }
        if entry.path().extension().is_none_or(|ext| ext != "s") {
            continue;
        }
        ran += 1;
        let reader = FsReader;
        let mut driver = Driver::new(&reader, ROM_BASE, ErrorPolicy::Abort);
        match driver.assemble(&entry.path()) {
            Ok(_) => println!("ok   {name}"),
            Err(err) => {
                println!("FAIL {name}: {err}");
                failed += 1;
            }
        }
    }
    println!("{ran} run, {failed} failed");
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
