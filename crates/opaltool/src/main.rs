mod capture;
mod disasm;
mod replay;

use clap::{Parser, Subcommand};
use eyre_pretty::{Context, Result};
use opal::config::Config;
use std::path::PathBuf;

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a capture through the pipeline and report what it drew.
    Replay {
        /// Path to the capture
        #[arg(short, long)]
        input: PathBuf,
        /// Number of frames to run
        #[arg(short, long, default_value_t = 1)]
        frames: u32,
        /// Path to a configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Disassemble a display list of a capture.
    Disasm {
        /// Path to the capture
        #[arg(short, long)]
        input: PathBuf,
        /// Physical address to start at. Defaults to the first task's display list
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u32>,
        /// Maximum number of commands to print
        #[arg(short, long, default_value_t = 64)]
        count: u32,
    },
    /// Show the contents of a capture.
    Info {
        /// Path to the capture
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Write the default configuration.
    Config {
        /// Path to the output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// A CLI to replay and inspect captured N64 graphics tasks.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Action to take
    #[command(subcommand)]
    command: Command,
}

fn parse_address(value: &str) -> Result<u32, std::num::ParseIntError> {
    let value = value.replace('_', "");
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("opaltool=info,opal=warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn info(input: PathBuf) -> Result<()> {
    use bytesize::ByteSize;
    use comfy_table::{Cell, ContentArrangement, Table, presets::NOTHING};

    let capture = capture::Capture::open(&input)?;
    let vi = capture.vi.registers();

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let mut row = |name: &str, value: String| {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    };

    row("Version", capture.version.to_string());
    row("Dialect", capture.dialect()?.to_string());
    row("RDRAM", ByteSize(capture.rdram.len() as u64).display().to_string());
    row("VI origin", format!("{:#08X}", vi.origin));
    row("VI width", vi.width.to_string());
    row("VI pixel type", format!("{:?}", vi.status.pixel_type()));
    row("Interlaced", vi.status.serrate().to_string());
    for (i, entry) in capture.entries.iter().enumerate() {
        row(&format!("Task {i}"), format!("{entry:#08X}"));
    }

    println!("{table}");
    Ok(())
}

fn main() -> Result<()> {
    eyre_pretty::install()?;
    setup_tracing();

    let args = Args::parse();
    match args.command {
        Command::Replay {
            input,
            frames,
            config,
        } => replay::replay(input, frames, config),
        Command::Disasm {
            input,
            address,
            count,
        } => disasm::disasm(input, address, count),
        Command::Info { input } => info(input),
        Command::Config { output } => Config::default()
            .save(&output)
            .context("writing configuration"),
    }
}
