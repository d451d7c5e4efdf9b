//! LoopFuse Command Line Interface
//!
//! Usage:
//!   loopfuse [OPTIONS] <input-file>
//!   loopfuse --help
//!
//! Examples:
//!   loopfuse kernels.json                     # Fuse and print the IR
//!   loopfuse --emit=report kernels.json       # Per-function fusion report
//!   loopfuse --single-fusion -o out.json --emit=json kernels.json

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use loopfuse::transform::{FusionConfig, FusionPass};
use loopfuse::utils::pretty::PrettyPrint;
use log::{debug, info};
use std::fs;
use std::path::PathBuf;

/// LoopFuse - loop fusion for an SSA control-flow IR
#[derive(Parser, Debug)]
#[command(name = "loopfuse")]
#[command(author = "LoopFuse Contributors")]
#[command(version)]
#[command(about = "Fuses adjacent loops in a JSON-encoded IR module", long_about = None)]
struct Cli {
    /// Input module (JSON)
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// What to emit
    #[arg(long, default_value = "ir")]
    emit: EmitKind,

    /// Fuse at most one pair per function
    #[arg(long)]
    single_fusion: bool,

    /// Maximum number of fusions per function
    #[arg(long, value_name = "N")]
    max_fusions: Option<usize>,

    /// Do not check store/store pairs across loops
    #[arg(long)]
    no_output_deps: bool,

    /// Skip verification after each fusion
    #[arg(long)]
    no_verify: bool,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress warnings)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitKind {
    /// Pretty-printed IR after fusion
    Ir,
    /// The fused module as JSON
    Json,
    /// Per-function fusion results as JSON
    Report,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    info!("LoopFuse v{}", loopfuse::VERSION);
    debug!("Input file: {:?}", cli.input);

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read input file: {:?}", cli.input))?;
    let mut module = loopfuse::parse_module(&source).with_context(|| "Failed to parse input module")?;

    loopfuse::verify_module(&module).with_context(|| "Input module is malformed")?;

    let config = build_config(&cli);
    debug!("Fusion config: {:?}", config);

    let results = FusionPass::new(config).run_module(&mut module)?;
    let fused: usize = results.iter().map(|r| r.fused.len()).sum();
    info!("Fused {} loop pairs across {} functions", fused, results.len());

    let output = match cli.emit {
        EmitKind::Ir => module.pretty(),
        EmitKind::Json => serde_json::to_string_pretty(&module)?,
        EmitKind::Report => serde_json::to_string_pretty(&results)?,
    };
    write_output(&cli.output, &output)
}

fn build_config(cli: &Cli) -> FusionConfig {
    let mut config = if cli.single_fusion {
        FusionConfig::single_fusion()
    } else {
        FusionConfig::default()
    };

    // Override with CLI flags
    if let Some(max) = cli.max_fusions {
        config = config.with_max_fusions(max);
    }
    if cli.no_output_deps {
        config.check_output_dependences = false;
    }
    if cli.no_verify {
        config.verify_after_fusion = false;
    }
    config
}

fn write_output(path: &Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(p) => {
            fs::write(p, content).with_context(|| format!("Failed to write output file: {:?}", p))?;
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}
