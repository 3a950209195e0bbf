use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quicken_config::{ConfigLoader, QuickenConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Quicken adaptive bytecode interpreter.
///
/// Runs, assembles and inspects quicken bytecode. Programs are either
/// assembly text or `.qbc` files produced by `quicken asm`.
///
/// EXAMPLES:
///     quicken run prog.qasm                   Run a program
///     quicken run prog.qasm --stats           Print specialization statistics
///     quicken run prog.qasm --monitor call    Count CALL events
///     quicken dis prog.qasm --after-run       Show specialized instructions
///     quicken asm prog.qasm -o prog.qbc       Write binary bytecode
///     quicken opcodes --class specialized     List specialized opcodes
///
/// ENVIRONMENT VARIABLES:
///     QUICKEN_LOG         Log filter (same syntax as RUST_LOG)
///     QUICKEN_SPECIALIZE  Set to 0 to disable specialization
///     QUICKEN_WARMUP      Observations before a site is specialized
///     QUICKEN_MAX_FRAMES  Call depth limit
#[derive(Parser)]
#[command(name = "quicken")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Log filter, e.g. `quicken::specialize=debug`
    #[arg(long, global = true, env = "QUICKEN_LOG")]
    log: Option<String>,

    /// Configuration file (default: nearest quicken.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    ///
    /// EXAMPLES:
    ///     quicken run prog.qasm
    ///     quicken run prog.qbc --no-specialize
    ///     quicken run prog.qasm --monitor call,line --trace-events
    #[command(visible_alias = "r")]
    Run {
        /// Assembly source or `.qbc` file
        file: PathBuf,
        /// Comma-separated events to monitor (e.g. `call,line,branch`)
        #[arg(long)]
        monitor: Option<String>,
        /// Execute generic instructions only
        #[arg(long)]
        no_specialize: bool,
        /// Observations before a site is specialized
        #[arg(long)]
        warmup: Option<u16>,
        /// Print specialization statistics to stderr afterwards
        #[arg(long)]
        stats: bool,
        /// Statistics as JSON (implies --stats)
        #[arg(long)]
        json: bool,
        /// Count executions per opcode
        #[arg(long)]
        profile: bool,
        /// Print each monitored event to stderr as it happens
        #[arg(long)]
        trace_events: bool,
    },

    /// Disassemble a program
    ///
    /// EXAMPLES:
    ///     quicken dis prog.qasm
    ///     quicken dis prog.qasm --after-run
    #[command(visible_alias = "d")]
    Dis {
        /// Assembly source or `.qbc` file
        file: PathBuf,
        /// Run the program first and show the specialized form
        #[arg(long)]
        after_run: bool,
        /// Show the compiled form with every rewrite undone
        #[arg(long)]
        deopt: bool,
        /// Skip nested code objects
        #[arg(long)]
        no_nested: bool,
    },

    /// Assemble text into a `.qbc` file
    ///
    /// EXAMPLES:
    ///     quicken asm prog.qasm -o prog.qbc
    Asm {
        /// Assembly source
        file: PathBuf,
        /// Output path
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// List the opcode table
    ///
    /// EXAMPLES:
    ///     quicken opcodes
    ///     quicken opcodes --class instrumented --json
    Opcodes {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Only opcodes of this class
        #[arg(long, value_enum)]
        class: Option<ClassFilter>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ClassFilter {
    Base,
    Specialized,
    Instrumented,
    Reserved,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.log.as_deref(), &config);

    match cli.command {
        Commands::Run {
            file,
            monitor,
            no_specialize,
            warmup,
            stats,
            json,
            profile,
            trace_events,
        } => {
            let args = commands::run::RunArgs {
                file,
                monitor,
                no_specialize,
                warmup,
                stats: stats || json,
                json,
                profile,
                trace_events,
            };
            commands::run::run(&args, &config)?;
        }
        Commands::Dis {
            file,
            after_run,
            deopt,
            no_nested,
        } => {
            let args = commands::dis::DisArgs {
                file,
                after_run,
                deopt,
                nested: !no_nested,
            };
            commands::dis::run(&args, &config)?;
        }
        Commands::Asm { file, output } => {
            commands::asm::run(&file, &output)?;
        }
        Commands::Opcodes { json, class } => {
            commands::opcodes::run(json, class)?;
        }
    }

    Ok(())
}

/// `--config` if given, else the nearest `quicken.toml`, else defaults.
fn load_config(explicit: Option<&std::path::Path>) -> Result<QuickenConfig> {
    let loader = ConfigLoader::new();
    let config = match explicit {
        Some(path) => loader
            .load_from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => loader.load_from_directory(&std::env::current_dir()?)?,
    };
    Ok(config.settings)
}

/// Logs go to stderr so program output on stdout stays clean.
fn init_logging(flag: Option<&str>, config: &QuickenConfig) {
    let directive = flag
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .or_else(|| config.logging.filter.clone())
        .unwrap_or_else(|| "warn".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
