//! Accelerator schedule CLI
//!
//! Usage:
//!   accel-sched program.json schedule.sched
//!   accel-sched program.json schedule.sched --config hls.json --emit
//!   accel-sched program.json schedule.sched --json

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use tracing_subscriber::EnvFilter;

use accel_schedule::{CompilerConfig, LogEntry, Program, Schedule, ScriptRunner, Session};

#[derive(ClapParser, Debug)]
#[command(name = "accel-sched")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Applies schedule scripts to accelerator kernels and emits HLS C++")]
struct Args {
    /// Program to schedule (JSON, as written by the front end)
    #[arg(value_name = "PROGRAM")]
    program: String,

    /// Schedule script to run against the program
    #[arg(value_name = "SCRIPT")]
    script: String,

    /// Compiler configuration (JSON)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Override the default pipeline initiation interval
    #[arg(long = "ii")]
    pipeline_ii: Option<u32>,

    /// Override the FIFO depth of inserted streams
    #[arg(long = "stream-depth")]
    stream_depth: Option<usize>,

    /// Print every resulting schedule as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Print the HLS code of every `emit(..)` statement
    #[arg(short = 'e', long = "emit")]
    emit: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "accel_schedule=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let program = Program::load(&args.program).unwrap_or_else(|e| {
        eprintln!("{}: {}", "Program error".red(), e);
        std::process::exit(1);
    });

    let config = match &args.config {
        Some(path) => CompilerConfig::load(path),
        None => Ok(CompilerConfig::default()),
    }
    .map(|mut config| {
        if let Some(ii) = args.pipeline_ii {
            config.pipeline_ii = ii;
        }
        if let Some(depth) = args.stream_depth {
            config.stream_depth = depth;
        }
        config
    })
    .and_then(|config| config.validate().map(|_| config))
    .unwrap_or_else(|e| {
        eprintln!("{}: {}", "Config error".red(), e);
        std::process::exit(1);
    });

    let source = fs::read_to_string(&args.script).unwrap_or_else(|e| {
        eprintln!("{}: Failed to read file '{}': {}", "Error".red(), args.script, e);
        std::process::exit(1);
    });

    if args.verbose {
        println!("{}", "Accelerator Schedule Composer".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {} function(s)", "Program".green(), program.functions.len());
        println!(
            "{}: II={}, stream depth {}",
            "Config".green(),
            config.pipeline_ii,
            config.stream_depth
        );
        println!();
    }

    let mut session = Session::with_config(program, config);
    let mut runner = ScriptRunner::new(&mut session);
    if let Err(e) = runner.run_source(&source) {
        eprintln!("{}: {}", "Schedule error".red(), e);
        std::process::exit(1);
    }

    if args.json_output {
        for (name, schedule) in runner.schedules() {
            match schedule.to_json() {
                Ok(json) => println!("{{\"{}\": {}}}", name, json),
                Err(e) => {
                    eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    } else {
        for (name, schedule) in runner.schedules() {
            print_schedule(name, schedule, args.verbose);
        }
    }

    if args.emit {
        for program in runner.emitted() {
            println!("{} {}", "// HLS for".bold().yellow(), program.top);
            println!("{}", program.code);
        }
    }
}

fn print_schedule(name: &str, schedule: &Schedule, verbose: bool) {
    println!("{} {}", "Schedule".bold().green(), name.bold());
    println!("{}", "-".repeat(50));
    println!("{}: {}", "Function".cyan(), schedule.name());
    println!("{}: {}", "Ops".cyan(), schedule.module().op_names().len());
    println!("{}: {}", "Log entries".cyan(), schedule.log().len());

    for (i, entry) in schedule.log().iter().enumerate() {
        let label = match entry {
            LogEntry::Primitive { site: None, .. } => "applied".normal(),
            LogEntry::Primitive { site: Some(_), .. } => "inherited".dimmed(),
            LogEntry::Compose { .. } => "compose".magenta(),
            LogEntry::Dataflow { .. } => "dataflow".blue(),
        };
        println!("  [{}] {} {}", i, label, entry);
    }

    if verbose {
        println!();
        println!("{}", schedule.module());
    }
    println!();
}
