//! `smalls`: load, compile, and run a script module.
//!
//! Reference: `tools/smalls/main.cpp` — same `check`/`run` subcommands,
//! `--scripts`/`-I`/`--gas` options, and exit-code contract (0 on success,
//! 1 on any failure).

use anyhow::bail;
use clap::{Parser, Subcommand};
use smalls_rt::core::value::Value;
use smalls_rt::runtime::config::RuntimeConfig;
use smalls_rt::runtime::context::Runtime;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "smalls")]
#[command(about = "Load, compile, and run a script module", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Add all subdirectories of `dir` to the module search path.
    #[arg(long, value_name = "dir")]
    scripts: Option<PathBuf>,

    /// Add `dir` to the module search path (repeatable).
    #[arg(short = 'I', long = "module-path", value_name = "dir")]
    module_path: Vec<PathBuf>,

    /// Gas limit for `run`.
    #[arg(long, default_value_t = 100_000)]
    gas: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Load and compile a module without executing it.
    Check { module: String },
    /// Load, compile, and execute a module's `main` function.
    Run { module: String },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut module_paths = cli.module_path;
    if let Some(scripts_dir) = &cli.scripts {
        for entry in std::fs::read_dir(scripts_dir)?.flatten() {
            if entry.path().is_dir() {
                module_paths.push(entry.path());
            }
        }
    }

    let mut runtime = Runtime::initialize(RuntimeConfig::default());
    for path in &module_paths {
        if path.exists() {
            runtime.add_module_path(path.clone());
        } else {
            eprintln!("Warning: module path does not exist: {}", path.display());
        }
    }

    let (module_name, run_it) = match &cli.command {
        Command::Check { module } => (module.clone(), false),
        Command::Run { module } => (module.clone(), true),
    };

    let script = match runtime.load_module(&module_name) {
        Ok(s) => s,
        Err(e) => {
            runtime.shutdown();
            bail!("failed to load module: {module_name} ({e})");
        }
    };
    for diag in &script.diagnostics {
        eprintln!("{diag}");
    }

    if runtime.get_or_compile_module(&script).is_err() {
        runtime.shutdown();
        bail!("failed to compile module: {module_name}");
    }

    if !run_it {
        println!("Module '{module_name}' compiled successfully");
        runtime.shutdown();
        return Ok(());
    }

    let result = runtime.execute_script(&module_name, "main", &[] as &[Value], cli.gas);
    if !result.ok {
        let trace = result.stack_trace.clone();
        runtime.shutdown();
        if !trace.is_empty() {
            eprintln!("{trace}");
        }
        bail!("execution failed: {}", result.error_message);
    }

    runtime.shutdown();
    Ok(())
}
