use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use coil::{
    Code, Exception, LimitedTracker, NoLimitTracker, Object, ResourceLimits, ResourceTracker, Runner, StdPrint,
    StderrTracer,
};

#[derive(Parser)]
#[command(name = "coil", about = "Run Python 2.7 style code objects", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a code object stored as JSON
    Run(RunArgs),
    /// Print the disassembly of a code object stored as JSON
    Dis {
        /// Path to the code object
        code: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the code object
    code: PathBuf,

    /// Importable module, as NAME=PATH; may be repeated
    #[arg(long = "module", value_name = "NAME=PATH")]
    modules: Vec<String>,

    /// Maximum heap memory in bytes
    #[arg(long)]
    max_memory: Option<usize>,

    /// Maximum number of heap allocations
    #[arg(long)]
    max_allocations: Option<usize>,

    /// Maximum number of executed instructions
    #[arg(long)]
    max_operations: Option<usize>,

    /// Wall-clock limit in milliseconds
    #[arg(long)]
    max_duration_ms: Option<u64>,

    /// Maximum call depth
    #[arg(long)]
    max_depth: Option<usize>,

    /// Trace every instruction to stderr
    #[arg(long)]
    trace: bool,

    /// Report elapsed time on stderr
    #[arg(long)]
    timing: bool,
}

impl RunArgs {
    fn limits(&self) -> Option<ResourceLimits> {
        let any = self.max_memory.is_some()
            || self.max_allocations.is_some()
            || self.max_operations.is_some()
            || self.max_duration_ms.is_some()
            || self.max_depth.is_some();
        if !any {
            return None;
        }
        let mut limits = ResourceLimits::new();
        if let Some(bytes) = self.max_memory {
            limits = limits.max_memory(bytes);
        }
        if let Some(count) = self.max_allocations {
            limits = limits.max_allocations(count);
        }
        if let Some(count) = self.max_operations {
            limits = limits.max_operations(count);
        }
        if let Some(ms) = self.max_duration_ms {
            limits = limits.max_duration(Duration::from_millis(ms));
        }
        if self.max_depth.is_some() {
            limits = limits.max_recursion_depth(self.max_depth);
        }
        Some(limits)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(&args),
        Command::Dis { code } => match read_code(&code) {
            Ok(code) => {
                print!("{}", code.disassemble());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(args: &RunArgs) -> ExitCode {
    let runner = match build_runner(args) {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let result = match args.limits() {
        Some(limits) => execute(&runner, LimitedTracker::new(limits), args.trace),
        None => execute(&runner, NoLimitTracker, args.trace),
    };
    if args.timing {
        eprintln!("finished after {:?}", start.elapsed());
    }

    match result {
        Ok(Object::None) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{}", value.py_repr());
            ExitCode::SUCCESS
        }
        Err(exc) => report(&exc),
    }
}

fn execute(runner: &Runner, tracker: impl ResourceTracker, trace: bool) -> Result<Object, Exception> {
    if trace {
        runner.run_traced(tracker, &mut StdPrint, &mut StderrTracer::new())
    } else {
        runner.run(tracker, &mut StdPrint)
    }
}

/// `SystemExit` leaves quietly with its code; anything else prints the traceback.
fn report(exc: &Exception) -> ExitCode {
    if exc.is_system_exit() {
        if let Some(message) = exc.message().filter(|m| m.parse::<i32>().is_err()) {
            eprintln!("{message}");
        }
    } else {
        eprintln!("{}", exc.traceback_text());
    }
    // process exit statuses are a byte wide
    ExitCode::from((exc.exit_code() & 0xff) as u8)
}

fn build_runner(args: &RunArgs) -> Result<Runner, String> {
    let mut runner = Runner::new(read_code(&args.code)?).map_err(|err| err.to_string())?;
    for entry in &args.modules {
        let Some((name, path)) = entry.split_once('=') else {
            return Err(format!("--module expects NAME=PATH, got {entry:?}"));
        };
        let code = read_code(Path::new(path))?;
        runner = runner.with_module(name, code).map_err(|err| format!("module {name}: {err}"))?;
    }
    Ok(runner)
}

fn read_code(path: &Path) -> Result<Code, String> {
    let json = fs::read_to_string(path).map_err(|err| format!("reading {}: {err}", path.display()))?;
    Code::from_json(&json).map_err(|err| format!("{}: {err}", path.display()))
}
