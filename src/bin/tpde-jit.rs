//! Command line driver: load an IR file into an execution session and call a function.
//!
//! ```text
//! tpde-jit program.ir --entry main --arg 2 --arg 3 --stats
//! ```

use clap::Parser;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use tpde_jit::ir::parser::parse_module;
use tpde_jit::opt::optimize_module;
use tpde_jit::{CompileMode, ExecutionSession, JitConfig, JitError, OptLevel};

/// Largest argument count passed in registers.
const MAX_ARGS: usize = 6;

#[derive(Parser)]
#[command(name = "tpde-jit", about = "Compile an IR module in memory and run a function")]
struct Cli {
    /// IR file to load ("-" reads stdin)
    file: PathBuf,

    /// Function to call
    #[arg(long, default_value = "main")]
    entry: String,

    /// Integer argument passed to the entry function (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<i64>,

    /// Skip the optimization pipeline
    #[arg(long)]
    no_opt: bool,

    /// Compile functions on first call
    #[arg(long)]
    lazy: bool,

    /// Print the IR as it will be compiled
    #[arg(long)]
    print_ir: bool,

    /// Print session statistics after the run
    #[arg(long)]
    stats: bool,
}

fn read_source(path: &PathBuf) -> io::Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        fs::read_to_string(path)
    }
}

/// Call `address` as a System V function of `args.len()` word arguments.
///
/// # Safety
///
/// `address` must be the entry of JIT code taking at least that many word arguments.
unsafe fn call(address: u64, args: &[i64]) -> i64 {
    use std::mem::transmute;
    let ptr = address as usize;
    match *args {
        [] => transmute::<usize, extern "C" fn() -> i64>(ptr)(),
        [a] => transmute::<usize, extern "C" fn(i64) -> i64>(ptr)(a),
        [a, b] => transmute::<usize, extern "C" fn(i64, i64) -> i64>(ptr)(a, b),
        [a, b, c] => transmute::<usize, extern "C" fn(i64, i64, i64) -> i64>(ptr)(a, b, c),
        [a, b, c, d] => {
            transmute::<usize, extern "C" fn(i64, i64, i64, i64) -> i64>(ptr)(a, b, c, d)
        }
        [a, b, c, d, e] => transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64) -> i64>(
            ptr,
        )(a, b, c, d, e),
        [a, b, c, d, e, f, ..] => transmute::<
            usize,
            extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64,
        >(ptr)(a, b, c, d, e, f),
    }
}

fn run(cli: &Cli) -> Result<i64, Box<dyn std::error::Error>> {
    let mut config = JitConfig::from_env();
    if cli.no_opt {
        config = config.with_opt_level(OptLevel::None);
    }
    if cli.lazy {
        config = config.with_compile_mode(CompileMode::Lazy);
    }
    if cli.args.len() > MAX_ARGS {
        return Err(format!("at most {MAX_ARGS} arguments are supported").into());
    }

    let session = ExecutionSession::create(config)?;
    let source = read_source(&cli.file)?;
    let name = cli
        .file
        .file_stem()
        .map_or_else(|| "stdin".to_string(), |s| s.to_string_lossy().into_owned());
    let module = parse_module(&source, &name, session.context()).map_err(JitError::from)?;

    if cli.print_ir {
        let mut shown = module.clone();
        optimize_module(&mut shown, session.config().opt_level);
        print!("{shown}");
    }

    let func = module
        .function(&cli.entry)
        .ok_or_else(|| format!("no function named {}", cli.entry))?;
    if func.param_count() != cli.args.len() {
        log::warn!(
            "{} takes {} arguments, {} given",
            cli.entry,
            func.param_count(),
            cli.args.len()
        );
    }

    session.add_module(module)?;
    let address = session.lookup(&cli.entry)?;
    log::info!("calling {} at {address:#x}", cli.entry);
    // SAFETY: the address belongs to a live module compiled from the verified IR.
    let result = unsafe { call(address, &cli.args) };

    if cli.stats {
        eprint!("{}", session.stats());
    }
    session.shutdown();
    Ok(result)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(result) => println!("{result}"),
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    }
}
