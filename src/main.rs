//! recordshell - record the traffic of an interactive shell
//!
//! Starts the caller's login shell inside a private network namespace. DNS
//! queries and TCP connections leaving it are proxied and every exchange is
//! stored in the given folder.

mod bulkhead;
mod cli;
mod error;
mod manifest;
mod network;
mod process;
mod provision;
mod proxy;
mod sys;
mod warden;

use cli::Cli;
use error::{Error, Result};
use sys::Environment;

fn main() {
    let env = Environment::capture();
    clear_environment();

    match run(env) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(env: Environment) -> Result<i32> {
    let args: Vec<std::ffi::OsString> = std::env::args_os().collect();
    sys::check_requirements(args.first().and_then(|a| a.to_str()))?;

    let cli = Cli::parse_from_args(&args)?;
    init_tracing(cli.verbose, &env)?;

    let config = manifest::load_system()?;
    provision::record_session(&cli.folder, &config, env)
}

/// Drop every inherited variable; only the recorded shell gets them back
fn clear_environment() {
    for (key, _) in std::env::vars_os() {
        // SAFETY: called first thing in main, before any thread exists
        unsafe { std::env::remove_var(key) };
    }
}

fn init_tracing(verbose: u8, env: &Environment) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => env
            .get(EnvFilter::DEFAULT_ENV)
            .and_then(|directives| directives.to_str())
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Environment(format!("cannot initialize logging: {}", e)))
}
