#[cfg(feature = "cli")]
use colored::Colorize;
#[cfg(feature = "cli")]
use minipki::cli::run_cli;
#[cfg(feature = "cli")]
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "cli")]
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("minipki=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[cfg(feature = "cli")]
fn main() {
    init_logging();

    if let Err(e) = run_cli() {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("This binary requires the 'cli' feature to be enabled.");
    eprintln!("Build with: cargo build --features cli");
    std::process::exit(1);
}
