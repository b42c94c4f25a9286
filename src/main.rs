//! Ptyline
//!
//! Runs a shell or command on a fresh pseudo-terminal and relays it to the
//! current terminal.

mod config;
mod relay;

use std::error::Error;

use clap::Parser;
use config::{CliArgs, Config};

fn main() -> Result<(), Box<dyn Error>> {
    // Users can set RUST_LOG=debug for more verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = CliArgs::parse();

    // Load configuration with precedence: CLI > env > file > defaults
    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let code = relay::run(&config)?;
    log::debug!("ptyline exited with {}", code);
    std::process::exit(code);
}
