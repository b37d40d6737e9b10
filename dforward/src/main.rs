// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod parser;
#[cfg(test)]
mod tests;

use self::parser::{ConfigError, Parsed};
use anyhow::Result;
use dsteer::{error::SteerError, DnsService};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use structopt::{clap::ErrorKind, StructOpt};
use thiserror::Error;

// Exit statuses: 0 clean, 1 unexpected failure, 2 configuration or
// argument error.
const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(StructOpt)]
#[structopt(
    name = "dforward",
    about = "Per-client rule-based local DNS forwarding proxy."
)]
struct Opts {
    /// Path to the YAML configuration file.
    #[structopt(short, long, parse(from_os_str))]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[structopt(long)]
    check: bool,
}

/// Everything that can go wrong before the service is up.
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration file violates the schema.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The forwarding engine rejected the configuration.
    #[error(transparent)]
    Steer(#[from] SteerError),
}

// Build the service and pull out the logging verbosity.
fn init(parsed: Parsed) -> std::result::Result<(DnsService, LevelFilter), InitError> {
    let (conf, verbosity) = parsed.into_config()?;
    Ok((DnsService::new(conf)?, verbosity))
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let opts = match Opts::from_iter_safe(std::env::args()) {
        Ok(opts) => opts,
        Err(e)
            if e.kind == ErrorKind::HelpDisplayed || e.kind == ErrorKind::VersionDisplayed =>
        {
            println!("{}", e.message);
            return EXIT_OK;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            return EXIT_USAGE;
        }
    };

    let parsed: Parsed = match std::fs::read_to_string(&opts.config)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_yaml::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("dforward: reading {}: {}", opts.config.display(), e);
            return EXIT_USAGE;
        }
    };

    let (svc, verbosity) = match init(parsed) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("dforward: invalid configuration: {}", e);
            return EXIT_USAGE;
        }
    };

    if opts.check {
        println!("configuration file {} is valid", opts.config.display());
        return EXIT_OK;
    }

    if let Err(e) = SimpleLogger::new().with_level(verbosity).init() {
        eprintln!("dforward: initializing logger: {}", e);
        return EXIT_FAILURE;
    }

    match serve(svc) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("{:#}", e);
            EXIT_FAILURE
        }
    }
}

#[tokio::main]
async fn serve(svc: DnsService) -> Result<()> {
    svc.start().await?;
    info!("dforward ready!");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    svc.shutdown().await?;

    Ok(())
}
