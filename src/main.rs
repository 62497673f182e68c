#![warn(future_incompatible)]
#![warn(let_underscore)]
#![warn(clippy::cargo)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::Parser;

use crftune::config;
use crftune::util;

fn main() -> anyhow::Result<()> {
    util::install_tracing().context("Unable to install tracing subsystem")?;

    let config = config::Config::parse();
    let report = crftune::run(&config).context("Unable to run quality search")?;

    report.print_trace();

    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Unable to serialize report")?
        );
    } else {
        println!("{}", report.reason);
    }

    Ok(())
}
