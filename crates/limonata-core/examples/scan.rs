//! Limonata scan tool
//!
//! Connects to a Limonata board, applies a heater step and logs temperature
//! and heater power once per second.
//!
//! Usage:
//!   cargo run --example scan -- [OPTIONS]
//!
//! Options:
//!   --port FILTER     Only use ports whose name contains FILTER
//!   --config FILE     Load driver settings from a JSON file
//!   --heater PCT      Heater power for the step (default: 50)
//!   --period SECS     Length of the run in seconds (default: 30)
//!   --debug           Echo every line sent and received
//!
//! Set RUST_LOG (e.g. RUST_LOG=limonata_core=debug) for more detail.

use anyhow::{bail, Context};
use limonata_core::prelude::*;
use tracing_subscriber::EnvFilter;

/// Settings for one run
struct Options {
    config: DriverConfig,
    heater: f64,
    period: f64,
}

fn parse_args(args: &[String]) -> anyhow::Result<Options> {
    let mut config = DriverConfig::default();
    let mut heater = 50.0;
    let mut period = 30.0;
    let mut debug = false;
    let mut port = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                port = Some(args.get(i).context("--port needs a value")?.clone());
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a value")?;
                config = DriverConfig::load(path)
                    .with_context(|| format!("loading {}", path))?;
            }
            "--heater" => {
                i += 1;
                heater = args.get(i).context("--heater needs a value")?.parse()?;
            }
            "--period" => {
                i += 1;
                period = args.get(i).context("--period needs a value")?.parse()?;
            }
            "--debug" | "-d" => debug = true,
            other => bail!("unknown option: {}", other),
        }
        i += 1;
    }

    // Command-line flags win over the config file, whatever their order
    if let Some(port) = port {
        config.port_filter = port;
    }
    config.debug |= debug;

    Ok(Options {
        config,
        heater,
        period,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Options {
        config,
        heater,
        period,
    } = parse_args(&args)?;

    setup(true, 1.0, &LabClock::global())?;

    let mut lab = Limonata::connect(config)?;
    println!(
        "{} on {} at {} baud, firmware {:?}",
        lab.device(),
        lab.port(),
        lab.baud(),
        lab.version()
    );

    lab.set_heater(heater)?;
    println!("{:>8} {:>8} {:>8}", "Time", "T", "Q");
    let ticks = lab.clock().ticks(period, 1.0)?;
    for tick in ticks {
        let t = tick?;
        let (temperature, power) = lab.scan()?;
        println!("{:>8.2} {:>8.2} {:>8.1}", t, temperature, power);
    }

    lab.close();
    Ok(())
}
