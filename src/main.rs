use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::error;

use noise_estimation::{cli::Args, driver::Driver, logging};

fn main() -> ExitCode {
    let args = Args::parse();

    // logging comes before anything else
    let logger = match logging::build(args.log.as_deref()) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("Error while creating log {err}. Exiting...");
            return ExitCode::from(1);
        }
    };
    if let Err(err) = logging::install(logger) {
        eprintln!("Error while installing logger: {err}. Exiting...");
        return ExitCode::from(1);
    }
    logging::install_panic_hook();
    println!("Log initialized");

    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failures) => {
            error!("{failures} model configuration(s) failed");
            ExitCode::from(1)
        }
        Err(err) => {
            error!("Uncaught error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> anyhow::Result<usize> {
    let config = args.driver_config();
    // models must be storable before any data is generated
    std::fs::create_dir_all(&config.models_dir)
        .with_context(|| format!("cannot create {}", config.models_dir.display()))?;

    let mut driver = Driver::new(config);
    Ok(driver.run(&args.models))
}
