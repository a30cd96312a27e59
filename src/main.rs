mod cli;

use std::{fs, path::Path, process::exit, sync::Arc};

use anyhow::anyhow;
use clap::Parser;
use hindsight::config::Config;
use hindsight::prop;
use spdlog::{
    prelude::*,
    sink::{RotatingFileSink, RotationPolicy},
};

fn main() {
    let args = cli::Args::parse();
    let setup_logger_result = setup_logger(args.verbose, args.log_dir.as_deref());

    info!("{} {}", prop::PACKAGE.name, prop::PACKAGE.version);
    info!("{}", prop::PACKAGE.summary);

    if let Err(err) = setup_logger_result {
        error!("logs will not be written to files, failed to setup logger: {err}");
    }

    if let Err(err) = run(args) {
        error!("exit with error: {err}");
        exit(1);
    }

    info!("exit normally");
}

fn setup_logger(verbose: bool, log_dir: Option<&Path>) -> anyhow::Result<()> {
    if verbose {
        spdlog::default_logger().set_level_filter(LevelFilter::All)
    }

    if let Some(log_dir) = log_dir {
        fs::create_dir_all(log_dir)
            .map_err(|err| anyhow!("failed to create log directory: {err}"))?;

        let file_sink = Arc::new(
            RotatingFileSink::builder()
                .base_path(log_dir.join("log.txt"))
                .rotation_policy(RotationPolicy::Daily { hour: 0, minute: 0 })
                .build()
                .map_err(|err| anyhow!("failed to build log file sink: {err}"))?,
        );

        let logger = spdlog::default_logger()
            .fork_with(|logger| {
                logger.sinks_mut().push(file_sink);
                Ok(())
            })
            .expect("failed to build logger");

        spdlog::set_default_logger(logger);
    }

    spdlog::default_logger().set_flush_level_filter(LevelFilter::All);

    Ok(())
}

fn run(args: cli::Args) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref())?;
    hindsight::run(config, &args.inputs)?;
    Ok(())
}
