//! RustRepro - Main entry point
//!
//! Local reverse proxy that maps local hosts onto remote ones

use anyhow::Result;
use clap::{CommandFactory, Parser};
use rustrepro::{Config, RunOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// RustRepro - A local reverse proxy for remote hosts
#[derive(Parser, Debug)]
#[command(name = "rustrepro")]
#[command(author = "RustRepro Contributors")]
#[command(version)]
#[command(about = "A local reverse proxy for remote hosts")]
struct Args {
    /// Mapping definitions, format: local=scheme=remote[,local=scheme=remote...]
    #[arg(long, default_value = "")]
    mappings: String,

    /// Comma-separated list of regexes identifying routes whose response will be rewritten
    #[arg(long, default_value = "")]
    rewrite: String,

    /// Accept insecure upstream connections
    #[arg(long)]
    allow_insecure: bool,

    /// Disable logging via x-repro-* response headers
    #[arg(long)]
    no_logging: bool,

    /// Read YAML config from file (all other config options are ignored)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn build_config(&self) -> rustrepro::Result<Config> {
        if let Some(path) = &self.config {
            return Config::from_yaml_file(path);
        }

        let mut config = Config::new();
        config.set_ssl_allow_insecure(self.allow_insecure);
        config.set_no_logging(self.no_logging);
        config.add_mapping_defs(&self.mappings)?;
        config.add_rewrite_defs(&self.rewrite)?;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = match args.build_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}\n", e);
            Args::command().print_help()?;
            return Ok(ExitCode::FAILURE);
        }
    };

    info!(
        "Starting RustRepro v{} with {} mapping(s), {} rewrite route(s)",
        env!("CARGO_PKG_VERSION"),
        config.count_mappings(),
        config.rewrite_rules().len()
    );

    match rustrepro::run(config).await {
        Ok(RunOutcome::NothingToDo) => {
            println!("nothing to do");
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Stopped) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
