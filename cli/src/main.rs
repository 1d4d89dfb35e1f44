#![forbid(unsafe_code)]

use std::process::exit;

use clap::Parser;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

mod commands;
mod interactive;

use crate::commands::Subcommand;

#[derive(Parser)]
#[command(version, author, about)]
struct Opt {
    /// Increase the level of verbosity. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use JSON output for log messages
    #[arg(short, long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Subcommand,
}

impl Opt {
    const fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "comet2_emulator=debug,comet2_cli=debug,info",
            2 => "comet2_emulator=trace,comet2_cli=trace,info",
            3 => "comet2_emulator=trace,comet2_cli=trace,debug",
            4..=u8::MAX => "trace",
        }
    }

    fn filter_layer(&self) -> EnvFilter {
        // Parse log level from env, or infer it from the arguments
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.log_filter()))
            .unwrap()
    }
}

fn main() {
    let opt = Opt::parse();

    let registry = tracing_subscriber::Registry::default().with(opt.filter_layer());
    if opt.json {
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .without_time()
            .with_target(false);
        registry.with(fmt_layer).init();
    }

    let res = opt.command.exec();
    if let Err(e) = res {
        error!("{e}");
        exit(1);
    }
}
