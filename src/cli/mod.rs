#![allow(clippy::print_stdout, clippy::print_stderr)]
//
// SPDX-License-Identifier: MIT
// See LICENSE for details
use argh::{FromArgs, TopLevelCommand};
use log::LevelFilter;
use stderrlog::{LogLevelNum, StdErrLog};

mod collect;
mod version;

use crate::cli::collect::CollectArgs;
use crate::cli::version::format_version;

#[derive(FromArgs)]
/// Workload insight collector: time-series sampling of Linux /proc and
/// /sys telemetry around a tracked process tree.
struct WitArgs {
    #[argh(subcommand)]
    command: WitCommand,

    /// verbose output
    #[argh(switch, short = 'V')]
    verbose: bool,

    /// quiet - no output
    #[argh(switch, short = 'q')]
    quiet: bool,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum WitCommand {
    Collect(CollectArgs),
}

/// Wrapper around argh to support flags acting as subcommands, like
/// --version.
struct WrappedArgs<T: FromArgs>(T);

impl<T: FromArgs> TopLevelCommand for WrappedArgs<T> {}

impl<T: FromArgs> FromArgs for WrappedArgs<T> {
    fn from_args(command_name: &[&str], args: &[&str]) -> Result<Self, argh::EarlyExit> {
        /// Pseudo subcommands that look like flags.
        #[derive(FromArgs)]
        struct CommandlikeFlags {
            /// show version information
            #[argh(switch, short = 'v')]
            version: bool,
        }

        match CommandlikeFlags::from_args(command_name, args) {
            Ok(CommandlikeFlags { version: true }) => Err(argh::EarlyExit {
                output: format_version(),
                status: Ok(()),
            }),
            _ => T::from_args(command_name, args).map(Self),
        }
    }
}

fn build_logger(level: LevelFilter) -> StdErrLog {
    let mut log = stderrlog::new();

    log.module("wit");
    log.verbosity(LogLevelNum::from(level));

    log
}

fn init_logger(level: LevelFilter) {
    build_logger(level).init().unwrap();
}

pub fn main() {
    let args: WrappedArgs<WitArgs> = argh::from_env();
    let args = args.0;

    init_logger(match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::Off,
        (false, true) => LevelFilter::Trace,
        _ => LevelFilter::Info,
    });

    let result = match args.command {
        WitCommand::Collect(collect_args) => collect::run(collect_args),
    };

    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
