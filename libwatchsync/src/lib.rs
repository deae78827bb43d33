// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, sync::Mutex};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod config;
pub mod consts;
pub mod daemon;
pub mod duration;

/// The command line arguments watchsync understands. Usually parsed
/// with clap, but embedders may build them by hand.
///
/// Callers are expected to check [`Args::version`] before calling
/// [`run`] and print their own version string; clap's built-in
/// version handling does not suit a library crate.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

When the daemon forks into the background its stderr is discarded,
so set this if you want logs in daemon mode."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Raise the log verbosity, may be repeated",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "Path to a toml configuration file

This defaults to ~/.config/watchsync/config.toml when that file exists."
    )]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that watchsync supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Starts the mirroring daemon watching every configured origin")]
    Daemon {
        #[clap(
            long,
            num_args = 2,
            value_names = ["SOURCE", "TARGET"],
            action = clap::ArgAction::Append,
            long_help = "Mirror SOURCE to TARGET with the built-in rsync action

May be given multiple times. Origins added this way run a full-tree
rsync at startup and then stay live, exactly as if they had been
declared in the config file with the default templates."
        )]
        mirror: Vec<String>,

        #[clap(long, action, help = "Stay in the foreground instead of daemonizing")]
        no_daemonize: bool,
    },
}

impl Args {
    /// True when the wrapping binary should print its version and
    /// exit instead of calling [`run`].
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the watchsync tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let config = config::read_config(&args.config_file)?;

    let trace_level =
        config.settings.loglevel.unwrap_or_default().tracing_level(args.verbose);
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Daemon { .. } = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon { mirror, no_daemonize } => daemon::run(config, mirror, no_daemonize),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
