// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

//! create-lock - resolve a conda environment file into a lock file

use clap::Parser;
use miette::Result;

mod cmd_lock;

use cmd_lock::CmdLock;

#[derive(Parser)]
#[clap(
    name = "create-lock",
    about = "Resolve a conda environment file into a reproducible lock file",
    version,
    long_about = "Resolve every requirement of an environment.yml against its channels \
                  and write one pinned build per package to the lock file"
)]
struct Opt {
    #[clap(flatten)]
    logging: Logging,

    #[clap(flatten)]
    cmd: CmdLock,
}

#[derive(Parser)]
struct Logging {
    /// Increase verbosity (-v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[clap(short, long)]
    quiet: bool,
}

impl Opt {
    async fn run(mut self) -> Result<i32> {
        let log_level = match (self.logging.quiet, self.logging.verbose) {
            (true, _) => tracing::Level::ERROR,
            (false, 0) => tracing::Level::WARN,
            (false, 1) => tracing::Level::INFO,
            (false, 2) => tracing::Level::DEBUG,
            (false, _) => tracing::Level::TRACE,
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .init();

        self.cmd.run(self.logging.quiet).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    let code = opt.run().await?;
    std::process::exit(code);
}
