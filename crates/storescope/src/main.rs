//! `ssc` — storescope CLI entry point.

mod cli;

use clap::Parser;

use storescope_core::logging::{LogConfig, LogFormat, init_logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let log_config = LogConfig {
        level: args.log_level.clone(),
        format: if args.log_json {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
    };
    // A second init only happens under test harnesses; not fatal.
    let _ = init_logging(&log_config);

    cli::run(args).await
}
