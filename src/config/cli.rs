use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the render-queue binary.
#[derive(Debug, Parser)]
#[command(
    name = "render-queue",
    version,
    about = "Bounded, document-ordered streaming renderer"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RENDER_QUEUE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render a synthetic page through the queue and report pool statistics.
    Demo(Box<DemoArgs>),
}

#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub overrides: QueueOverrides,

    /// Number of concurrent render requests sharing the pool.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    pub requests: u32,

    /// Number of card components on the synthetic page.
    #[arg(long, default_value_t = 12, value_parser = clap::value_parser!(u32).range(1..))]
    pub components: u32,

    /// Simulated data-fetch latency of each card, in milliseconds.
    #[arg(long = "delay-ms", default_value_t = 25)]
    pub delay_ms: u64,

    /// Abort any request that runs longer than this, in milliseconds.
    #[arg(long = "timeout-ms", value_name = "MILLIS")]
    pub timeout_ms: Option<u64>,

    /// Write the first rendered document to stdout.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub print: bool,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            overrides: QueueOverrides::default(),
            requests: 4,
            components: 12,
            delay_ms: 25,
            timeout_ms: None,
            print: false,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct QueueOverrides {
    /// Override the node pool capacity.
    #[arg(long = "pool-size", value_name = "COUNT", allow_negative_numbers = true)]
    pub pool_size: Option<i64>,

    /// Disable shell reuse and fragment interning.
    #[arg(long = "no-cache", action = clap::ArgAction::SetTrue)]
    pub no_cache: bool,

    /// Render without admission control.
    #[arg(long = "disable-queue", action = clap::ArgAction::SetTrue)]
    pub disable_queue: bool,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
