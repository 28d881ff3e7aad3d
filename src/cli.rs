use clap::{Parser, Subcommand};
use ffladder::engine::OutputMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ffladder")]
#[command(about = "Encode one video stream into a ladder of renditions with a single ffmpeg", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcode an encoded stream into every configured output
    Transcode {
        /// Config file (defaults to the user config, or built-in defaults)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Input file, or "-" for stdin
        #[arg(long, short, value_name = "FILE", default_value = "-")]
        input: PathBuf,

        /// Directory receiving the output files
        #[arg(long, short, value_name = "DIR", default_value = ".")]
        output_dir: PathBuf,

        /// Output mode: combined or multi-sink (overrides config)
        #[arg(long)]
        mode: Option<OutputMode>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the ffmpeg command without executing (dry run)
    DryRun {
        /// Config file (defaults to the user config, or built-in defaults)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output mode: combined or multi-sink (overrides config)
        #[arg(long)]
        mode: Option<OutputMode>,
    },

    /// Check that the configured ffmpeg is installed and list the encoders it needs
    CheckFfmpeg {
        /// Config file (defaults to the user config, or built-in defaults)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show config status and location, or create default config if missing
    InitConfig,
}

pub fn parse() -> Cli {
    Cli::parse()
}
