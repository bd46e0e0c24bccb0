use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stream-bench")]
#[command(
    author,
    version,
    about = "Stress-test the streaming completion endpoint of an OpenAI-compatible server",
    long_about = None
)]
pub struct Cli {
    /// Path to the TOML benchmark configuration
    pub config: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
