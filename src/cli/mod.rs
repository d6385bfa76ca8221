use clap::{Parser, Subcommand};
use std::path::PathBuf;
use synergy::protocol::Color;

#[derive(Parser, Debug)]
#[command(name = "synergy")]
#[command(about = "Pair a phone and a desktop: send commands and files between them", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Control link port (default: 9999)
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// TOML file overriding the protocol defaults
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Act as the desktop peer: answer commands and receive offered files
    Serve {
        /// Port for incoming file transfers (default: 8888)
        #[arg(long, short = 'b')]
        bulk_port: Option<u16>,

        /// Directory received files are written to
        #[arg(long, short = 'o', default_value = ".")]
        output: PathBuf,
    },

    /// Ask the desktop peer to show a color
    Color {
        /// Desktop address
        host: String,

        /// RED, YELLOW or GREEN
        color: Color,
    },

    /// Send a file to the desktop peer
    Send {
        /// Desktop address
        host: String,

        /// File to send
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
