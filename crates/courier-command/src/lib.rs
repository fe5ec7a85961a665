use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "courier.yaml";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("request is not valid JSON: {0}")]
    InvalidRequest(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(name = "send")]
    #[command(about = "Send a command through the configured transport and print the reply")]
    Send {
        #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
        #[arg(help = "Path to the config file example: ./courier.yaml")]
        config: String,

        #[arg(long, short = 'n')]
        name: String,

        #[arg(long, short = 'r', default_value = "null")]
        #[arg(help = "Request payload as JSON")]
        request: String,

        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,

        // fire and forget
        #[arg(long = "no-reply")]
        no_reply: bool,

        #[arg(long)]
        sign: bool,
    },

    #[command(name = "listen")]
    #[command(about = "Listen for a command name and echo every request back")]
    Listen {
        #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
        config: String,

        #[arg(long, short = 'n')]
        name: String,
    },

    #[command(name = "keygen")]
    #[command(about = "Generate a key pair for a signature algorithm")]
    Keygen {
        #[arg(long, short = 'a', default_value = "Ed25519")]
        algorithm: String,
    },
}

impl Commands {
    /// Parsed `--request` payload of a `send` command, `Null` for the others.
    pub fn request(&self) -> Result<Value, CommandError> {
        match self {
            Commands::Send { request, .. } => Ok(serde_json::from_str(request)?),
            _ => Ok(Value::Null),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Commands::Send { timeout_ms, .. } => timeout_ms.map(Duration::from_millis),
            _ => None,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
