//! Configuration module for remote-exec.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "remote-exec")]
#[command(author = "remote-exec authors")]
#[command(version = "0.1.0")]
#[command(about = "Runs one client command per connection and sends its output back", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

/// Operating mode selected on the command line
#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Execute client commands, one connection at a time
    Serve(ServeArgs),
    /// Two-way chat with a single peer
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// IPv4 or IPv6 address to bind to
    pub host: Option<String>,

    /// Port to bind to
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Append a status line after each command's output
    #[arg(long)]
    pub status_frame: bool,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Wait for one peer on HOST:PORT
    #[arg(short = 'a', long, conflicts_with = "connect", required_unless_present = "connect")]
    pub accept: bool,

    /// Connect to a peer at HOST:PORT
    #[arg(short = 'c', long)]
    pub connect: bool,

    /// IPv4 or IPv6 address
    pub host: String,

    /// Port number
    pub port: u16,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pending connections the kernel queues while a command runs
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Capacity of the single command read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum number of arguments, command name included
    #[serde(default = "default_max_args")]
    pub max_args: usize,
    /// Append a status line after each command's output
    #[serde(default)]
    pub status_frame: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            max_args: default_max_args(),
            status_frame: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_backlog() -> i32 {
    20
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_args() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which side of the chat this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// Bind, accept exactly one peer, then stop listening.
    Accept,
    /// Connect out to a listening peer.
    Connect,
}

/// Operating mode of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Chat(ChatRole),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: SocketAddr,
    pub backlog: i32,
    pub buffer_size: usize,
    pub max_args: usize,
    pub status_frame: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge parsed CLI args over a TOML config.
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let (mode, host, port, backlog, status_frame) = match cli.mode {
            ModeArgs::Serve(args) => (
                Mode::Serve,
                args.host.unwrap_or(server.host),
                args.port.unwrap_or(server.port),
                args.backlog.unwrap_or(server.backlog),
                args.status_frame || server.status_frame,
            ),
            ModeArgs::Chat(args) => {
                let role = if args.accept {
                    ChatRole::Accept
                } else {
                    ChatRole::Connect
                };
                // A chat listener only ever takes one peer
                (Mode::Chat(role), args.host, args.port, 1, false)
            }
        };

        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(host.clone()))?;

        if backlog < 1 {
            return Err(ConfigError::Invalid("backlog", "must be at least 1"));
        }
        if server.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size", "must be non-zero"));
        }
        if server.max_args == 0 {
            return Err(ConfigError::Invalid("max_args", "must be at least 1"));
        }

        Ok(Config {
            mode,
            listen: SocketAddr::new(ip, port),
            backlog,
            buffer_size: server.buffer_size,
            max_args: server.max_args,
            status_frame,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("{0} is not an IPv4 or an IPv6 address")]
    InvalidAddress(String),
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, &'static str),
}
