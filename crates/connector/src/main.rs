//! go2link
//!
//! Command-line client for Go2-class robots on their local network.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use connector::config::{default_config_path, Config};
use connector::handshake::{HandshakeClient, HandshakeMethod};
use connector::{ConnectOptions, Go2Connection};
use protocol::messages::MessageType;
use tracing_subscriber::EnvFilter;

/// go2link - connect to a Go2-class robot and talk to its data channel.
#[derive(Parser, Debug)]
#[command(name = "go2link")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Device selection shared by commands that reach the robot.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct DeviceArgs {
    /// Robot host or IP (overrides the config file)
    #[arg(long, short)]
    pub address: Option<String>,

    /// Access token (overrides the config file)
    #[arg(long, short)]
    pub token: Option<String>,

    /// Handshake method (overrides the config file)
    #[arg(long, short, value_enum)]
    pub method: Option<HandshakeMethod>,
}

impl DeviceArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.address {
            config.device.address = address.clone();
        }
        if let Some(token) = &self.token {
            config.device.token = token.clone();
        }
        if let Some(method) = self.method {
            config.device.handshake_method = method;
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open a session and print inbound traffic until interrupted
    Connect {
        #[command(flatten)]
        device: DeviceArgs,

        /// Topics to subscribe to once validated
        #[arg(long = "subscribe", short = 's', value_name = "TOPIC")]
        topics: Vec<String>,

        /// Ask the robot to start streaming video
        #[arg(long)]
        video: bool,

        /// Ask the robot to start streaming audio
        #[arg(long)]
        audio: bool,
    },

    /// Run only the HTTP handshake for an offer SDP and print the answer
    Handshake {
        #[command(flatten)]
        device: DeviceArgs,

        /// File holding the local offer SDP
        #[arg(long, value_name = "FILE")]
        sdp_file: PathBuf,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    init_tracing(cli.verbose, &config.logging.log_level);
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Connect {
            device,
            topics,
            video,
            audio,
        } => {
            device.apply(&mut config);
            config.validate()?;
            run_connect(&config, &topics, video, audio).await?;
        }
        Commands::Handshake { device, sdp_file } => {
            device.apply(&mut config);
            config.validate()?;
            run_handshake(&config, &sdp_file).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Path) => {
            println!("{}", config_path.display());
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `--verbose`, then the configured level.
fn init_tracing(verbose: bool, configured_level: &str) {
    let fallback = if verbose { "debug" } else { configured_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_connect(config: &Config, topics: &[String], video: bool, audio: bool) -> anyhow::Result<()> {
    let connection = Go2Connection::connect(ConnectOptions::from(config)).await?;
    let engine = connection.engine().clone();
    let mut traffic = engine.observe();

    for topic in topics {
        // Messages are printed from the observer; the per-topic stream is not needed.
        drop(engine.subscribe(topic)?);
    }
    if video {
        engine.switch_video(true)?;
    }
    if audio {
        engine.switch_audio(true)?;
    }

    println!("Connected to {}. Press Ctrl-C to disconnect.", connection.address());

    loop {
        tokio::select! {
            message = traffic.recv() => match message {
                Some(message) if message.message_type == MessageType::Heartbeat => {}
                Some(message) => println!("{}", message.to_json()?),
                None => {
                    tracing::warn!("Data channel closed by the robot");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Received interrupt");
                break;
            }
        }
    }

    connection.close().await
}

async fn run_handshake(config: &Config, sdp_file: &Path) -> anyhow::Result<()> {
    let sdp = std::fs::read_to_string(sdp_file)
        .with_context(|| format!("Failed to read SDP file: {}", sdp_file.display()))?;

    let client = HandshakeClient::new(config.device.address.clone(), config.network.http_timeout())?;
    let answer = client
        .negotiate(config.device.handshake_method, &sdp, &config.device.token)
        .await
        .with_context(|| format!("Handshake with {} failed", config.device.address))?;

    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_connect_defaults() {
        let cli = Cli::try_parse_from(["go2link", "connect"]).unwrap();
        match cli.command {
            Commands::Connect {
                device,
                topics,
                video,
                audio,
            } => {
                assert!(device.address.is_none());
                assert!(device.token.is_none());
                assert!(device.method.is_none());
                assert!(topics.is_empty());
                assert!(!video);
                assert!(!audio);
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_with_overrides() {
        let cli = Cli::try_parse_from([
            "go2link",
            "connect",
            "--address",
            "10.0.0.7",
            "--token",
            "abc",
            "--method",
            "legacy",
            "-s",
            "rt/lf/lowstate",
            "--subscribe",
            "rt/multiplestate",
            "--video",
        ])
        .unwrap();
        match cli.command {
            Commands::Connect {
                device,
                topics,
                video,
                audio,
            } => {
                assert_eq!(device.address.as_deref(), Some("10.0.0.7"));
                assert_eq!(device.token.as_deref(), Some("abc"));
                assert_eq!(device.method, Some(HandshakeMethod::Legacy));
                assert_eq!(topics, vec!["rt/lf/lowstate", "rt/multiplestate"]);
                assert!(video);
                assert!(!audio);
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_device_args_apply() {
        let mut config = Config::default();
        let args = DeviceArgs {
            address: Some("10.1.1.1".to_string()),
            token: None,
            method: Some(HandshakeMethod::Encrypted),
        };
        args.apply(&mut config);

        assert_eq!(config.device.address, "10.1.1.1");
        assert!(config.device.token.is_empty());
        assert_eq!(config.device.handshake_method, HandshakeMethod::Encrypted);
    }

    #[test]
    fn test_invalid_method_fails() {
        let result = Cli::try_parse_from(["go2link", "connect", "--method", "telepathy"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_handshake_command() {
        let cli = Cli::try_parse_from(["go2link", "handshake", "--sdp-file", "offer.sdp", "-a", "go2.local"])
            .unwrap();
        match cli.command {
            Commands::Handshake { device, sdp_file } => {
                assert_eq!(sdp_file, PathBuf::from("offer.sdp"));
                assert_eq!(device.address.as_deref(), Some("go2.local"));
            }
            _ => panic!("Expected Handshake command"),
        }
    }

    #[test]
    fn test_handshake_requires_sdp_file() {
        assert!(Cli::try_parse_from(["go2link", "handshake"]).is_err());
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["go2link", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["go2link", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));

        let cli = Cli::try_parse_from(["go2link", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_config_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["go2link", "config"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["go2link", "connect", "-v", "-c", "/tmp/go2.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/go2.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["go2link"]).is_err());
    }
}
