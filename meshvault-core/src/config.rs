//! Configuration management for Meshvault
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Values come from the defaults, then the `--config` TOML file, then any
//! flags given on the command line.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::crypto::EncryptionKey;
use crate::server::FileServerOpts;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "meshvault")]
#[command(about = "Peer-to-peer encrypted content store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a file server node until Ctrl+C
    Start(StartCommand),
    /// Boot a local three-node mesh and replicate a few files through it
    Demo(DemoCommand),
}

#[derive(Parser, Debug, Clone, Default)]
pub struct StartCommand {
    /// TOML config file; flags given here override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:3000
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Parent directory of the node's storage root
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Explicit storage root, bypassing the per-address directory
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Node to connect to at startup (can be specified multiple times)
    #[arg(long)]
    pub bootstrap_node: Vec<String>,

    /// AES-256 key shared by the mesh, 64 hex characters
    #[arg(long)]
    pub encryption_key: Option<String>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Maximum size of a control message in bytes
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Maximum size of a stored file in bytes
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Bound on waiting for, and reading, a raw stream
    #[arg(long)]
    pub stream_timeout_ms: Option<u64>,
}

#[derive(Parser, Debug, Clone)]
pub struct DemoCommand {
    /// Parent directory of the nodes' storage roots
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Listen addresses, one node each; later nodes bootstrap to earlier ones
    #[arg(
        long = "listen-addr",
        default_values_t = [
            "127.0.0.1:3000".to_string(),
            "127.0.0.1:7000".to_string(),
            "127.0.0.1:5000".to_string(),
        ]
    )]
    pub listen_addrs: Vec<String>,

    /// Number of files to store and fetch back
    #[arg(long, default_value_t = 20)]
    pub keys: usize,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub storage_root: Option<PathBuf>,
    pub bootstrap_nodes: Vec<String>,
    pub encryption_key: Option<String>,
    pub log_level: String,
    pub max_message_size: usize,
    pub max_file_size: u64,
    pub stream_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:3000".to_string(),
            data_dir: PathBuf::from("./data"),
            storage_root: None,
            bootstrap_nodes: Vec::new(),
            encryption_key: None,
            log_level: "info".to_string(),
            max_message_size: crate::frame::DEFAULT_MAX_MESSAGE_SIZE,
            max_file_size: crate::server::DEFAULT_MAX_FILE_SIZE,
            stream_timeout_ms: crate::server::DEFAULT_STREAM_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load config from a TOML file; missing fields take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build config from a start command: defaults, then file, then flags
    pub fn from_start_command(cmd: StartCommand) -> Result<Self, ConfigError> {
        let mut config = match &cmd.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply(cmd);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, cmd: StartCommand) {
        if let Some(addr) = cmd.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(dir) = cmd.data_dir {
            self.data_dir = dir;
        }
        if cmd.storage_root.is_some() {
            self.storage_root = cmd.storage_root;
        }
        if !cmd.bootstrap_node.is_empty() {
            self.bootstrap_nodes = cmd.bootstrap_node;
        }
        if cmd.encryption_key.is_some() {
            self.encryption_key = cmd.encryption_key;
        }
        if let Some(level) = cmd.log_level {
            self.log_level = level;
        }
        if let Some(size) = cmd.max_message_size {
            self.max_message_size = size;
        }
        if let Some(size) = cmd.max_file_size {
            self.max_file_size = size;
        }
        if let Some(ms) = cmd.stream_timeout_ms {
            self.stream_timeout_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must not be empty".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be positive".into()));
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::Invalid("max_file_size must be positive".into()));
        }
        if self.stream_timeout_ms == 0 {
            return Err(ConfigError::Invalid("stream_timeout_ms must be positive".into()));
        }
        if let Some(hex) = &self.encryption_key {
            EncryptionKey::from_hex(hex)
                .map_err(|e| ConfigError::Invalid(format!("encryption_key: {}", e)))?;
        }
        Ok(())
    }

    /// `data_dir/<listen_addr without ':'>_network` unless set explicitly
    pub fn storage_root(&self) -> PathBuf {
        match &self.storage_root {
            Some(root) => root.clone(),
            None => self.data_dir.join(network_dir_name(&self.listen_addr)),
        }
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    /// The configured mesh key, or a fresh one if none is configured
    pub fn encryption_key(&self) -> Result<EncryptionKey, ConfigError> {
        match &self.encryption_key {
            Some(hex) => EncryptionKey::from_hex(hex)
                .map_err(|e| ConfigError::Invalid(format!("encryption_key: {}", e))),
            None => {
                warn!(
                    "No encryption_key configured; generated a random one. \
                     Only nodes sharing a key can replicate files."
                );
                Ok(EncryptionKey::generate())
            }
        }
    }

    pub fn server_opts(&self) -> Result<FileServerOpts, ConfigError> {
        let mut opts = FileServerOpts::new(
            self.listen_addr.clone(),
            self.storage_root(),
            self.encryption_key()?,
        )
        .with_bootstrap_nodes(self.bootstrap_nodes.clone());
        opts.max_message_size = self.max_message_size;
        opts.max_file_size = self.max_file_size;
        opts.stream_timeout = self.stream_timeout();
        Ok(opts)
    }
}

/// Settings for the `demo` subcommand
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub data_dir: PathBuf,
    pub listen_addrs: Vec<String>,
    pub keys: usize,
    pub log_level: String,
}

impl DemoConfig {
    /// Config for the `index`th demo node
    pub fn node_config(&self, index: usize, encryption_key: &EncryptionKey) -> Config {
        Config {
            listen_addr: self.listen_addrs[index].clone(),
            data_dir: self.data_dir.clone(),
            bootstrap_nodes: self.listen_addrs[..index].to_vec(),
            encryption_key: Some(encryption_key.to_hex()),
            log_level: self.log_level.clone(),
            ..Config::default()
        }
    }
}

impl TryFrom<DemoCommand> for DemoConfig {
    type Error = ConfigError;

    fn try_from(cmd: DemoCommand) -> Result<Self, Self::Error> {
        if cmd.listen_addrs.len() < 2 {
            return Err(ConfigError::Invalid(
                "demo needs at least two listen addresses".into(),
            ));
        }
        Ok(DemoConfig {
            data_dir: cmd.data_dir,
            listen_addrs: cmd.listen_addrs,
            keys: cmd.keys,
            log_level: cmd.log_level,
        })
    }
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Command {
    Start(Config),
    Demo(DemoConfig),
}

impl Command {
    /// Parse the process arguments; exits with usage on bad flags
    pub fn from_cli() -> Result<Self, ConfigError> {
        Self::from_parsed(Cli::parse())
    }

    /// Parse an explicit argument list, reporting bad flags as errors
    pub fn try_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_parsed(cli)
    }

    fn from_parsed(cli: Cli) -> Result<Self, ConfigError> {
        match cli.command {
            Commands::Start(cmd) => Ok(Command::Start(Config::from_start_command(cmd)?)),
            Commands::Demo(cmd) => Ok(Command::Demo(cmd.try_into()?)),
        }
    }

    pub fn log_level(&self) -> &str {
        match self {
            Command::Start(config) => &config.log_level,
            Command::Demo(demo) => &demo.log_level,
        }
    }
}

fn network_dir_name(listen_addr: &str) -> String {
    format!("{}_network", listen_addr.replace(':', ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.stream_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_root_naming() {
        let config = Config {
            listen_addr: ":3000".to_string(),
            ..Config::default()
        };
        assert_eq!(config.storage_root(), PathBuf::from("./data/3000_network"));

        let explicit = Config {
            storage_root: Some(PathBuf::from("/tmp/store")),
            ..config
        };
        assert_eq!(explicit.storage_root(), PathBuf::from("/tmp/store"));
    }

    #[test]
    fn test_start_flags_override() {
        let command = Command::try_from_args([
            "meshvault",
            "start",
            "--listen-addr",
            "127.0.0.1:4000",
            "--bootstrap-node",
            "127.0.0.1:3000",
            "--bootstrap-node",
            "127.0.0.1:5000",
            "--encryption-key",
            KEY_HEX,
            "--log-level",
            "debug",
        ])
        .unwrap();

        let Command::Start(config) = command else {
            panic!("expected start command");
        };
        assert_eq!(config.listen_addr, "127.0.0.1:4000");
        assert_eq!(config.bootstrap_nodes, vec!["127.0.0.1:3000", "127.0.0.1:5000"]);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.encryption_key().unwrap().to_hex(), KEY_HEX);
    }

    #[test]
    fn test_file_then_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            r#"
            listen_addr = "127.0.0.1:6000"
            max_file_size = 4096
            log_level = "warn"
            "#,
        )
        .unwrap();

        let command = Command::try_from_args([
            "meshvault",
            "start",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "trace",
        ])
        .unwrap();

        let Command::Start(config) = command else {
            panic!("expected start command");
        };
        assert_eq!(config.listen_addr, "127.0.0.1:6000");
        assert_eq!(config.max_file_size, 4096);
        assert_eq!(config.log_level, "trace");
        // Untouched fields keep their defaults
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let result = Command::try_from_args(["meshvault", "start", "--encryption-key", "abcd"]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Config {
            stream_timeout_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_flag_is_error() {
        let result = Command::try_from_args(["meshvault", "start", "--no-such-flag"]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_demo_defaults() {
        let command = Command::try_from_args(["meshvault", "demo"]).unwrap();
        let Command::Demo(demo) = command else {
            panic!("expected demo command");
        };
        assert_eq!(demo.listen_addrs.len(), 3);
        assert_eq!(demo.keys, 20);
        assert_eq!(Command::Demo(demo.clone()).log_level(), "info");

        let key = EncryptionKey::generate();
        let third = demo.node_config(2, &key);
        assert_eq!(third.bootstrap_nodes, demo.listen_addrs[..2].to_vec());
        assert_eq!(third.encryption_key().unwrap(), key);
    }

    #[test]
    fn test_server_opts() {
        let config = Config {
            encryption_key: Some(KEY_HEX.to_string()),
            stream_timeout_ms: 250,
            bootstrap_nodes: vec!["127.0.0.1:3000".into()],
            ..Config::default()
        };
        let opts = config.server_opts().unwrap();
        assert_eq!(opts.listen_addr, "127.0.0.1:3000");
        assert_eq!(opts.storage_root, config.storage_root());
        assert_eq!(opts.stream_timeout, Duration::from_millis(250));
        assert_eq!(opts.bootstrap_nodes, vec!["127.0.0.1:3000"]);
        assert_eq!(opts.enc_key.to_hex(), KEY_HEX);
    }
}
