//! Command line and configuration file handling
//!
//! Settings are merged in increasing precedence: built-in defaults, the
//! TOML file, then environment variables and flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cowrite_core::DocumentId;
use cowrite_session::{LocalIdentity, ManagerConfig};
use cowrite_storage::CacheBackend;
use serde::Deserialize;
use tracing::Level;

/// cowrite - edit a shared document from the terminal
#[derive(Parser, Debug)]
#[command(name = "cowrite")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Document to open
    #[arg(env = "COWRITE_DOCUMENT")]
    pub document: Option<String>,

    /// Relay URL (ws://, wss:// or memory:// for a local in-process relay)
    #[arg(short, long, env = "COWRITE_RELAY")]
    pub relay: Option<String>,

    /// Share token presented to the relay
    #[arg(short, long, env = "COWRITE_TOKEN")]
    pub token: Option<String>,

    /// Display name shown to other participants
    #[arg(short, long, env = "COWRITE_NAME")]
    pub name: Option<String>,

    /// Stable user ID, used to group several connections of one person
    #[arg(long, env = "COWRITE_USER_ID")]
    pub user_id: Option<String>,

    /// SQLite file for the offline cache (default: no cache)
    #[arg(long, env = "COWRITE_CACHE")]
    pub cache: Option<PathBuf>,

    /// Do not reconnect automatically after the link drops
    #[arg(long)]
    pub no_reconnect: bool,

    /// Configuration file path
    #[arg(short, long, env = "COWRITE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COWRITE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    pub quiet: bool,
}

/// Contents of the TOML configuration file
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub relay_url: Option<String>,
    pub document: Option<String>,
    pub token: Option<String>,
    pub name: Option<String>,
    pub user_id: Option<String>,
    pub cache: Option<PathBuf>,
    pub log_level: Option<String>,
    pub reconnect: Option<bool>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Everything the client needs to start
#[derive(Debug)]
pub struct Settings {
    pub document: DocumentId,
    pub token: Option<String>,
    pub identity: LocalIdentity,
    pub manager: ManagerConfig,
    pub log_level: Level,
    pub quiet: bool,
}

impl Settings {
    /// Read the file named by `args` (if any) and merge
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        let document = args
            .document
            .or(file.document)
            .context("No document given; pass one as an argument or set `document` in the config file")?;
        let document = DocumentId::new(document).context("Invalid document ID")?;

        let mut manager = match args.relay.or(file.relay_url) {
            Some(relay) => ManagerConfig::with_relay(relay),
            None => ManagerConfig::default(),
        };
        if let Some(path) = args.cache.or(file.cache) {
            manager = manager.with_cache(CacheBackend::Sqlite(path));
        }
        if let Some(reconnect) = file.reconnect {
            manager.transport.reconnect = reconnect;
        }
        if args.no_reconnect {
            manager.transport.reconnect = false;
        }
        if let Some(ms) = file.initial_backoff_ms {
            manager.transport.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = file.max_backoff_ms {
            manager.transport.max_backoff = Duration::from_millis(ms);
        }

        let identity = LocalIdentity {
            id: args.user_id.or(file.user_id),
            name: args.name.or(file.name),
        };

        let log_level = args.log_level.or(file.log_level).unwrap_or_else(|| "warn".into());

        Ok(Self {
            document,
            token: args.token.or(file.token).filter(|t| !t.is_empty()),
            identity,
            manager,
            log_level: parse_level(&log_level),
            quiet: args.quiet,
        })
    }
}

/// Unknown names fall back to `info`
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["cowrite"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(args(&["notes"]), FileConfig::default()).unwrap();
        assert_eq!(settings.document.as_str(), "notes");
        assert_eq!(settings.manager.relay_url, ManagerConfig::default().relay_url);
        assert!(settings.manager.cache.is_none());
        assert!(settings.manager.transport.reconnect);
        assert_eq!(settings.log_level, Level::WARN);
        assert_eq!(settings.identity, LocalIdentity::default());
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig::parse(
            r#"
            relay_url = "wss://relay.example.com"
            name = "From File"
            log_level = "debug"
            reconnect = true
            initial_backoff_ms = 250
            max_backoff_ms = 4000
            "#,
        )
        .unwrap();

        let settings = Settings::resolve(
            args(&["plan", "--relay", "ws://localhost:9000", "--no-reconnect", "--name", "Flag"]),
            file,
        )
        .unwrap();

        assert_eq!(settings.manager.relay_url, "ws://localhost:9000");
        assert!(!settings.manager.transport.reconnect);
        assert_eq!(settings.manager.transport.initial_backoff, Duration::from_millis(250));
        assert_eq!(settings.manager.transport.max_backoff, Duration::from_millis(4000));
        assert_eq!(settings.identity.name.as_deref(), Some("Flag"));
        assert_eq!(settings.log_level, Level::DEBUG);
    }

    #[test]
    fn test_document_from_file() {
        let file = FileConfig {
            document: Some("from-file".into()),
            cache: Some(PathBuf::from("/tmp/cowrite.db")),
            token: Some(String::new()),
            ..Default::default()
        };
        let settings = Settings::resolve(args(&[]), file).unwrap();
        assert_eq!(settings.document.as_str(), "from-file");
        assert!(settings.manager.cache.is_some());
        assert_eq!(settings.token, None);
    }

    #[test]
    fn test_missing_document_is_an_error() {
        assert!(Settings::resolve(args(&[]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(FileConfig::parse("relay = \"ws://x\"").is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cowrite.toml");
        std::fs::write(&path, "document = \"disk\"\nuser_id = \"u-7\"\n").unwrap();

        let settings = Settings::load(args(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(settings.document.as_str(), "disk");
        assert_eq!(settings.identity.id.as_deref(), Some("u-7"));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("loud"), Level::INFO);
    }
}
