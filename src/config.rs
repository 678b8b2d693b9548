use crate::services::{admission::parse_duration, reaper};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_file_size: u64,
    pub max_ttl_secs: u64,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub reap_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Ephemeral end-to-end encrypted file drop")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host to bind to (overrides DROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding the metadata database and blob files (overrides DROP_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Maximum upload size in bytes (overrides DROP_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Longest accepted TTL, e.g. 30d (overrides DROP_MAX_TTL)
    #[arg(long)]
    pub max_ttl: Option<String>,

    /// Rate-limit window in seconds (overrides DROP_RATE_LIMIT_WINDOW_S)
    #[arg(long)]
    pub rate_limit_window: Option<u64>,

    /// Uploads allowed per client per window (overrides DROP_RATE_LIMIT_MAX)
    #[arg(long)]
    pub rate_limit_max: Option<usize>,

    /// Seconds between expiry sweeps (overrides DROP_REAP_INTERVAL_S)
    #[arg(long)]
    pub reap_interval: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Local client operations. Without a subcommand the server runs.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encrypt a file into a blob ready for upload and print its key
    Seal {
        /// File to encrypt
        input: PathBuf,
        /// Where to write the sealed blob
        output: PathBuf,
        /// Filename to embed (defaults to the input's file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Decrypt a downloaded blob with the key from its link
    Open {
        /// Sealed blob
        input: PathBuf,
        /// Share link, or just the base64url key after its `#`
        key: String,
        /// Directory to write the recovered file into
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

impl AppConfig {
    /// Merge CLI args over environment variables over defaults.
    pub fn from_env_and_args(args: &Args) -> Result<Self> {
        let host = match &args.host {
            Some(host) => host.clone(),
            None => env::var("DROP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        };
        let data_dir = match &args.data_dir {
            Some(dir) => dir.clone(),
            None => env::var("DROP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        };
        let max_ttl_raw = match &args.max_ttl {
            Some(raw) => raw.clone(),
            None => env::var("DROP_MAX_TTL").unwrap_or_else(|_| "30d".into()),
        };
        let max_ttl_secs = parse_duration(&max_ttl_raw)
            .with_context(|| format!("parsing max TTL `{}`", max_ttl_raw))?;
        // Expiry is stored as i64 seconds.
        anyhow::ensure!(
            max_ttl_secs <= i32::MAX as u64,
            "max TTL `{}` is unreasonably large",
            max_ttl_raw
        );

        let rate_limit_window =
            args.rate_limit_window.map_or_else(|| env_or("DROP_RATE_LIMIT_WINDOW_S", 3600), Ok)?;
        let reap_interval = args.reap_interval.map_or_else(
            || env_or("DROP_REAP_INTERVAL_S", reaper::DEFAULT_INTERVAL.as_secs()),
            Ok,
        )?;
        anyhow::ensure!(rate_limit_window > 0, "rate-limit window must be positive");
        anyhow::ensure!(reap_interval > 0, "reap interval must be positive");

        Ok(Self {
            host,
            port: args.port.map_or_else(|| env_or("DROP_PORT", 3000), Ok)?,
            data_dir,
            max_file_size: args
                .max_file_size
                .map_or_else(|| env_or("DROP_MAX_FILE_SIZE", 500 * 1024 * 1024), Ok)?,
            max_ttl_secs,
            rate_limit_window: Duration::from_secs(rate_limit_window),
            rate_limit_max: args
                .rate_limit_max
                .map_or_else(|| env_or("DROP_RATE_LIMIT_MAX", 20), Ok)?,
            reap_interval: Duration::from_secs(reap_interval),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("drop.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }
}

/// Read and parse `key`, falling back to `default` when it is unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
