use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

use crate::services::{credential_guard::HashCost, transfer_service::TransferPolicy};

/// TTL choices offered by the upload form, in minutes.
pub const DEFAULT_ALLOWED_TTL_MINUTES: [u32; 7] = [1, 5, 15, 30, 60, 360, 1440];
pub const DEFAULT_TTL_MINUTES: u32 = 15;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
/// How long an expired transfer stays on disk before the reaper may take it.
pub const DEFAULT_REAP_GRACE_SECS: u64 = 300;
const MAX_REAP_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_base_url: String,
    pub max_upload_bytes: u64,
    pub allowed_ttl_minutes: Vec<u32>,
    pub default_ttl_minutes: u32,
    pub reap_interval_secs: u64,
    pub reap_batch_size: u32,
    pub reap_grace_secs: u64,
    pub hash_cost: HashCost,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral password-protected file transfer links")]
pub struct Args {
    /// Host to bind to (overrides GB_TRANSFER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GB_TRANSFER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded blobs are stored (overrides GB_TRANSFER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GB_TRANSFER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL used to build share links (overrides GB_TRANSFER_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Largest accepted upload in bytes (overrides GB_TRANSFER_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Comma-separated TTL choices in minutes (overrides GB_TRANSFER_ALLOWED_TTL_MINUTES)
    #[arg(long)]
    pub allowed_ttl_minutes: Option<String>,

    /// TTL used when a request does not pick one (overrides GB_TRANSFER_DEFAULT_TTL_MINUTES)
    #[arg(long)]
    pub default_ttl_minutes: Option<u32>,

    /// Seconds between expiry sweeps, 0 disables them (overrides GB_TRANSFER_REAP_INTERVAL_SECS)
    #[arg(long)]
    pub reap_interval_secs: Option<u64>,

    /// Seconds an expired transfer is kept before reclamation (overrides GB_TRANSFER_REAP_GRACE_SECS)
    #[arg(long)]
    pub reap_grace_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/blobs".into(),
            database_url: "sqlite://./data/meta/transfers.db".into(),
            public_base_url: "http://localhost:3000".into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_ttl_minutes: DEFAULT_ALLOWED_TTL_MINUTES.to_vec(),
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            reap_interval_secs: 60,
            reap_batch_size: 500,
            reap_grace_secs: DEFAULT_REAP_GRACE_SECS,
            hash_cost: HashCost::default(),
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Layer CLI args over `GB_TRANSFER_*` variables over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env::var("GB_TRANSFER_HOST").unwrap_or(defaults.host);
        let env_port = env_parse("GB_TRANSFER_PORT", defaults.port)?;
        let env_storage = env::var("GB_TRANSFER_STORAGE_DIR").unwrap_or(defaults.storage_dir);
        let env_db = env::var("GB_TRANSFER_DATABASE_URL").unwrap_or(defaults.database_url);
        let env_base_url =
            env::var("GB_TRANSFER_PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url);
        let env_max_upload = env_parse("GB_TRANSFER_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?;
        let env_default_ttl =
            env_parse("GB_TRANSFER_DEFAULT_TTL_MINUTES", defaults.default_ttl_minutes)?;
        let env_reap_interval =
            env_parse("GB_TRANSFER_REAP_INTERVAL_SECS", defaults.reap_interval_secs)?;
        let reap_batch_size = env_parse("GB_TRANSFER_REAP_BATCH_SIZE", defaults.reap_batch_size)?;
        let env_reap_grace = env_parse("GB_TRANSFER_REAP_GRACE_SECS", defaults.reap_grace_secs)?;

        let allowed_ttl_minutes = match args
            .allowed_ttl_minutes
            .or_else(|| env::var("GB_TRANSFER_ALLOWED_TTL_MINUTES").ok())
        {
            Some(raw) => parse_ttl_list(&raw)?,
            None => defaults.allowed_ttl_minutes,
        };

        let hash_cost = HashCost {
            memory_kib: env_parse("GB_TRANSFER_ARGON2_MEMORY_KIB", defaults.hash_cost.memory_kib)?,
            iterations: env_parse("GB_TRANSFER_ARGON2_ITERATIONS", defaults.hash_cost.iterations)?,
            parallelism: env_parse(
                "GB_TRANSFER_ARGON2_PARALLELISM",
                defaults.hash_cost.parallelism,
            )?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args
                .public_base_url
                .unwrap_or(env_base_url)
                .trim_end_matches('/')
                .to_string(),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            allowed_ttl_minutes,
            default_ttl_minutes: args.default_ttl_minutes.unwrap_or(env_default_ttl),
            reap_interval_secs: args.reap_interval_secs.unwrap_or(env_reap_interval),
            reap_batch_size,
            reap_grace_secs: args.reap_grace_secs.unwrap_or(env_reap_grace),
            hash_cost,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowed_ttl_minutes.is_empty() {
            bail!("allowed TTL list must not be empty");
        }
        if !self.allowed_ttl_minutes.contains(&self.default_ttl_minutes) {
            bail!(
                "default TTL {} minutes is not one of the allowed values {:?}",
                self.default_ttl_minutes,
                self.allowed_ttl_minutes
            );
        }
        if self.max_upload_bytes == 0 {
            bail!("max upload size must be positive");
        }
        if self.reap_batch_size == 0 {
            bail!("reap batch size must be positive");
        }
        if self.reap_grace_secs > MAX_REAP_GRACE_SECS {
            bail!("reap grace period must be at most {} seconds", MAX_REAP_GRACE_SECS);
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_secs > 0).then(|| Duration::from_secs(self.reap_interval_secs))
    }

    pub fn reap_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reap_grace_secs.min(MAX_REAP_GRACE_SECS) as i64)
    }

    pub fn transfer_policy(&self) -> TransferPolicy {
        TransferPolicy {
            allowed_ttl_minutes: self.allowed_ttl_minutes.clone(),
            default_ttl_minutes: self.default_ttl_minutes,
            max_upload_bytes: self.max_upload_bytes,
            public_base_url: self.public_base_url.clone(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn parse_ttl_list(raw: &str) -> Result<Vec<u32>> {
    let mut values = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("parsing TTL entry `{}`", s))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.iter().any(|v| *v == 0) {
        bail!("TTL entries must be positive");
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}
