use crate::{
    services::upload_service::{GuestPolicy, UploadSettings},
    storage::{Platform, registry::StorageSettings, s3::S3Settings},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub log_level: String,
    pub session_cookie: String,

    pub storage_driver: Platform,
    pub local_root: PathBuf,
    pub s3: S3Settings,

    pub chunk_dir: PathBuf,
    pub merge_dir: PathBuf,
    pub chunk_threshold: u64,
    pub max_file_size: u64,
    pub clean_limit: u64,
    pub clean_expire_secs: u64,

    pub guest_upload_enable: bool,
    pub guest_upload_max_mb: u64,
    pub guest_upload_ext_whitelist: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "File sharing server with chunked uploads")]
pub struct Args {
    /// Host to bind to (overrides LINKIT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides LINKIT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides LINKIT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage driver for new uploads: `local` or `s3` (overrides LINKIT_STORAGE_DRIVER)
    #[arg(long)]
    pub storage_driver: Option<String>,

    /// Root directory of the local backend (overrides LINKIT_LOCAL_ROOT)
    #[arg(long)]
    pub local_root: Option<PathBuf>,

    /// Scratch directory for upload chunks (overrides LINKIT_CHUNK_DIR)
    #[arg(long)]
    pub chunk_dir: Option<PathBuf>,

    /// Scratch directory for merged uploads (overrides LINKIT_MERGE_DIR)
    #[arg(long)]
    pub merge_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset (overrides LINKIT_LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let driver_raw = match args.storage_driver {
            Some(driver) => driver,
            None => env_or("LINKIT_STORAGE_DRIVER", "local".to_string())?,
        };
        let storage_driver: Platform = driver_raw
            .parse()
            .with_context(|| format!("parsing storage driver `{}`", driver_raw))?;

        let cfg = Self {
            host: args
                .host
                .map_or_else(|| env_or("LINKIT_HOST", "0.0.0.0".to_string()), Ok)?,
            port: args.port.map_or_else(|| env_or("LINKIT_PORT", 8080), Ok)?,
            database_url: args.database_url.map_or_else(
                || env_or("LINKIT_DATABASE_URL", "sqlite://./data/linkit.db".to_string()),
                Ok,
            )?,
            log_level: args
                .log_level
                .map_or_else(|| env_or("LINKIT_LOG_LEVEL", "info".to_string()), Ok)?,
            session_cookie: env_or("LINKIT_SESSION_COOKIE", "linkit_session".to_string())?,

            storage_driver,
            local_root: args.local_root.map_or_else(
                || env_or("LINKIT_LOCAL_ROOT", PathBuf::from("./data/objects")),
                Ok,
            )?,
            s3: S3Settings {
                bucket: env_or("LINKIT_S3_BUCKET", String::new())?,
                access_key: env_or("LINKIT_S3_ACCESS_KEY", String::new())?,
                secret_key: env_or("LINKIT_S3_SECRET_KEY", String::new())?,
                endpoint: env_or("LINKIT_S3_ENDPOINT", String::new())?,
                region: env_or("LINKIT_S3_REGION", "auto".to_string())?,
            },

            chunk_dir: args.chunk_dir.map_or_else(
                || env_or("LINKIT_CHUNK_DIR", PathBuf::from("./data/chunks")),
                Ok,
            )?,
            merge_dir: args.merge_dir.map_or_else(
                || env_or("LINKIT_MERGE_DIR", PathBuf::from("./data/merge")),
                Ok,
            )?,
            chunk_threshold: env_or("LINKIT_CHUNK_THRESHOLD", 100 * MIB)?,
            max_file_size: env_or("LINKIT_MAX_FILE_SIZE", 1024 * MIB)?,
            clean_limit: env_or("LINKIT_CLEAN_LIMIT", 2048 * MIB)?,
            clean_expire_secs: env_or("LINKIT_CLEAN_EXPIRE_SECS", 30 * 60)?,

            guest_upload_enable: env_or("LINKIT_GUEST_UPLOAD_ENABLE", false)?,
            guest_upload_max_mb: env_or("LINKIT_GUEST_UPLOAD_MAX_MB", 10)?,
            guest_upload_ext_whitelist: env_or("LINKIT_GUEST_UPLOAD_EXT_WHITELIST", String::new())?,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn storage_settings(&self) -> StorageSettings {
        StorageSettings {
            driver: self.storage_driver,
            local_root: self.local_root.clone(),
            s3: self.s3.clone(),
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            chunk_dir: self.chunk_dir.clone(),
            merge_dir: self.merge_dir.clone(),
            chunk_threshold: self.chunk_threshold,
            max_file_size: self.max_file_size,
            clean_limit: self.clean_limit,
            clean_expire: Duration::from_secs(self.clean_expire_secs),
            guest: GuestPolicy::new(
                self.guest_upload_enable,
                self.guest_upload_max_mb,
                &self.guest_upload_ext_whitelist,
            ),
        }
    }
}

// Hand-written so S3 credentials never reach the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("log_level", &self.log_level)
            .field("storage_driver", &self.storage_driver)
            .field("local_root", &self.local_root)
            .field("s3_bucket", &self.s3.bucket)
            .field("s3_endpoint", &self.s3.endpoint)
            .field("s3_configured", &self.s3.is_complete())
            .field("chunk_dir", &self.chunk_dir)
            .field("merge_dir", &self.merge_dir)
            .field("chunk_threshold", &self.chunk_threshold)
            .field("max_file_size", &self.max_file_size)
            .field("clean_limit", &self.clean_limit)
            .field("clean_expire_secs", &self.clean_expire_secs)
            .field("guest_upload_enable", &self.guest_upload_enable)
            .finish_non_exhaustive()
    }
}

/// Read and parse `key`, falling back to `default` when it is unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) => parse_value(key, &value),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", key, value, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_values() {
        assert_eq!(parse_value::<u16>("LINKIT_PORT", " 9000 ").unwrap(), 9000);
        assert!(parse_value::<bool>("LINKIT_GUEST_UPLOAD_ENABLE", "true").unwrap());
        assert_eq!(
            parse_value::<Platform>("LINKIT_STORAGE_DRIVER", "Cloudflare").unwrap(),
            Platform::S3
        );

        let err = parse_value::<u16>("LINKIT_PORT", "eighty").unwrap_err();
        assert!(err.to_string().contains("LINKIT_PORT"));
    }

    #[test]
    fn unset_variables_use_defaults() {
        assert_eq!(
            env_or("LINKIT_TEST_SURELY_UNSET_VARIABLE", 42u64).unwrap(),
            42
        );
    }
}
