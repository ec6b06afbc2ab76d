//! Environment-variable configuration (§6). Loading configuration from
//! environment is listed as an external collaborator in spec; this module
//! is the narrow seam the boot sequence uses to get there, not a general
//! config-file layer.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub https_port: u16,
    pub admin_port: u16,
    pub admin_api_key: String,
    pub data_dir: PathBuf,
    pub sockets_dir: PathBuf,
    pub certbot_path: PathBuf,
    pub letsencrypt_dir: PathBuf,
    pub certbot_email: Option<String>,
    pub production: bool,
    pub health_check_interval: Duration,
    pub process_start_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            http_port: env_or("HTTP_PORT", 80)?,
            https_port: env_or("HTTPS_PORT", 443)?,
            admin_port: env_or("ADMIN_PORT", 8080)?,
            admin_api_key: std::env::var("ADMIN_API_KEY")
                .context("ADMIN_API_KEY must be set")?,
            data_dir: env_path_or("DATA_DIR", "/var/lib/dowe"),
            sockets_dir: env_path_or("SOCKETS_DIR", "/var/lib/dowe/sockets"),
            certbot_path: env_path_or("CERTBOT_PATH", "/usr/bin/certbot"),
            letsencrypt_dir: env_path_or("LETSENCRYPT_DIR", "/etc/letsencrypt/live"),
            certbot_email: std::env::var("CERTBOT_EMAIL").ok(),
            production: std::env::var("NODE_ENV").as_deref() == Ok("production"),
            health_check_interval: Duration::from_millis(env_or("HEALTH_CHECK_INTERVAL", 30_000)?),
            process_start_timeout: Duration::from_millis(env_or("PROCESS_START_TIMEOUT", 10_000)?),
        })
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    pub fn webroot_dir(&self) -> PathBuf {
        self.data_dir.join("webroot")
    }

    pub fn domains_db_path(&self) -> PathBuf {
        self.data_dir.join("domains.db")
    }

    pub fn projects_db_path(&self) -> PathBuf {
        self.data_dir.join("projects.db")
    }

    #[cfg(test)]
    pub fn from_env_for_test() -> Self {
        Config {
            http_port: 80,
            https_port: 443,
            admin_port: 8080,
            admin_api_key: "test-key".to_string(),
            data_dir: PathBuf::from("/tmp/dowe-test"),
            sockets_dir: PathBuf::from("/tmp/dowe-test/sockets"),
            certbot_path: PathBuf::from("/usr/bin/certbot"),
            letsencrypt_dir: PathBuf::from("/etc/letsencrypt/live"),
            certbot_email: None,
            production: false,
            health_check_interval: Duration::from_millis(30_000),
            process_start_timeout: Duration::from_millis(10_000),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}: invalid value '{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

fn env_path_or(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}
