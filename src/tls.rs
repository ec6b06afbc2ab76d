//! TLS Materializer (§4.7): loads certificates from disk, drives the ACME
//! client binary to issue/renew them, and hands the HTTPS listener a
//! `rustls::ServerConfig` whose SNI resolution is backed by this module's
//! in-memory cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::RwLock;
use tokio::process::Command;

use crate::config::Config;
use crate::error::CoreError;

const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const RENEWAL_THRESHOLD_DAYS: i64 = 30;
/// Fallback expiry when a certificate's `notAfter` can't be parsed — keeps
/// the renewal loop from renewing it on every tick.
const FALLBACK_VALIDITY_DAYS: i64 = 90;

#[derive(Clone)]
pub struct CertEntry {
    pub hostname: String,
    pub expires_at_ms: i64,
    key: Arc<CertifiedKey>,
}

pub struct TlsMaterializer {
    config: Arc<Config>,
    cache: RwLock<HashMap<String, CertEntry>>,
    /// Written by the issuance flow when the ACME client is run in-process;
    /// the HTTP listener checks this before falling back to the webroot
    /// file on disk.
    challenges: RwLock<HashMap<String, String>>,
}

impl TlsMaterializer {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
        })
    }

    /// Loads `fullchain.pem`/`privkey.pem` for every ssl-enabled hostname;
    /// misses are tolerated, the hostname is simply absent from the cache.
    pub async fn warm(&self, ssl_enabled_hostnames: &[String]) {
        for hostname in ssl_enabled_hostnames {
            match load_from_disk(&self.config.letsencrypt_dir, hostname) {
                Ok(entry) => {
                    self.cache.write().expect("tls cache lock poisoned").insert(hostname.clone(), entry);
                }
                Err(err) => {
                    tracing::debug!(%hostname, %err, "no certificate on disk yet");
                }
            }
        }
    }

    pub async fn get(&self, hostname: &str) -> Option<CertEntry> {
        self.cache.read().expect("tls cache lock poisoned").get(hostname).cloned()
    }

    pub async fn challenge_response(&self, token: &str) -> Option<String> {
        if let Some(key_auth) = self.challenges.read().expect("challenge lock poisoned").get(token).cloned() {
            return Some(key_auth);
        }
        let path = self
            .config
            .webroot_dir()
            .join(".well-known/acme-challenge")
            .join(token);
        tokio::fs::read_to_string(path).await.ok()
    }

    pub async fn set_challenge(&self, token: String, key_auth: String) {
        self.challenges.write().expect("challenge lock poisoned").insert(token, key_auth);
    }

    /// Runs `certonly --webroot`, and on success loads the freshly written
    /// certificate into the cache.
    pub async fn issue(&self, hostname: &str) -> Result<CertEntry, CoreError> {
        let webroot = self.config.webroot_dir().join(".well-known/acme-challenge");
        tokio::fs::create_dir_all(&webroot)
            .await
            .map_err(|e| CoreError::Internal(format!("creating webroot: {e}")))?;

        let email = self
            .config
            .certbot_email
            .clone()
            .unwrap_or_else(|| format!("admin@{hostname}"));

        let mut command = Command::new(&self.config.certbot_path);
        command
            .arg("certonly")
            .arg("--webroot")
            .arg("-w")
            .arg(&self.config.webroot_dir())
            .arg("-d")
            .arg(hostname)
            .arg("--non-interactive")
            .arg("--agree-tos")
            .arg("--email")
            .arg(&email);
        if !self.config.production {
            command.arg("--staging");
        }

        let output = command
            .output()
            .await
            .map_err(|e| CoreError::SslIssuanceFailed(format!("failed to run certbot: {e}")))?;
        if !output.status.success() {
            return Err(CoreError::SslIssuanceFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let entry = load_from_disk(&self.config.letsencrypt_dir, hostname)
            .map_err(|e| CoreError::SslIssuanceFailed(format!("issued but failed to load: {e}")))?;
        self.cache
            .write()
            .expect("tls cache lock poisoned")
            .insert(hostname.to_string(), entry.clone());
        Ok(entry)
    }

    async fn renew(&self, hostname: &str) -> Result<(), CoreError> {
        let output = Command::new(&self.config.certbot_path)
            .arg("renew")
            .arg("--cert-name")
            .arg(hostname)
            .arg("--non-interactive")
            .output()
            .await
            .map_err(|e| CoreError::SslIssuanceFailed(format!("failed to run certbot: {e}")))?;
        if !output.status.success() {
            return Err(CoreError::SslIssuanceFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let entry = load_from_disk(&self.config.letsencrypt_dir, hostname)?;
        self.cache.write().expect("tls cache lock poisoned").insert(hostname.to_string(), entry);
        Ok(())
    }

    /// Background loop: every 12 hours, renew any cache entry within 30
    /// days of expiry.
    pub async fn run_renewal_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RENEWAL_INTERVAL);
        loop {
            ticker.tick().await;
            let due: Vec<String> = {
                let cache = self.cache.read().expect("tls cache lock poisoned");
                let cutoff = Utc::now().timestamp_millis()
                    + RENEWAL_THRESHOLD_DAYS * 24 * 60 * 60 * 1000;
                cache
                    .values()
                    .filter(|e| e.expires_at_ms < cutoff)
                    .map(|e| e.hostname.clone())
                    .collect()
            };
            for hostname in due {
                if let Err(err) = self.renew(&hostname).await {
                    tracing::warn!(%hostname, %err, "certificate renewal failed, retrying next tick");
                }
            }
        }
    }

    /// Builds a `rustls::ServerConfig` whose SNI resolver reads this
    /// materializer's live cache; returns `None` if the cache is empty, per
    /// the "don't start the HTTPS listener" rule.
    pub async fn server_config(self: &Arc<Self>) -> Option<Arc<ServerConfig>> {
        if self.cache.read().expect("tls cache lock poisoned").is_empty() {
            return None;
        }
        let resolver = CacheResolver {
            materializer: Arc::clone(self),
        };
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Some(Arc::new(config))
    }
}

struct CacheResolver {
    materializer: Arc<TlsMaterializer>,
}

impl ResolvesServerCert for CacheResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello.server_name()?;
        let cache = self.materializer.cache.read().ok()?;
        cache.get(hostname).map(|entry| Arc::clone(&entry.key))
    }
}

fn load_from_disk(letsencrypt_dir: &Path, hostname: &str) -> Result<CertEntry, CoreError> {
    let dir = letsencrypt_dir.join(hostname);
    let fullchain_path = dir.join("fullchain.pem");
    let privkey_path = dir.join("privkey.pem");

    let fullchain_bytes = std::fs::read(&fullchain_path)
        .map_err(|e| CoreError::NotFound(format!("{}: {e}", fullchain_path.display())))?;
    let privkey_bytes = std::fs::read(&privkey_path)
        .map_err(|e| CoreError::NotFound(format!("{}: {e}", privkey_path.display())))?;

    let certs = rustls_pemfile::certs(&mut fullchain_bytes.as_slice())
        .map_err(|e| CoreError::Corruption(format!("parsing {}: {e}", fullchain_path.display())))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(CoreError::Corruption(format!(
            "{} contains no certificates",
            fullchain_path.display()
        )));
    }

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut privkey_bytes.as_slice())
        .map_err(|e| CoreError::Corruption(format!("parsing {}: {e}", privkey_path.display())))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut privkey_bytes.as_slice())
            .map_err(|e| CoreError::Corruption(format!("parsing {}: {e}", privkey_path.display())))?;
    }
    let private_key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| CoreError::Corruption(format!("{} has no private key", privkey_path.display())))?;

    let signing_key = rustls::sign::any_supported_type(&private_key)
        .map_err(|e| CoreError::Corruption(format!("unsupported key type: {e}")))?;
    let certified_key = CertifiedKey::new(certs, signing_key);

    let expires_at_ms = read_not_after_ms(&fullchain_bytes).unwrap_or_else(|| {
        (Utc::now() + chrono::Duration::days(FALLBACK_VALIDITY_DAYS)).timestamp_millis()
    });

    Ok(CertEntry {
        hostname: hostname.to_string(),
        expires_at_ms,
        key: Arc::new(certified_key),
    })
}

fn read_not_after_ms(fullchain_pem: &[u8]) -> Option<i64> {
    let mut cursor = fullchain_pem;
    let der = rustls_pemfile::certs(&mut cursor).ok()?.into_iter().next()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
    let not_after = cert.validity().not_after;
    Utc.timestamp_opt(not_after.timestamp(), 0).single().map(|dt| dt.timestamp_millis())
}

/// Hostnames whose webroot challenge directory must exist before the ACME
/// client is invoked. Exposed so the boot sequence can pre-create the
/// top-level directory even with zero ssl-enabled domains yet.
pub fn webroot_challenge_dir(config: &Config) -> PathBuf {
    config.webroot_dir().join(".well-known/acme-challenge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webroot_challenge_dir_is_under_data_dir() {
        let config = Config::from_env_for_test();
        let dir = webroot_challenge_dir(&config);
        assert!(dir.starts_with(&config.data_dir));
        assert!(dir.ends_with(".well-known/acme-challenge"));
    }
}
