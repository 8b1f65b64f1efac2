use std::{env, io};

use secrecy::SecretString;
use tracing::debug;

pub const DEFAULT_GEOCODER_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_CACHE_EXPIRE_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_RETRY_MAX_SECS: u64 = 60;
const DEFAULT_INTERMEDIATE_BATCH_SZ: usize = 250;
const DEFAULT_INTERMEDIATE_EXPIRE_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Reverse-geocoding endpoint; overridable so tests can point at a stub.
    pub geocoder_endpoint: String,
    /// Rotation pool of provider credentials. Must be non-empty to resolve.
    pub geocoder_api_keys: Vec<SecretString>,
    /// Number of concurrent resolution workers (one outbound call each).
    pub max_concurrent: usize,
    pub cache_expire_secs: u64,
    /// Total wall-clock budget for retrying one resolution attempt.
    pub retry_max_secs: u64,
    pub intermediate_batch_sz: usize,
    pub intermediate_expire_secs: u64,
    pub database_file_name: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_api_keys: parse_keys("GEOCODER_API_KEYS"),
            max_concurrent: parse_usize("GEOCODER_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT).max(1),
            cache_expire_secs: parse_u64("GEOCODER_CACHE_EXPIRE_SECS", DEFAULT_CACHE_EXPIRE_SECS),
            retry_max_secs: parse_u64("GEOCODER_RETRY_MAX_SECS", DEFAULT_RETRY_MAX_SECS).max(1),
            intermediate_batch_sz: parse_usize(
                "INTERMEDIATE_BATCH_SZ",
                DEFAULT_INTERMEDIATE_BATCH_SZ,
            )
            .max(1),
            intermediate_expire_secs: parse_u64(
                "INTERMEDIATE_EXPIRE_SECS",
                DEFAULT_INTERMEDIATE_EXPIRE_SECS,
            ),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "geo-resolve.db".to_string()),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_keys(key: &str) -> Vec<SecretString> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| SecretString::from(entry.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
