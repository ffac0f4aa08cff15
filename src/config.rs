use std::path::PathBuf;
use std::time::Duration;

/// application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// directory holding one sub-directory per upload session
    pub storage_root: PathBuf,
    /// bind address
    pub host: String,
    /// bind port
    pub port: u16,
    /// maximum size of a single upload request in bytes
    pub max_upload_size: usize,
    /// number of tokio worker threads
    pub worker_threads: usize,
    /// largest `total_chunks` a session may declare
    pub max_chunks: usize,
    /// cors allowed origins (comma-separated, `*` allows any)
    pub cors_origins: Vec<String>,
    /// rate limit for session creation: requests per minute, 0 disables
    pub rate_limit_per_minute: u64,
    /// how long a room stays open after its last upload start
    pub room_expiry: Duration,
    /// keepalive interval for event streams
    pub heartbeat_interval: Duration,
    /// queued events per subscriber before new ones are dropped
    pub subscriber_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./storage"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_upload_size: 1024 * 1024 * 1024, // 1GB per request
            worker_threads: 8,
            max_chunks: crate::store::DEFAULT_MAX_CHUNKS,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            rate_limit_per_minute: 60,
            room_expiry: Duration::from_secs(24 * 60 * 60),
            heartbeat_interval: Duration::from_secs(15),
            subscriber_buffer: 10,
        }
    }
}

impl Config {
    /// load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // parse cors origins
        let cors_origins = match std::env::var("CORS_ORIGINS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.cors_origins,
        };

        Self {
            storage_root: std::env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT").unwrap_or(defaults.port),
            max_upload_size: env_parse("MAX_UPLOAD_SIZE").unwrap_or(defaults.max_upload_size),
            worker_threads: env_parse("WORKER_THREADS")
                .filter(|t| *t > 0)
                .unwrap_or(defaults.worker_threads),
            max_chunks: env_parse("MAX_CHUNKS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_chunks),
            cors_origins,
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE")
                .unwrap_or(defaults.rate_limit_per_minute),
            room_expiry: env_parse::<u64>("ROOM_EXPIRY_HOURS")
                .and_then(|h| h.checked_mul(60 * 60))
                .map(Duration::from_secs)
                .unwrap_or(defaults.room_expiry),
            heartbeat_interval: env_parse::<u64>("HEARTBEAT_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            subscriber_buffer: env_parse("SUBSCRIBER_BUFFER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.subscriber_buffer),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("⚠️  Ignoring unparseable {}={:?}, using default", key, raw);
            None
        }
    }
}
