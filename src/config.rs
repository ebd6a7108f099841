// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Server configuration loaded from environment variables.
///
/// The bind address is normally supplied on the command line and only falls
/// back to the environment defaults when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    /// Document root served to clients (default: ./www)
    pub doc_root: PathBuf,

    /// Worker thread count; 0 means one per CPU (default: 8)
    pub workers: usize,

    /// Bounded work queue capacity (default: 10000)
    pub queue_capacity: usize,

    /// Connection table size; fds must fall below this (default: 65536)
    pub max_fd: usize,

    /// Concurrent connection limit for the accept gate (default: max_fd)
    pub max_connections: usize,

    /// Timer tick period in seconds; idle timeout is three ticks (default: 5)
    pub timeslot_secs: u64,

    /// Optional credential seed file, one `user:argon2hash` per line
    pub credentials_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let max_fd = std::env::var("MAX_FD")
            .unwrap_or_else(|_| "65536".to_string())
            .parse()
            .unwrap_or(65536);

        Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            doc_root: std::env::var("DOC_ROOT")
                .unwrap_or_else(|_| "./www".to_string())
                .into(),
            workers: std::env::var("WORKERS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .unwrap_or(8),
            queue_capacity: std::env::var("QUEUE_CAPACITY")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10_000),
            max_fd,
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(max_fd),
            timeslot_secs: std::env::var("TIMESLOT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            credentials_file: std::env::var("CREDENTIALS_FILE").ok().map(PathBuf::from),
        }
    }

    /// Number of worker threads after resolving the one-per-CPU default.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Timer tick period.
    pub fn timeslot(&self) -> Duration {
        Duration::from_secs(self.timeslot_secs)
    }

    /// Idle timeout: connections quiet for three ticks are evicted.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(3 * self.timeslot_secs)
    }

    /// Full listen address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
