use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

/// Conversational engine API configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
}

/// Pipe names used by the conversational engine
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub interview: String,
    pub scoring: String,
}

/// Capture storage and sweeping
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Directory holding capture payloads.
    pub media_dir: PathBuf,
    /// Pending entries older than this are swept.
    pub orphan_max_age_secs: u64,
    /// Interval between background sweeps.
    pub sweep_interval_secs: u64,
}

/// Session policy
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Window, from creation, during which an interrupted session may be recovered.
    pub recovery_ttl_hours: i64,
    /// Completed sessions an owner may accumulate before creation is refused.
    pub max_completed_sessions: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let engine = EngineConfig {
            api_key: env::var("ENGINE_API_KEY").map_err(|_| AppError::Config {
                message: "ENGINE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("ENGINE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/screening.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS", 30000),
        };

        let pipes = PipeConfig {
            interview: env::var("PIPE_INTERVIEW")
                .unwrap_or_else(|_| "screening-interview-v1".to_string()),
            scoring: env::var("PIPE_SCORING")
                .unwrap_or_else(|_| "screening-scoring-v1".to_string()),
        };

        let capture = CaptureConfig {
            media_dir: PathBuf::from(
                env::var("MEDIA_DIR").unwrap_or_else(|_| "./data/media".to_string()),
            ),
            orphan_max_age_secs: parse_var("CAPTURE_ORPHAN_MAX_AGE_SECS", 86_400),
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", 3_600),
        };

        let recovery_ttl_hours: i64 = parse_var("RECOVERY_TTL_HOURS", 24);
        if !(1..=MAX_RECOVERY_TTL_HOURS).contains(&recovery_ttl_hours) {
            return Err(AppError::Config {
                message: format!(
                    "RECOVERY_TTL_HOURS must be between 1 and {}, got {}",
                    MAX_RECOVERY_TTL_HOURS, recovery_ttl_hours
                ),
            });
        }

        let session = SessionConfig {
            recovery_ttl_hours,
            max_completed_sessions: parse_var("MAX_COMPLETED_SESSIONS", 2),
        };

        Ok(Config {
            engine,
            database,
            logging,
            request,
            pipes,
            capture,
            session,
        })
    }
}

/// Longest recovery window accepted from the environment: ten years.
pub const MAX_RECOVERY_TTL_HOURS: i64 = 87_600;

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 30000 }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recovery_ttl_hours: 24,
            max_completed_sessions: 2,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            interview: "screening-interview-v1".to_string(),
            scoring: "screening-scoring-v1".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Capture settings rooted at the given media directory.
    pub fn with_media_dir(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            orphan_max_age_secs: 86_400,
            sweep_interval_secs: 3_600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.recovery_ttl_hours, 24);
        assert_eq!(config.max_completed_sessions, 2);
    }

    #[test]
    fn test_capture_config_with_media_dir() {
        let config = CaptureConfig::with_media_dir("/tmp/media");
        assert_eq!(config.media_dir, PathBuf::from("/tmp/media"));
        assert_eq!(config.orphan_max_age_secs, 86_400);
    }
}
