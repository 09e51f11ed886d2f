//! Environment-driven configuration, validated once at startup.

use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

use crate::{
    domain::{ChatId, UserId},
    errors::Error,
    report::DEFAULT_QUEUE_LIMIT,
    security::{is_valid_bot_token, parse_chat_id, parse_user_id},
    Result,
};

/// How pool members are isolated from each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMode {
    /// One OS process per worker (`guard --worker`).
    Process,
    /// One tokio task per worker inside the supervisor process.
    Task,
}

impl FromStr for WorkerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            other => Err(Error::Config(format!(
                "WORKER_MODE must be `process` or `task`, got `{other}`"
            ))),
        }
    }
}

/// Typed configuration, read from the environment (and `.env`) once at startup.
#[derive(Clone)]
pub struct Config {
    // Required
    pub bot_token: String,
    pub admin_id: UserId,
    pub database_url: String,
    pub report_chat_id: ChatId,

    // Worker pool
    pub workers: usize,
    pub worker_mode: WorkerMode,

    // Error reports
    pub report_interval: Duration,
    pub report_queue_limit: usize,

    // Moderation
    pub no_channel_links: bool,
    pub resolve_timeout: Duration,

    // Message persistence
    pub rate_limit_sweep: Duration,
    pub save_rate_limit: u32,
    pub save_rate_window: Duration,
    pub archive_path: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Existing environment always wins over `.env`.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<&str> = ["TOKEN", "ADMIN", "MONGO", "REPORT_CHAT_ID"]
            .into_iter()
            .filter(|key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let bot_token = get("TOKEN").unwrap_or_default();
        if !is_valid_bot_token(&bot_token) {
            warn!("TOKEN format appears invalid for a Telegram bot");
        }

        let admin_raw = get("ADMIN").unwrap_or_default();
        let admin_id = parse_user_id(&admin_raw).ok_or_else(|| {
            Error::Config("ADMIN must be a numeric Telegram user ID".to_string())
        })?;

        let database_url = get("MONGO").unwrap_or_default();
        if !database_url.starts_with("mongodb://") && !database_url.starts_with("mongodb+srv://") {
            return Err(Error::Config(
                "MONGO must be a valid MongoDB connection string".to_string(),
            ));
        }

        let report_raw = get("REPORT_CHAT_ID").unwrap_or_default();
        let report_chat_id = parse_chat_id(&report_raw).ok_or_else(|| {
            Error::Config("REPORT_CHAT_ID must be a numeric Telegram chat ID".to_string())
        })?;

        let workers = positive(&get, "WORKERS", 4usize)?;
        let worker_mode = match get("WORKER_MODE") {
            Some(raw) => raw.parse()?,
            None => WorkerMode::Process,
        };

        let report_interval = Duration::from_secs(positive(&get, "REPORT_INTERVAL_SECS", 60u64)?);
        let report_queue_limit = positive(&get, "REPORT_QUEUE_LIMIT", DEFAULT_QUEUE_LIMIT)?;

        let no_channel_links = match get("NO_CHANNEL_LINKS") {
            Some(raw) => parse_bool("NO_CHANNEL_LINKS", &raw)?,
            None => true,
        };
        let resolve_timeout = Duration::from_millis(positive(&get, "RESOLVE_TIMEOUT_MS", 5_000u64)?);

        let rate_limit_sweep =
            Duration::from_millis(positive(&get, "RATE_LIMIT_SWEEP_MS", 300_000u64)?);
        let save_rate_limit = positive(&get, "SAVE_RATE_LIMIT", 50u32)?;
        let save_rate_window =
            Duration::from_millis(positive(&get, "SAVE_RATE_WINDOW_MS", 60_000u64)?);
        let archive_path = PathBuf::from(
            get("ARCHIVE_PATH").unwrap_or_else(|| "/tmp/guard-messages.jsonl".to_string()),
        );

        Ok(Self {
            bot_token,
            admin_id,
            database_url,
            report_chat_id,
            workers,
            worker_mode,
            report_interval,
            report_queue_limit,
            no_channel_links,
            resolve_timeout,
            rate_limit_sweep,
            save_rate_limit,
            save_rate_window,
            archive_path,
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"<redacted>")
            .field("admin_id", &self.admin_id)
            .field("database_url", &"<redacted>")
            .field("report_chat_id", &self.report_chat_id)
            .field("workers", &self.workers)
            .field("worker_mode", &self.worker_mode)
            .field("report_interval", &self.report_interval)
            .field("report_queue_limit", &self.report_queue_limit)
            .field("no_channel_links", &self.no_channel_links)
            .field("resolve_timeout", &self.resolve_timeout)
            .field("rate_limit_sweep", &self.rate_limit_sweep)
            .field("save_rate_limit", &self.save_rate_limit)
            .field("save_rate_window", &self.save_rate_window)
            .field("archive_path", &self.archive_path)
            .finish()
    }
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.parse::<T>() {
        Ok(v) if v > T::default() => Ok(v),
        _ => Err(Error::Config(format!(
            "{key} must be a positive integer, got `{raw}`"
        ))),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key} must be a boolean, got `{raw}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("TOKEN", "123456:ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghi"),
            ("ADMIN", "1001"),
            ("MONGO", "mongodb://localhost:27017/guard"),
            ("REPORT_CHAT_ID", "-1009876"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config> {
        Config::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&base_env()).unwrap();
        assert_eq!(cfg.admin_id, UserId(1001));
        assert_eq!(cfg.report_chat_id, ChatId(-1009876));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.worker_mode, WorkerMode::Process);
        assert_eq!(cfg.report_interval, Duration::from_secs(60));
        assert_eq!(cfg.report_queue_limit, 100);
        assert_eq!(cfg.resolve_timeout, Duration::from_secs(5));
        assert_eq!(cfg.save_rate_limit, 50);
        assert!(cfg.no_channel_links);
    }

    #[test]
    fn lists_every_missing_variable() {
        let err = Config::from_lookup(|_| None).unwrap_err().to_string();
        for key in ["TOKEN", "ADMIN", "MONGO", "REPORT_CHAT_ID"] {
            assert!(err.contains(key), "{err}");
        }
    }

    #[test]
    fn rejects_malformed_values() {
        let mut env = base_env();
        env.insert("ADMIN", "abc");
        assert!(load(&env).is_err());

        let mut env = base_env();
        env.insert("MONGO", "postgres://x");
        assert!(load(&env).is_err());

        let mut env = base_env();
        env.insert("REPORT_CHAT_ID", "chat");
        assert!(load(&env).is_err());

        let mut env = base_env();
        env.insert("WORKERS", "0");
        assert!(load(&env).is_err());

        let mut env = base_env();
        env.insert("WORKER_MODE", "thread");
        assert!(load(&env).is_err());
    }

    #[test]
    fn bad_token_format_is_only_a_warning() {
        let mut env = base_env();
        env.insert("TOKEN", "nope");
        assert_eq!(load(&env).unwrap().bot_token, "nope");
    }

    #[test]
    fn overrides_parse() {
        let mut env = base_env();
        env.insert("WORKER_MODE", "task");
        env.insert("NO_CHANNEL_LINKS", "off");
        env.insert("MONGO", "mongodb+srv://cluster/guard");
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.worker_mode, WorkerMode::Task);
        assert!(!cfg.no_channel_links);
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = load(&base_env()).unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("ABCDEFGHIJ"));
        assert!(!dbg.contains("localhost"));
    }
}
