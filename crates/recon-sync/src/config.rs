//! Run configuration read from the process environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use recon_storage::{AirtableConfig, HttpClientConfig, RetryPolicy};
use thiserror::Error;

pub const DEFAULT_LOOKUP_URL: &str = "https://nysdoccslookup.doccs.ny.gov/IncarceratedPerson/SearchByDin";
pub const DEFAULT_AIRTABLE_API_URL: &str = "https://api.airtable.com";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
pub const FEWER_RECORDS_CAP: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("{key}: cannot parse {value:?} as {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("unknown environment {0:?} (expected test, staging or production)")]
    UnknownEnvironment(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Test,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Prefix applied to credential variable names.
    pub fn credential_prefix(&self) -> &'static str {
        match self {
            Environment::Test => "TEST_",
            Environment::Staging => "STAGING_",
            Environment::Production => "",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    pub environment: Environment,
    pub airtable: AirtableConfig,
    pub airtable_view: Option<String>,
    pub identifier_field: String,
    pub lookup_url: String,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub record_limit: Option<usize>,
    pub shuffle_records: bool,
    pub enable_updates: bool,
    pub enable_typecast: bool,
    pub debug: bool,
    pub retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub notify_webhook_url: Option<String>,
    pub trigger_token: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

struct Reader<F> {
    lookup: F,
}

impl<F> Reader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).map(|v| parse_flag(&v)).unwrap_or(false)
    }

    fn parsed<T: FromStr>(&self, key: &str, expected: &'static str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| {
                value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                    expected,
                })
            })
            .transpose()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Reader { lookup };
        let environment = env
            .get("ENV")
            .map(|v| v.parse::<Environment>())
            .transpose()?
            .unwrap_or(Environment::Test);
        let prefix = environment.credential_prefix();
        let prefixed = |name: &str| format!("{prefix}{name}");

        let airtable = AirtableConfig {
            api_url: env
                .get("AIRTABLE_API_URL")
                .unwrap_or_else(|| DEFAULT_AIRTABLE_API_URL.to_string()),
            api_key: env.required(&prefixed("AIRTABLE_API_KEY"))?,
            base_id: env.required(&prefixed("AIRTABLE_BASE_ID"))?,
            table_id: env.required(&prefixed("AIRTABLE_TABLE_ID"))?,
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env
                .parsed("RETRY_MAX_ATTEMPTS", "a positive integer")?
                .unwrap_or(defaults.max_attempts),
            initial_delay: env
                .parsed::<u64>("RETRY_INITIAL_DELAY_MS", "milliseconds")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: env
                .parsed::<u64>("RETRY_MAX_DELAY_MS", "milliseconds")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_factor: match env.parsed::<f64>("RETRY_BACKOFF_FACTOR", "a factor of at least 1")? {
                Some(factor) if !factor.is_finite() || factor < 1.0 => {
                    return Err(ConfigError::Invalid {
                        key: "RETRY_BACKOFF_FACTOR".to_string(),
                        value: factor.to_string(),
                        expected: "a factor of at least 1",
                    })
                }
                Some(factor) => factor,
                None => defaults.backoff_factor,
            },
        };

        let record_limit = match env.parsed::<usize>("RECORD_LIMIT", "a record count")? {
            Some(limit) => Some(limit),
            None if env.flag("FEWER_RECORDS") => Some(FEWER_RECORDS_CAP),
            None => None,
        };

        Ok(Self {
            environment,
            airtable,
            airtable_view: env.get(&prefixed("AIRTABLE_VIEW")),
            identifier_field: env.get("IDENTIFIER_FIELD").unwrap_or_else(|| "DIN".to_string()),
            lookup_url: env.get("LOOKUP_URL").unwrap_or_else(|| DEFAULT_LOOKUP_URL.to_string()),
            batch_size: env.parsed("BATCH_SIZE", "a batch size")?.unwrap_or(50).max(1),
            batch_delay: Duration::from_millis(env.parsed("BATCH_DELAY", "milliseconds")?.unwrap_or(10_000)),
            record_limit,
            shuffle_records: env.flag("SHUFFLE_RECORDS"),
            enable_updates: env.flag("ENABLE_UPDATE_RECORDS"),
            enable_typecast: env.flag("ENABLE_TYPECAST"),
            debug: env.flag("DEBUG"),
            retry,
            http_timeout_secs: env.parsed("HTTP_TIMEOUT_SECS", "seconds")?.unwrap_or(30),
            user_agent: env.get("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            artifacts_dir: env
                .get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            workspace_root: env
                .get("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            notify_webhook_url: env.get("NOTIFY_WEBHOOK_URL"),
            trigger_token: env.get("SYNC_TRIGGER_TOKEN"),
            scheduler_enabled: env.flag("SCHEDULER_ENABLED"),
            sync_cron: env.get("SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            web_port: env.parsed("RECON_WEB_PORT", "a port number")?.unwrap_or(8080),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn redacted<T>(value: &Option<T>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("environment", &self.environment)
            .field("airtable", &self.airtable)
            .field("airtable_view", &self.airtable_view)
            .field("identifier_field", &self.identifier_field)
            .field("lookup_url", &self.lookup_url)
            .field("batch_size", &self.batch_size)
            .field("batch_delay", &self.batch_delay)
            .field("record_limit", &self.record_limit)
            .field("shuffle_records", &self.shuffle_records)
            .field("enable_updates", &self.enable_updates)
            .field("enable_typecast", &self.enable_typecast)
            .field("debug", &self.debug)
            .field("retry", &self.retry)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("artifacts_dir", &self.artifacts_dir)
            .field("workspace_root", &self.workspace_root)
            .field("notify_webhook_url", &redacted(&self.notify_webhook_url))
            .field("trigger_token", &redacted(&self.trigger_token))
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .field("web_port", &self.web_port)
            .finish()
    }
}
