//! Configuration types, built from environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatch::retry::RetryPolicy;
use crate::error::ConfigError;

/// Job store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,
    /// Maximum concurrently open connections.
    pub pool_size: usize,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// Failed jobs at or above this try count are never claimed again.
    pub max_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/mailer.db"),
            pool_size: 8,
            busy_timeout: Duration::from_secs(5),
            max_attempts: 20,
        }
    }
}

/// Dispatch loop pacing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum jobs claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Upper bound on a single transport send.
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            poll_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// SMTP relay settings shared by every routing domain.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Local part of the default sender, joined with the routing domain.
    pub default_from_local: String,
    /// Display name used when a job has no sender name.
    pub default_from_name: Option<String>,
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryPolicy,
    /// Outbound domains; the first one is the default route.
    pub domains: Vec<String>,
    /// `None` runs every domain through the sandbox transport.
    pub smtp: Option<SmtpConfig>,
    pub production: bool,
    pub port: u16,
    pub hmac_secret: SecretString,
}

impl MailerConfig {
    /// Build config from process environment variables.
    ///
    /// Values missing from the environment are read from `SECRETS_FILE` when
    /// it is set (a missing or malformed file is an error), otherwise from a
    /// `.env` file if one is found.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file: HashMap<String, String> = match std::env::var("SECRETS_FILE") {
            Ok(path) if !path.is_empty() => read_env_file(Path::new(&path))?,
            _ => dotenvy::dotenv_iter()
                .map(|iter| iter.filter_map(Result::ok).collect())
                .unwrap_or_default(),
        };
        Self::from_lookup(layered(file))
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let poll_secs: u64 = required(&lookup, "MAIL_SEND_TIMER")?;

        let store = StoreConfig {
            path: lookup("MAILER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| StoreConfig::default().path),
            pool_size: optional(&lookup, "MAILER_DB_POOL_SIZE", 8)?,
            busy_timeout: Duration::from_millis(optional(&lookup, "MAILER_DB_BUSY_TIMEOUT_MS", 5000)?),
            max_attempts: optional(&lookup, "MAILER_MAX_ATTEMPTS", 20)?,
        };

        let dispatch = DispatchConfig {
            batch_size: optional(&lookup, "MAILER_BATCH_SIZE", 1000)?,
            poll_interval: Duration::from_secs(poll_secs),
            send_timeout: Duration::from_secs(optional(&lookup, "MAILER_SEND_TIMEOUT_SECS", 30)?),
        };

        let retry = RetryPolicy {
            max_attempts: store.max_attempts,
            backoff_unit_secs: optional(&lookup, "MAILER_BACKOFF_SECS", 100)?,
        };

        let domains: Vec<String> = lookup("MAIL_DOMAINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if domains.is_empty() {
            return Err(ConfigError::MissingEnvVar("MAIL_DOMAINS".into()));
        }

        let production = lookup("PROD").as_deref() == Some("1");

        let smtp = match lookup("SMTP_HOST").filter(|h| !h.is_empty()) {
            Some(host) => Some(SmtpConfig {
                host,
                port: optional(&lookup, "SMTP_PORT", 587)?,
                username: lookup("SMTP_USERNAME").unwrap_or_default(),
                password: SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default()),
                default_from_local: lookup("MAIL_DEFAULT_FROM_LOCAL")
                    .unwrap_or_else(|| "hello".to_string()),
                default_from_name: lookup("MAIL_DEFAULT_FROM_NAME").filter(|s| !s.is_empty()),
            }),
            None if production => {
                return Err(ConfigError::MissingEnvVar("SMTP_HOST".into()));
            }
            None => None,
        };

        let hmac_secret = lookup("HMAC_SECRET")
            .filter(|s| !s.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("HMAC_SECRET".into()))?;

        Ok(Self {
            store,
            dispatch,
            retry,
            domains,
            smtp,
            production,
            port: optional(&lookup, "PORT", 8080)?,
            hmac_secret,
        })
    }

    /// Domain used when a job's routing domain has no transport.
    pub fn default_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }
}

/// Parse a dotenv-style file into key/value pairs.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let invalid = |e: dotenvy::Error| ConfigError::InvalidValue {
        key: "SECRETS_FILE".to_string(),
        message: format!("{}: {e}", path.display()),
    };
    dotenvy::from_path_iter(path)
        .map_err(invalid)?
        .map(|item| item.map_err(invalid))
        .collect()
}

/// Process environment first, then `file`.
fn layered(file: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key: &str| std::env::var(key).ok().or_else(|| file.get(key).cloned())
}

fn required<T, F>(lookup: &F, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    parse(key, &raw)
}

fn optional<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => parse(key, &raw),
        _ => Ok(default),
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("MAIL_SEND_TIMER", "15"),
            ("MAIL_DOMAINS", "mail.example.com, news.example.com"),
            ("HMAC_SECRET", "s3cret"),
        ]
    }

    #[test]
    fn defaults_applied() {
        let config = MailerConfig::from_lookup(lookup_from(&minimal())).unwrap();
        assert_eq!(config.dispatch.poll_interval, Duration::from_secs(15));
        assert_eq!(config.dispatch.batch_size, 1000);
        assert_eq!(config.dispatch.send_timeout, Duration::from_secs(30));
        assert_eq!(config.store.pool_size, 8);
        assert_eq!(config.retry.max_attempts, 20);
        assert_eq!(config.retry.backoff_unit_secs, 100);
        assert_eq!(config.domains, vec!["mail.example.com", "news.example.com"]);
        assert_eq!(config.default_domain(), Some("mail.example.com"));
        assert!(config.smtp.is_none());
        assert!(!config.production);
        assert_eq!(config.hmac_secret.expose_secret(), "s3cret");
    }

    #[test]
    fn send_timer_is_required() {
        let pairs: Vec<_> = minimal()
            .into_iter()
            .filter(|(k, _)| *k != "MAIL_SEND_TIMER")
            .collect();
        let err = MailerConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "MAIL_SEND_TIMER"));
    }

    #[test]
    fn invalid_number_is_reported() {
        let mut pairs = minimal();
        pairs.push(("MAILER_BATCH_SIZE", "lots"));
        let err = MailerConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "MAILER_BATCH_SIZE"));
    }

    #[test]
    fn production_requires_smtp() {
        let mut pairs = minimal();
        pairs.push(("PROD", "1"));
        let err = MailerConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "SMTP_HOST"));

        pairs.push(("SMTP_HOST", "smtp.example.com"));
        let config = MailerConfig::from_lookup(lookup_from(&pairs)).unwrap();
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.default_from_local, "hello");
    }

    #[test]
    fn empty_domain_list_is_rejected() {
        let pairs = vec![
            ("MAIL_SEND_TIMER", "15"),
            ("MAIL_DOMAINS", " , "),
            ("HMAC_SECRET", "s3cret"),
        ];
        let err = MailerConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "MAIL_DOMAINS"));
    }

    #[test]
    fn secrets_file_supplies_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secrets.env");
        std::fs::write(
            &path,
            "MAIL_SEND_TIMER=30\nMAIL_DOMAINS=mail.example.com\nHMAC_SECRET=\"from file\"\n",
        )
        .unwrap();

        let vars = read_env_file(&path).unwrap();
        assert_eq!(vars.get("MAIL_SEND_TIMER").map(String::as_str), Some("30"));

        let config = MailerConfig::from_lookup(move |key: &str| vars.get(key).cloned()).unwrap();
        assert_eq!(config.dispatch.poll_interval, Duration::from_secs(30));
        assert_eq!(config.hmac_secret.expose_secret(), "from file");
    }

    #[test]
    fn missing_secrets_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_env_file(&tmp.path().join("absent.env")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "SECRETS_FILE"));
    }

    #[test]
    fn process_environment_wins_over_file() {
        // PATH is always set in the test process.
        let path = std::env::var("PATH").unwrap();
        let file = HashMap::from([
            ("PATH".to_string(), "/from/file".to_string()),
            ("MAILER_ONLY_IN_FILE".to_string(), "yes".to_string()),
        ]);
        let lookup = layered(file);
        assert_eq!(lookup("PATH"), Some(path));
        assert_eq!(lookup("MAILER_ONLY_IN_FILE").as_deref(), Some("yes"));
    }

    #[test]
    fn empty_domain_list_has_no_default() {
        let mut config = MailerConfig::from_lookup(lookup_from(&minimal())).unwrap();
        config.domains.clear();
        assert_eq!(config.default_domain(), None);
    }
}
