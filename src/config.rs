//! Service settings resolved from the environment.
//!
//! Every setting except the database URL has a default, so a bare
//! `DATABASE_URL` is enough to run against a local broker.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | required |
//! | `SOURCE_QUEUE_NAME` | `new_authors_json_queue` |
//! | `SOURCE_POLL_WAIT_SECS` | `1` |
//! | `SOURCE_NO_MESSAGE_CODES` | `25228,25254,25235,25263` |
//! | `RABBITMQ_HOSTNAME` | `localhost` |
//! | `RABBITMQ_PORT` | `5672` |
//! | `RABBITMQ_USERNAME` | `admin` |
//! | `RABBITMQ_PASSWORD` | `admin123` |
//! | `RABBITMQ_VHOST` | `/` |
//! | `BOOK_QUEUE_NAME` | `book_creation_queue` |
//! | `FAVORITE_AUTHOR_QUEUE_NAME` | `favorite_author_creation_queue` |

use std::{str::FromStr, time::Duration};

use tracing_error::SpanTrace;

use crate::source::NO_MESSAGE_CODES;

/// Fully resolved service settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Connection string shared by the source queue and the book store.
    pub database_url: String,
    pub source: SourceSettings,
    pub broker: BrokerSettings,
    pub queues: QueueNames,
}

/// Source queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub queue_name: String,
    /// How long a single dequeue waits for a message.
    pub wait: Duration,
    /// Store error codes meaning "no message available".
    pub no_message_codes: Vec<i32>,
}

/// Broker connection settings.
#[derive(Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

/// Target broker queue per outbound message kind.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueNames {
    pub book: String,
    pub favorite_author: String,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::missing("DATABASE_URL"))?;

        let no_message_codes = match lookup("SOURCE_NO_MESSAGE_CODES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(|code| {
                    code.parse::<i32>()
                        .map_err(|_| ConfigError::invalid("SOURCE_NO_MESSAGE_CODES", &raw))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => NO_MESSAGE_CODES.to_vec(),
        };

        Ok(Self {
            database_url,
            source: SourceSettings {
                queue_name: string_or(&lookup, "SOURCE_QUEUE_NAME", "new_authors_json_queue"),
                wait: Duration::from_secs(parse_or(&lookup, "SOURCE_POLL_WAIT_SECS", 1)?),
                no_message_codes,
            },
            broker: BrokerSettings {
                host: string_or(&lookup, "RABBITMQ_HOSTNAME", "localhost"),
                port: parse_or(&lookup, "RABBITMQ_PORT", 5672)?,
                username: string_or(&lookup, "RABBITMQ_USERNAME", "admin"),
                password: string_or(&lookup, "RABBITMQ_PASSWORD", "admin123"),
                vhost: string_or(&lookup, "RABBITMQ_VHOST", "/"),
            },
            queues: QueueNames {
                book: string_or(&lookup, "BOOK_QUEUE_NAME", "book_creation_queue"),
                favorite_author: string_or(
                    &lookup,
                    "FAVORITE_AUTHOR_QUEUE_NAME",
                    "favorite_author_creation_queue",
                ),
            },
        })
    }
}

impl BrokerSettings {
    /// AMQP URI for these settings, with user, password and vhost
    /// percent-encoded.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
        )
    }
}

impl std::fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

fn string_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| default.to_owned())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::invalid(key, &raw)),
        None => Ok(default),
    }
}

/// Error returned when settings cannot be resolved.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

/// Kinds of configuration errors.
#[derive(Debug, PartialEq)]
pub enum ConfigErrorKind {
    /// A required variable is not set.
    Missing(String),
    /// A variable is set but cannot be parsed.
    Invalid { key: String, value: String },
}

impl ConfigError {
    fn missing(key: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Missing(key.to_owned()),
        }
    }

    fn invalid(key: &str, value: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Invalid {
                key: key.to_owned(),
                value: value.to_owned(),
            },
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::Missing(key) => writeln!(f, "Missing setting: {key}"),
            ConfigErrorKind::Invalid { key, value } => {
                writeln!(f, "Invalid value for {key}: {value:?}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}
