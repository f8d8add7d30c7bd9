//! # Messages
//!
//! Anything published on a bus implements [`Message`]. Messages that carry a
//! [`Severity`] expose it through [`Message::severity`]; the fan-in
//! aggregator forwards only those rated WARNING or ERROR.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity classification for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Whether messages of this severity are aggregated.
    #[must_use]
    pub fn is_alerting(self) -> bool {
        matches!(self, Severity::Warning | Severity::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for severity strings outside `{INFO, WARNING, ERROR}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity '{0}'")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            _ => Err(UnknownSeverity(s.to_string())),
        }
    }
}

/// A value that can be published on a bus.
///
/// `Serialize` is required so failures can be reported with the offending
/// message and so persistent buses can journal their history.
pub trait Message: Clone + Serialize + Send + Sync + 'static {
    /// Severity carried by this message, if any.
    fn severity(&self) -> Option<Severity> {
        None
    }
}

impl<M: Message> Message for Option<M> {
    fn severity(&self) -> Option<Severity> {
        self.as_ref().and_then(Message::severity)
    }
}

impl Message for String {}
impl Message for u64 {}
impl Message for i64 {}
impl Message for bool {}
impl Message for serde_json::Value {}
impl Message for keel_kv::KvMapEvent {}

/// A message paired with an explicit severity.
///
/// Lets producers tag payloads that do not carry one themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithSeverity<M> {
    pub severity: Severity,
    pub message: M,
}

impl<M> WithSeverity<M> {
    pub fn new(severity: Severity, message: M) -> Self {
        Self { severity, message }
    }

    pub fn info(message: M) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: M) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: M) -> Self {
        Self::new(Severity::Error, message)
    }
}

impl<M> Message for WithSeverity<M>
where
    M: Clone + Serialize + Send + Sync + 'static,
{
    fn severity(&self) -> Option<Severity> {
        Some(self.severity)
    }
}

/// Read a severity from a free-form level string.
///
/// Unrecognized values yield `None`, so the message is not aggregated.
#[must_use]
pub fn parse_severity(level: &str) -> Option<Severity> {
    level.parse().ok()
}
