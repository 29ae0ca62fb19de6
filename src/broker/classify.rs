//! Maps raw transport failures onto a closed taxonomy.
//!
//! Classification is a pure function over the failure text; the broker calls
//! it at the transport boundary so raw errors never escape as-is. Guidance
//! strings are static per kind, not computed.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ServiceNotRunning,
    ServiceNotInstalled,
    NetworkError,
    AuthenticationError,
    ServiceError,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// Immutable classified failure. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub raw_message: String,
    pub user_message: &'static str,
    pub guidance: &'static str,
    pub icon: &'static str,
    pub severity: Severity,
    pub retryable: bool,
    pub suggested_retry_delay: Duration,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.user_message, self.raw_message)
    }
}

impl std::error::Error for ConnectionError {}

fn build(kind: ErrorKind, raw: &str) -> ConnectionError {
    let (user_message, guidance, icon, severity, retryable, delay_secs) = match kind {
        ErrorKind::ServiceNotRunning => (
            "The local LLM service is not running",
            "Start the service (e.g. `ollama serve`) or switch to a cloud connection.",
            "\u{1F50C}",
            Severity::Warning,
            true,
            30,
        ),
        ErrorKind::ServiceNotInstalled => (
            "The local LLM service does not appear to be installed",
            "Install the service from its website, then try again.",
            "\u{1F4E6}",
            Severity::Error,
            false,
            30,
        ),
        ErrorKind::NetworkError => (
            "The service host could not be resolved",
            "Check your network connection and the configured endpoint URL.",
            "\u{1F310}",
            Severity::Warning,
            true,
            20,
        ),
        ErrorKind::AuthenticationError => (
            "Authentication with the service failed",
            "Sign in again to refresh your credentials; automatic retry is paused.",
            "\u{1F511}",
            Severity::Error,
            false,
            30,
        ),
        ErrorKind::ServiceError => (
            "The service reported an internal error",
            "The backend is having trouble; it usually recovers on its own.",
            "\u{26A0}",
            Severity::Warning,
            true,
            60,
        ),
        ErrorKind::Timeout => (
            "The connection attempt timed out",
            "The service may be busy or unreachable; retrying shortly.",
            "\u{23F1}",
            Severity::Warning,
            true,
            15,
        ),
        ErrorKind::Unknown => (
            "The connection failed",
            "An unexpected error occurred; retrying shortly.",
            "\u{2753}",
            Severity::Warning,
            true,
            30,
        ),
    };

    ConnectionError {
        kind,
        raw_message: raw.to_string(),
        user_message,
        guidance,
        icon,
        severity,
        retryable,
        suggested_retry_delay: Duration::from_secs(delay_secs),
    }
}

fn has_http_status(text: &str, codes: &[&str]) -> bool {
    codes.iter().any(|code| {
        text.contains(&format!("http {code}")) || text.contains(&format!("status {code}"))
    })
}

fn has_5xx_status(text: &str) -> bool {
    (500..=599).any(|code| {
        text.contains(&format!("http {code}")) || text.contains(&format!("status {code}"))
    })
}

/// Classifies a raw failure. First matching signature wins.
pub fn classify(raw: &str) -> ConnectionError {
    let lowered = raw.to_lowercase();

    let kind = if lowered.contains("connection refused")
        || lowered.contains("actively refused")
        || lowered.contains("econnrefused")
    {
        ErrorKind::ServiceNotRunning
    } else if lowered.contains("not installed")
        || lowered.contains("no such file or directory")
        || lowered.contains("program not found")
    {
        ErrorKind::ServiceNotInstalled
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        ErrorKind::Timeout
    } else if lowered.contains("dns error")
        || lowered.contains("failed to lookup")
        || lowered.contains("name or service not known")
        || lowered.contains("nodename nor servname")
    {
        ErrorKind::NetworkError
    } else if has_http_status(&lowered, &["401", "403"])
        || lowered.contains("unauthorized")
        || lowered.contains("forbidden")
        || lowered.contains("authentication")
    {
        ErrorKind::AuthenticationError
    } else if has_5xx_status(&lowered) || lowered.contains("internal server error") {
        ErrorKind::ServiceError
    } else {
        ErrorKind::Unknown
    };

    build(kind, raw)
}
