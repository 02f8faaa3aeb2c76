//! Technical-error → user-facing message mapping.
//!
//! The chat never sees raw provider errors. A pattern table translates the
//! usual suspects (network codes, guarded HTTP codes, container messages)
//! into one friendly sentence; the category supplies a fallback when no
//! pattern hits. Severity drives how the failure is logged and traced.

use std::sync::LazyLock;

use regex::Regex;

use crate::failover::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Info,
}

/// Severity by taxonomy: transient failures warn, auth failures are real
/// errors, context overflow is informational (the user can fix it).
pub fn severity(category: ErrorCategory) -> Severity {
    if category.retryable() {
        return Severity::Warn;
    }
    match category {
        ErrorCategory::Auth => Severity::Error,
        ErrorCategory::ContextOverflow | ErrorCategory::Aborted => Severity::Info,
        _ => Severity::Error,
    }
}

static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    // Word-boundary guards on bare HTTP codes so "15000ms" never reads as
    // a 500.
    let table: &[(&str, &str)] = &[
        (
            r"(?i)ECONNREFUSED|connection refused|ENOTFOUND|EAI_AGAIN|dns",
            "I couldn't reach the model service. It may be down — please try again in a moment.",
        ),
        (
            r"(?i)ECONNRESET|connection reset|socket hang ?up",
            "The connection to the model service dropped mid-request. Please try again.",
        ),
        (
            r"(?i)\b429\b|rate[_ -]?limit|too many requests",
            "The model is rate-limiting us right now. Give it a minute and try again.",
        ),
        (
            r"(?i)\b50[024]\b|\b503\b|overloaded|service unavailable|bad gateway",
            "The model service is having trouble right now. Trying again shortly usually helps.",
        ),
        (
            r"(?i)\b40[13]\b|unauthorized|invalid (api )?key|insufficient[_ ]credit",
            "The model credentials were rejected. An admin needs to check the provider setup.",
        ),
        (
            r"(?i)context[_ ](length|window|limit)|token limit|prompt is too long",
            "This conversation has grown past what the model can read at once. A fresh thread (or a shorter request) will fix it.",
        ),
        (
            r"(?i)container.*(oom|out of memory)|killed by signal",
            "The sandbox ran out of resources while working on this. A smaller request should go through.",
        ),
        (
            r"(?i)timed?[_ ]?out|timeout|deadline exceeded",
            "That took longer than I'm allowed to spend, so I stopped. A narrower request should finish in time.",
        ),
        (r"(?i)preempted|abort", "Okay, stopped."),
    ];
    table
        .iter()
        .map(|(pattern, text)| (Regex::new(pattern).unwrap(), *text))
        .collect()
});

/// Map a technical error to the one-line message the chat receives.
pub fn humanize_error(message: &str, category: ErrorCategory) -> String {
    for (re, text) in PATTERNS.iter() {
        if re.is_match(message) {
            return (*text).to_string();
        }
    }
    match category {
        ErrorCategory::Auth => {
            "The model credentials were rejected. An admin needs to check the provider setup."
        }
        ErrorCategory::ContextOverflow => {
            "This conversation has grown past what the model can read at once. A fresh thread (or a shorter request) will fix it."
        }
        ErrorCategory::Aborted => "Okay, stopped.",
        ErrorCategory::RateLimit
        | ErrorCategory::Timeout
        | ErrorCategory::Overloaded
        | ErrorCategory::Transport
        | ErrorCategory::InvalidResponse => {
            "The model service is having trouble right now. Trying again shortly usually helps."
        }
        ErrorCategory::NonRetryable => {
            "Something went wrong on my side. I've kept the details in the logs."
        }
    }
    .to_string()
}
