//! Upstream Retry Hints
//!
//! Extracts "come back later" guidance from provider responses so it can be
//! folded into the aggregate retry hint of a failed dispatch.

use reqwest::header::HeaderMap;
use std::time::Duration;

/// Headers checked for a retry delay, most specific first
const RETRY_HEADERS: &[&str] = &[
    "retry-after-ms",
    "retry-after",
    "x-ratelimit-reset-requests",
    "x-ratelimit-reset-tokens",
    "x-ratelimit-reset",
];

/// Fallback delay when a provider signals a rate limit without saying for how long
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Longest delay an upstream hint may impose
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(24 * 60 * 60);

/// Detect if a response indicates a rate limit error
pub fn is_rate_limit_error(status: u16, body: &str) -> bool {
    // HTTP 429 Too Many Requests
    if status == 429 {
        return true;
    }

    // Some providers return 400 or 403 with rate limit messages
    let lower_body = body.to_lowercase();
    lower_body.contains("rate limit")
        || lower_body.contains("rate_limit")
        || lower_body.contains("too many requests")
        || lower_body.contains("quota exceeded")
}

/// Read the retry delay advertised in response headers, if any.
///
/// Values beyond [`MAX_RETRY_HINT`] are clamped; values that cannot be
/// represented are ignored.
pub fn from_headers(headers: &HeaderMap) -> Option<Duration> {
    RETRY_HEADERS
        .iter()
        .find_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?.trim();
            if *name == "retry-after-ms" {
                return value
                    .parse::<f64>()
                    .ok()
                    .filter(|ms| *ms >= 0.0)
                    .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok());
            }
            value
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
                .or_else(|| parse_duration_string(value))
        })
        .map(|hint| hint.min(MAX_RETRY_HINT))
}

/// Retry delay for a failed response: advertised headers win, then the
/// default for rate-limit responses, else nothing.
pub fn for_response(status: u16, headers: &HeaderMap, body: &str) -> Option<Duration> {
    from_headers(headers).or_else(|| {
        is_rate_limit_error(status, body).then_some(DEFAULT_RATE_LIMIT_DELAY)
    })
}

/// Parse a duration string like "1m30s" or "2h" into a Duration.
///
/// Returns `None` when the value overflows.
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(stripped) = s.strip_suffix("ms") {
        return stripped.parse::<u64>().ok().map(Duration::from_millis);
    }

    // Compound form, e.g. "1m30s" or "2h30m"
    if s.contains('h') || (s.contains('m') && s.contains('s')) {
        let mut total_secs = 0u64;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else if !current_num.is_empty() {
                if let Ok(n) = current_num.parse::<u64>() {
                    let secs = match c {
                        'h' => n.checked_mul(3600)?,
                        'm' => n.checked_mul(60)?,
                        's' => n,
                        _ => 0,
                    };
                    total_secs = total_secs.checked_add(secs)?;
                }
                current_num.clear();
            }
        }

        if total_secs > 0 {
            return Some(Duration::from_secs(total_secs));
        }
    }

    if let Some(stripped) = s.strip_suffix('s') {
        return stripped
            .parse::<f64>()
            .ok()
            .filter(|secs| *secs >= 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    }
    if let Some(stripped) = s.strip_suffix('m') {
        return stripped
            .parse::<u64>()
            .ok()
            .and_then(|mins| mins.checked_mul(60))
            .map(Duration::from_secs);
    }
    if let Some(stripped) = s.strip_suffix('h') {
        return stripped
            .parse::<u64>()
            .ok()
            .and_then(|hours| hours.checked_mul(3600))
            .map(Duration::from_secs);
    }

    None
}
