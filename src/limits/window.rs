//! Usage Windows
//!
//! Fixed windows aligned to the Unix epoch, so every counter of a given kind
//! rolls over at the same instant (top of the minute, hour, UTC day).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Window length for a usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    /// All window kinds, shortest first
    pub const ALL: [WindowKind; 3] = [WindowKind::Minute, WindowKind::Hour, WindowKind::Day];

    /// Length of the window
    pub fn length(self) -> Duration {
        match self {
            WindowKind::Minute => Duration::from_secs(60),
            WindowKind::Hour => Duration::from_secs(3_600),
            WindowKind::Day => Duration::from_secs(86_400),
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            WindowKind::Minute => 0,
            WindowKind::Hour => 1,
            WindowKind::Day => 2,
        }
    }

    /// Start of the window containing `now`
    pub fn start_of(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let len = self.length().as_secs() as i64;
        let ts = now.timestamp();
        let start = ts - ts.rem_euclid(len);
        Utc.timestamp_opt(start, 0).single().unwrap_or(now)
    }

    /// End (exclusive) of the window starting at `start`
    pub fn end_of(self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + crate::clock::to_chrono(self.length())
    }
}

/// Limits for one window; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowQuota {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl WindowQuota {
    pub fn new(requests: Option<u64>, tokens: Option<u64>) -> Self {
        Self { requests, tokens }
    }

    fn is_unlimited(&self) -> bool {
        self.requests.is_none() && self.tokens.is_none()
    }
}

/// Per-window quotas of a credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotas {
    #[serde(default, skip_serializing_if = "WindowQuota::is_unlimited")]
    pub minute: WindowQuota,

    #[serde(default, skip_serializing_if = "WindowQuota::is_unlimited")]
    pub hour: WindowQuota,

    #[serde(default, skip_serializing_if = "WindowQuota::is_unlimited")]
    pub day: WindowQuota,
}

impl Quotas {
    /// No limits at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Quota for one window kind
    pub fn get(&self, kind: WindowKind) -> WindowQuota {
        match kind {
            WindowKind::Minute => self.minute,
            WindowKind::Hour => self.hour,
            WindowKind::Day => self.day,
        }
    }

    /// Set per-minute limits
    pub fn per_minute(mut self, requests: Option<u64>, tokens: Option<u64>) -> Self {
        self.minute = WindowQuota::new(requests, tokens);
        self
    }

    /// Set per-hour limits
    pub fn per_hour(mut self, requests: Option<u64>, tokens: Option<u64>) -> Self {
        self.hour = WindowQuota::new(requests, tokens);
        self
    }

    /// Set per-day limits
    pub fn per_day(mut self, requests: Option<u64>, tokens: Option<u64>) -> Self {
        self.day = WindowQuota::new(requests, tokens);
        self
    }

    /// Fill unset windows from `defaults`
    pub fn or(self, defaults: &Quotas) -> Self {
        let pick = |own: WindowQuota, fallback: WindowQuota| WindowQuota {
            requests: own.requests.or(fallback.requests),
            tokens: own.tokens.or(fallback.tokens),
        };
        Self {
            minute: pick(self.minute, defaults.minute),
            hour: pick(self.hour, defaults.hour),
            day: pick(self.day, defaults.day),
        }
    }
}

/// Request/token counts within one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub window_start: DateTime<Utc>,
    pub requests: u64,
    pub tokens: u64,
}

impl UsageCounter {
    pub(crate) fn new(kind: WindowKind, now: DateTime<Utc>) -> Self {
        Self {
            window_start: kind.start_of(now),
            requests: 0,
            tokens: 0,
        }
    }

    /// Reset to zero if `now` lies in a later window. Returns true on rollover.
    pub(crate) fn roll(&mut self, kind: WindowKind, now: DateTime<Utc>) -> bool {
        let current = kind.start_of(now);
        if current > self.window_start {
            *self = Self {
                window_start: current,
                requests: 0,
                tokens: 0,
            };
            true
        } else {
            false
        }
    }
}
