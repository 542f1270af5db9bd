//! Limits Module
//!
//! Usage windows, the shared usage ledger and quota enforcement.

pub mod ledger;
pub mod rate_limiter;
pub mod window;

pub use ledger::{CredentialUsage, Reservation, UsageLedger};
pub use rate_limiter::{Admission, Denial, QuotaDimension, RateLimiter};
pub use window::{Quotas, UsageCounter, WindowKind, WindowQuota};
