//! Failure-based rate limiting with temporary lockout.
//!
//! Lock state is derived lazily from the failure ledger at check time; there
//! is no separate counter that can drift out of sync with the records.
//!
//! # Tracing Events
//!
//! - `mfa.ratelimit.locked` - a check found the account locked
//! - `mfa.ratelimit.failure_recorded` - a failed attempt was appended
//! - `mfa.ratelimit.cleared` - failure history reset after a success

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default failures within the window before lockout.
const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default trailing window over which failures are counted (15 minutes).
const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Default lockout duration (15 minutes).
const DEFAULT_LOCKOUT: Duration = Duration::from_secs(15 * 60);

/// Maximum stored IP address length (IPv6 max).
const MAX_IP_LENGTH: usize = 45;

/// Truncate an IP address before storing it.
fn truncate_ip(ip: &str) -> &str {
    if ip.len() <= MAX_IP_LENGTH {
        ip
    } else {
        &ip[..MAX_IP_LENGTH]
    }
}

/// What kind of verification failure a ledger record represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A submitted TOTP code did not match.
    TotpInvalid,
    /// A submitted backup code did not match.
    BackupCodeInvalid,
    /// An attempt was made while the account was locked.
    RateLimited,
}

impl FailureKind {
    /// Stable name used in audit metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::TotpInvalid => "totp_invalid",
            FailureKind::BackupCodeInvalid => "backup_code_invalid",
            FailureKind::RateLimited => "rate_limited",
        }
    }

    /// `RateLimited` records are audit trail only; counting them toward the
    /// derivation would let a lock extend itself.
    #[must_use]
    pub fn counts_toward_lockout(self) -> bool {
        !matches!(self, FailureKind::RateLimited)
    }
}

/// One failed verification attempt. Appended on every failure, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub account_id: String,
    pub occurred_at: SystemTime,
    pub kind: FailureKind,
    /// For audit correlation only; never part of the lockout computation.
    pub source_ip: Option<String>,
}

/// Append-only store of failure records, queryable per account and time.
///
/// Records older than the rate-limit window are eligible for deletion by the
/// store; retention is not enforced here.
#[async_trait]
pub trait FailureLedger: Send + Sync {
    /// Append a record.
    async fn append(&self, record: FailureRecord) -> Result<()>;

    /// Records for the account with `occurred_at` strictly after `since`,
    /// newest first.
    async fn recent(&self, account_id: &str, since: SystemTime) -> Result<Vec<FailureRecord>>;

    /// Remove (or logically clear) all records for the account.
    async fn clear(&self, account_id: &str) -> Result<()>;
}

/// Rate-limit parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Failures within the window before the account locks.
    pub max_failures: u32,
    /// Trailing window over which failures are counted.
    pub window: Duration,
    /// How long verification stays locked after the triggering failure.
    pub lockout: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            window: DEFAULT_WINDOW,
            lockout: DEFAULT_LOCKOUT,
        }
    }
}

impl RateLimitPolicy {
    /// Create a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A strict policy (3 failures, 30 minute lockout).
    #[must_use]
    pub fn strict() -> Self {
        Self {
            max_failures: 3,
            window: Duration::from_secs(30 * 60),
            lockout: Duration::from_secs(30 * 60),
        }
    }

    /// A lenient policy (10 failures, 5 minute lockout).
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            max_failures: 10,
            window: Duration::from_secs(15 * 60),
            lockout: Duration::from_secs(5 * 60),
        }
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn max_failures(mut self, max: u32) -> Self {
        self.max_failures = max;
        self
    }

    /// Set the counting window.
    #[must_use]
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the lockout duration.
    #[must_use]
    pub fn lockout(mut self, lockout: Duration) -> Self {
        self.lockout = lockout;
        self
    }
}

/// Outcome of a rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Verification may proceed.
    Allowed,
    /// Verification is locked; retry after the given duration.
    Locked { retry_after: Duration },
}

impl RateLimitDecision {
    /// Whether the account is currently locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, RateLimitDecision::Locked { .. })
    }
}

/// Tracks failed verification attempts per account and enforces temporary
/// lockout. State is per account; accounts never share a lock.
pub struct RateLimiter<L: FailureLedger> {
    ledger: L,
    policy: RateLimitPolicy,
}

impl<L: FailureLedger> RateLimiter<L> {
    /// Create a rate limiter over a ledger.
    #[must_use]
    pub fn new(ledger: L, policy: RateLimitPolicy) -> Self {
        Self { ledger, policy }
    }

    /// Create a rate limiter with the default policy.
    #[must_use]
    pub fn with_defaults(ledger: L) -> Self {
        Self::new(ledger, RateLimitPolicy::default())
    }

    /// Get the policy.
    #[must_use]
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Get a reference to the underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Read-only query: is verification currently allowed for this account?
    ///
    /// Locked iff the count of lockout-eligible failures strictly inside the
    /// trailing window reached the threshold AND the lockout duration has not
    /// elapsed since the newest such failure. A success resets the ledger, so
    /// the newest failure is always the one that triggered the lock.
    pub async fn check(&self, account_id: &str, now: SystemTime) -> Result<RateLimitDecision> {
        let since = now.checked_sub(self.policy.window).unwrap_or(UNIX_EPOCH);
        let records = self.ledger.recent(account_id, since).await?;

        let countable: Vec<_> = records
            .iter()
            .filter(|r| r.kind.counts_toward_lockout())
            .collect();

        if (countable.len() as u32) < self.policy.max_failures {
            return Ok(RateLimitDecision::Allowed);
        }

        let Some(newest) = countable.iter().map(|r| r.occurred_at).max() else {
            return Ok(RateLimitDecision::Allowed);
        };

        match (newest + self.policy.lockout).duration_since(now) {
            Ok(retry_after) if !retry_after.is_zero() => {
                tracing::debug!(
                    target: "mfa.ratelimit.locked",
                    account_id = %account_id,
                    failures = countable.len(),
                    retry_after_secs = retry_after.as_secs(),
                    "verification locked"
                );
                Ok(RateLimitDecision::Locked { retry_after })
            }
            _ => Ok(RateLimitDecision::Allowed),
        }
    }

    /// Append a failure record. Does not decide lock state; that is derived
    /// at check time.
    pub async fn record_failure(
        &self,
        account_id: &str,
        kind: FailureKind,
        source_ip: Option<&str>,
        now: SystemTime,
    ) -> Result<()> {
        self.ledger
            .append(FailureRecord {
                account_id: account_id.to_string(),
                occurred_at: now,
                kind,
                source_ip: source_ip.map(|ip| truncate_ip(ip).to_string()),
            })
            .await?;

        tracing::debug!(
            target: "mfa.ratelimit.failure_recorded",
            account_id = %account_id,
            kind = kind.as_str(),
            "verification failure recorded"
        );

        Ok(())
    }

    /// Clear the account's failure history. Called on every successful
    /// verification: a full reset, not a decrement.
    pub async fn record_success(&self, account_id: &str) -> Result<()> {
        self.ledger.clear(account_id).await?;

        tracing::debug!(
            target: "mfa.ratelimit.cleared",
            account_id = %account_id,
            "failure history cleared"
        );

        Ok(())
    }
}
