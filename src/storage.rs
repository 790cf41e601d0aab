//! Settings persistence seam.
//!
//! The core owns the [`MfaSettings`] lifecycle but not the backing store.
//! Implement [`SettingsStore`] for your database layer; store errors map to
//! [`MfaError::Persistence`](crate::MfaError::Persistence) so verification
//! fails closed when the store is unavailable.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backup::BackupCodeEntry;
use crate::crypto::Envelope;
use crate::error::Result;

/// Per-account MFA settings record.
///
/// Invariant: `enabled` implies the secret is present and at least one backup
/// entry exists (possibly all used; exhaustion is a UX warning, not a
/// structural violation). A record with `enabled == false` is an in-progress
/// setup and never gates login.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MfaSettings {
    pub account_id: String,
    /// Envelope wrapping the raw TOTP seed.
    pub encrypted_secret: Envelope,
    /// One envelope per backup code, each with its own `used` flag.
    pub backup_codes: Vec<BackupCodeEntry>,
    /// False until setup is confirmed with a valid TOTP code.
    pub enabled: bool,
    pub created_at: SystemTime,
    pub setup_completed_at: Option<SystemTime>,
    pub last_used_at: Option<SystemTime>,
}

impl MfaSettings {
    /// Create an unconfirmed (pending) record.
    #[must_use]
    pub fn pending(
        account_id: impl Into<String>,
        encrypted_secret: Envelope,
        backup_codes: Vec<BackupCodeEntry>,
        now: SystemTime,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            encrypted_secret,
            backup_codes,
            enabled: false,
            created_at: now,
            setup_completed_at: None,
            last_used_at: None,
        }
    }

    /// Count of unused backup codes. Reads the plaintext `used` flags only;
    /// no decryption.
    #[must_use]
    pub fn backup_codes_remaining(&self) -> usize {
        self.backup_codes.iter().filter(|e| !e.used).count()
    }
}

/// Trait for persisting [`MfaSettings`].
///
/// The service serializes mutations per account, so `save` may be a plain
/// overwrite as long as the store routes all writers through this crate.
/// Stores shared with other writers should still apply compare-and-swap.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load the settings for an account, if any.
    async fn load(&self, account_id: &str) -> Result<Option<MfaSettings>>;

    /// Persist the settings, replacing any existing record for the account.
    async fn save(&self, settings: &MfaSettings) -> Result<()>;

    /// Delete the settings for an account. Deleting a missing record is not
    /// an error.
    async fn delete(&self, account_id: &str) -> Result<()>;
}
