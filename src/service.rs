//! MFA orchestration: setup, enable, verify, status, regenerate, disable.
//!
//! Composes the crypto box, TOTP engine, backup codes, and rate limiter over
//! caller-supplied stores. Mutating operations are serialized per account so
//! concurrent submissions cannot double-spend a backup code or race past the
//! lockout threshold; accounts never share a lock.
//!
//! Calls block only on the settings store, the failure ledger, and the audit
//! sink. Decryption and code computation are bounded CPU work, so a caller
//! wanting a deadline can wrap any operation in `tokio::time::timeout`.
//!
//! # Example
//!
//! ```rust,ignore
//! use keystep::{MasterKey, MfaConfig, MfaService, TracingAuditSink};
//!
//! let service = MfaService::new(
//!     MasterKey::from_base64(&key_from_config)?,
//!     MfaConfig::new("MyApp"),
//!     settings_store,
//!     failure_ledger,
//!     TracingAuditSink,
//! );
//!
//! let setup = service.setup("user-123").await?;
//! // Show setup.provisioning_uri and setup.backup_codes to the user once.
//! service.enable("user-123", &code_from_authenticator).await?;
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::backup::{self, BackupCodeEntry, BackupCodeGenerator, ConsumeResult};
use crate::config::MfaConfig;
use crate::crypto::{CryptoBox, MasterKey};
use crate::error::{MfaError, Result};
use crate::ratelimit::{FailureKind, FailureLedger, RateLimitDecision, RateLimiter};
use crate::storage::{MfaSettings, SettingsStore};
use crate::totp::TotpEngine;

/// Data returned once from a successful `setup` call. The seed and codes are
/// plaintext here and nowhere else; the caller formats them for display and
/// must not persist them.
#[derive(Clone, Debug)]
pub struct MfaSetup {
    /// Base32-encoded TOTP seed, for manual entry.
    pub seed_base32: String,
    /// `otpauth://totp/...` URI for authenticator apps; callers render the
    /// QR image themselves.
    pub provisioning_uri: String,
    /// Backup codes in display form (dash-grouped).
    pub backup_codes: Vec<String>,
}

/// Which credential a verification attempt used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMethod {
    Totp,
    BackupCode,
}

impl VerifyMethod {
    /// Stable name used in audit metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyMethod::Totp => "totp",
            VerifyMethod::BackupCode => "backup_code",
        }
    }
}

/// Outcome of a `verify` or `enable` attempt that reached a code comparison.
///
/// A wrong code is an unsuccessful outcome, not an error; the error type is
/// reserved for the conditions in [`MfaError`]. Callers should show a generic
/// "invalid code" message on failure regardless of `method`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verification {
    pub success: bool,
    /// The method attempted, as classified from the submitted value.
    pub method: VerifyMethod,
    /// Unused backup codes left, populated on successful backup-code use.
    pub backup_codes_remaining: Option<usize>,
}

impl Verification {
    fn rejected(method: VerifyMethod) -> Self {
        Self {
            success: false,
            method,
            backup_codes_remaining: None,
        }
    }

    /// Whether the caller should warn the user to regenerate backup codes.
    #[must_use]
    pub fn low_backup_codes(&self) -> bool {
        self.backup_codes_remaining
            .is_some_and(|n| n < backup::LOW_CODES_THRESHOLD)
    }

    /// Whether backup codes are exhausted and regeneration must be forced.
    #[must_use]
    pub fn backup_codes_exhausted(&self) -> bool {
        self.backup_codes_remaining == Some(0)
    }
}

/// Enrollment state of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfaState {
    /// No settings record exists.
    Disabled,
    /// Setup started but not confirmed; never gates login.
    Pending,
    /// Fully enabled.
    Enabled,
}

/// Read-only status report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MfaStatus {
    pub state: MfaState,
    pub backup_codes_remaining: usize,
}

impl MfaStatus {
    /// Whether verification gates login for this account.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.state == MfaState::Enabled
    }
}

/// The submitted value, classified by shape before any cryptographic work.
/// Six-digit inputs route to TOTP; backup codes use a longer, visually
/// distinct alphabet.
enum SubmittedCode {
    Totp(String),
    BackupCode(String),
    Invalid,
}

/// Orchestrates the MFA operations an authentication flow needs.
pub struct MfaService<S, L, A>
where
    S: SettingsStore,
    L: FailureLedger,
    A: AuditSink,
{
    settings: S,
    limiter: RateLimiter<L>,
    audit: A,
    cryptobox: CryptoBox,
    totp: TotpEngine,
    backup_codes: BackupCodeGenerator,
    // One mutex per account id seen by this instance; entries are a pointer
    // each, so the map is left to grow.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S, L, A> MfaService<S, L, A>
where
    S: SettingsStore,
    L: FailureLedger,
    A: AuditSink,
{
    /// Create a service. The master key is consumed here and lives only
    /// inside the crypto box.
    #[must_use]
    pub fn new(master_key: MasterKey, config: MfaConfig, settings: S, ledger: L, audit: A) -> Self {
        Self {
            settings,
            limiter: RateLimiter::new(ledger, config.rate_limit),
            audit,
            cryptobox: CryptoBox::new(&master_key),
            totp: TotpEngine::new(config.totp),
            backup_codes: config.backup_codes,
            locks: DashMap::new(),
        }
    }

    /// Get the TOTP engine (e.g. to recompute a provisioning URI).
    #[must_use]
    pub fn totp(&self) -> &TotpEngine {
        &self.totp
    }

    /// Begin enrollment for an account.
    ///
    /// Generates a seed and a backup-code batch, persists them encrypted with
    /// `enabled = false`, and returns the plaintext exactly once. A pending
    /// (unconfirmed) record is overwritten freely; an enabled record is not —
    /// call [`disable`](Self::disable) first for an explicit re-enrollment.
    pub async fn setup(&self, account_id: &str) -> Result<MfaSetup> {
        let account_id = validate_account_id(account_id)?;
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.settings.load(account_id).await? {
            if existing.enabled {
                return Err(MfaError::AlreadyEnabled);
            }
        }

        let seed = self.totp.generate_seed();
        let seed_base32 = self.totp.seed_base32(&seed);
        let provisioning_uri = self.totp.provisioning_uri(&seed, account_id)?;
        let encrypted_secret = self.cryptobox.seal(&seed)?;

        let codes = self.backup_codes.generate();
        let entries = self.seal_codes(&codes)?;

        let record = MfaSettings::pending(account_id, encrypted_secret, entries, SystemTime::now());
        self.settings.save(&record).await?;

        self.audit
            .emit(
                AuditEvent::new(AuditKind::SetupInitiated, account_id)
                    .with_metadata(json!({ "backup_codes": codes.len() })),
            )
            .await?;
        tracing::info!(
            target: "mfa.setup.initiated",
            account_id = %account_id,
            "MFA setup initiated"
        );

        Ok(MfaSetup {
            seed_base32,
            provisioning_uri,
            backup_codes: codes.iter().map(|c| backup::display_code(c)).collect(),
        })
    }

    /// Confirm a pending setup with a TOTP code from the user's authenticator.
    ///
    /// Returns `Ok(true)` and flips the record to `enabled` on a match;
    /// `Ok(false)` on a wrong code, which counts toward the rate limit. A
    /// value not shaped like a TOTP code is [`MfaError::InvalidInput`] and
    /// leaves the failure ledger untouched.
    pub async fn enable(&self, account_id: &str, code: &str) -> Result<bool> {
        let account_id = validate_account_id(account_id)?;
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.settings.load(account_id).await? else {
            return Err(MfaError::NotSetUp);
        };
        if record.enabled {
            return Err(MfaError::AlreadyEnabled);
        }

        let now = SystemTime::now();
        self.gate_rate_limit(account_id, None, now).await?;

        // Malformed input is rejected outright; only a value shaped like a
        // TOTP code reaches the comparison or counts as a failed attempt.
        let SubmittedCode::Totp(code) = self.classify(code) else {
            tracing::debug!(
                target: "mfa.setup.invalid_input",
                account_id = %account_id,
                "confirmation code is not a TOTP code"
            );
            return Err(MfaError::InvalidInput(format!(
                "a {}-digit authenticator code is required",
                self.totp.config().digits
            )));
        };

        let seed = self.open_secret(&record, "enable").await?;
        if self.totp.verify_at(&seed, &code, now)? {
            record.enabled = true;
            record.setup_completed_at = Some(now);
            record.last_used_at = Some(now);
            self.settings.save(&record).await?;
            self.limiter.record_success(account_id).await?;

            self.audit
                .emit(AuditEvent::new(AuditKind::SetupCompleted, account_id))
                .await?;
            tracing::info!(
                target: "mfa.setup.completed",
                account_id = %account_id,
                "MFA enabled"
            );
            Ok(true)
        } else {
            self.limiter
                .record_failure(account_id, FailureKind::TotpInvalid, None, now)
                .await?;
            self.audit
                .emit(
                    AuditEvent::new(AuditKind::VerificationFailed, account_id)
                        .with_metadata(json!({ "method": "totp", "stage": "enable" })),
                )
                .await?;
            tracing::debug!(
                target: "mfa.setup.code_rejected",
                account_id = %account_id,
                "setup confirmation code rejected"
            );
            Ok(false)
        }
    }

    /// Verify a submitted TOTP or backup code for an enabled account.
    ///
    /// The rate limiter is checked before settings are even loaded; a locked
    /// account is rejected with [`MfaError::RateLimited`] without touching
    /// storage, decryption, or code logic. Consuming a backup code is atomic
    /// under the account lock: the mutated record is persisted before the
    /// lock is released.
    pub async fn verify(
        &self,
        account_id: &str,
        submitted: &str,
        source_ip: Option<&str>,
    ) -> Result<Verification> {
        let account_id = validate_account_id(account_id)?;
        if submitted.trim().is_empty() {
            return Err(MfaError::InvalidInput("code is required".to_string()));
        }

        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let now = SystemTime::now();
        self.gate_rate_limit(account_id, source_ip, now).await?;

        let record = self.settings.load(account_id).await?;
        let Some(mut record) = record.filter(|r| r.enabled) else {
            // Pending records never gate login. Audited like a failure, but
            // there is nothing to rate-limit against.
            self.audit
                .emit(
                    AuditEvent::new(AuditKind::VerificationFailed, account_id)
                        .with_metadata(json!({ "reason": "not_set_up" })),
                )
                .await?;
            tracing::debug!(
                target: "mfa.verify.not_set_up",
                account_id = %account_id,
                "verification attempted without enabled MFA"
            );
            return Err(MfaError::NotSetUp);
        };

        match self.classify(submitted) {
            SubmittedCode::Invalid => {
                tracing::debug!(
                    target: "mfa.verify.invalid_input",
                    account_id = %account_id,
                    "submitted value matches neither code format"
                );
                Err(MfaError::InvalidInput(
                    "code format not recognized".to_string(),
                ))
            }
            SubmittedCode::Totp(code) => {
                let seed = self.open_secret(&record, "verify").await?;
                if self.totp.verify_at(&seed, &code, now)? {
                    record.last_used_at = Some(now);
                    self.settings.save(&record).await?;
                    self.record_verified(account_id, VerifyMethod::Totp, None)
                        .await?;
                    Ok(Verification {
                        success: true,
                        method: VerifyMethod::Totp,
                        backup_codes_remaining: None,
                    })
                } else {
                    self.record_rejected(
                        account_id,
                        VerifyMethod::Totp,
                        FailureKind::TotpInvalid,
                        source_ip,
                        now,
                    )
                    .await?;
                    Ok(Verification::rejected(VerifyMethod::Totp))
                }
            }
            SubmittedCode::BackupCode(code) => {
                let consumed = match backup::verify_and_consume(
                    &self.cryptobox,
                    &mut record.backup_codes,
                    &code,
                    now,
                ) {
                    Ok(result) => result,
                    Err(MfaError::Decrypt) => {
                        return Err(self.fail_closed_decrypt(account_id, "backup_codes").await);
                    }
                    Err(e) => return Err(e),
                };

                match consumed {
                    ConsumeResult::Consumed { remaining } => {
                        record.last_used_at = Some(now);
                        self.settings.save(&record).await?;
                        self.record_verified(account_id, VerifyMethod::BackupCode, Some(remaining))
                            .await?;
                        if consumed.is_low() {
                            tracing::warn!(
                                target: "mfa.backup.low",
                                account_id = %account_id,
                                remaining = remaining,
                                "backup codes running low"
                            );
                        }
                        Ok(Verification {
                            success: true,
                            method: VerifyMethod::BackupCode,
                            backup_codes_remaining: Some(remaining),
                        })
                    }
                    ConsumeResult::NoMatch => {
                        self.record_rejected(
                            account_id,
                            VerifyMethod::BackupCode,
                            FailureKind::BackupCodeInvalid,
                            source_ip,
                            now,
                        )
                        .await?;
                        Ok(Verification::rejected(VerifyMethod::BackupCode))
                    }
                }
            }
        }
    }

    /// Read-only enrollment status.
    pub async fn status(&self, account_id: &str) -> Result<MfaStatus> {
        let account_id = validate_account_id(account_id)?;

        Ok(match self.settings.load(account_id).await? {
            None => MfaStatus {
                state: MfaState::Disabled,
                backup_codes_remaining: 0,
            },
            Some(record) => MfaStatus {
                state: if record.enabled {
                    MfaState::Enabled
                } else {
                    MfaState::Pending
                },
                backup_codes_remaining: record.backup_codes_remaining(),
            },
        })
    }

    /// Replace the whole backup-code batch for an enabled account.
    ///
    /// Previously issued codes, used or not, become permanently invalid.
    /// Returns the new plaintext codes exactly once, in display form.
    pub async fn regenerate_backup_codes(&self, account_id: &str) -> Result<Vec<String>> {
        let account_id = validate_account_id(account_id)?;
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.settings.load(account_id).await?.filter(|r| r.enabled) else {
            return Err(MfaError::NotSetUp);
        };

        let codes = self.backup_codes.generate();
        record.backup_codes = self.seal_codes(&codes)?;
        self.settings.save(&record).await?;

        self.audit
            .emit(
                AuditEvent::new(AuditKind::BackupCodesRegenerated, account_id)
                    .with_metadata(json!({ "count": codes.len() })),
            )
            .await?;
        tracing::info!(
            target: "mfa.backup.regenerated",
            account_id = %account_id,
            count = codes.len(),
            "backup codes regenerated"
        );

        Ok(codes.iter().map(|c| backup::display_code(c)).collect())
    }

    /// Remove an account's MFA settings and failure history entirely.
    ///
    /// This is the explicit path to re-enrollment after
    /// [`MfaError::AlreadyEnabled`]; callers gate it behind their own
    /// re-authentication policy.
    pub async fn disable(&self, account_id: &str) -> Result<()> {
        let account_id = validate_account_id(account_id)?;
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;

        if self.settings.load(account_id).await?.is_none() {
            return Err(MfaError::NotSetUp);
        }

        self.settings.delete(account_id).await?;
        self.limiter.ledger().clear(account_id).await?;

        self.audit
            .emit(AuditEvent::new(AuditKind::Disabled, account_id))
            .await?;
        tracing::info!(
            target: "mfa.disabled",
            account_id = %account_id,
            "MFA disabled"
        );

        Ok(())
    }

    /// Reject locked accounts before any code logic runs.
    async fn gate_rate_limit(
        &self,
        account_id: &str,
        source_ip: Option<&str>,
        now: SystemTime,
    ) -> Result<()> {
        if let RateLimitDecision::Locked { retry_after } =
            self.limiter.check(account_id, now).await?
        {
            self.limiter
                .record_failure(account_id, FailureKind::RateLimited, source_ip, now)
                .await?;
            self.audit
                .emit(
                    AuditEvent::new(AuditKind::RateLimited, account_id).with_metadata(
                        json!({ "retry_after_secs": retry_after.as_secs(), "source_ip": source_ip }),
                    ),
                )
                .await?;
            tracing::warn!(
                target: "mfa.verify.rate_limited",
                account_id = %account_id,
                retry_after_secs = retry_after.as_secs(),
                "verification attempt while locked"
            );
            return Err(MfaError::RateLimited { retry_after });
        }
        Ok(())
    }

    async fn record_verified(
        &self,
        account_id: &str,
        method: VerifyMethod,
        remaining: Option<usize>,
    ) -> Result<()> {
        self.limiter.record_success(account_id).await?;

        self.audit
            .emit(
                AuditEvent::new(AuditKind::VerificationSuccess, account_id)
                    .with_metadata(json!({ "method": method.as_str() })),
            )
            .await?;

        if let Some(remaining) = remaining {
            self.audit
                .emit(
                    AuditEvent::new(AuditKind::BackupCodeUsed, account_id)
                        .with_metadata(json!({ "remaining": remaining })),
                )
                .await?;
        }

        tracing::info!(
            target: "mfa.verify.success",
            account_id = %account_id,
            method = method.as_str(),
            "verification succeeded"
        );
        Ok(())
    }

    async fn record_rejected(
        &self,
        account_id: &str,
        method: VerifyMethod,
        kind: FailureKind,
        source_ip: Option<&str>,
        now: SystemTime,
    ) -> Result<()> {
        self.limiter
            .record_failure(account_id, kind, source_ip, now)
            .await?;
        self.audit
            .emit(
                AuditEvent::new(AuditKind::VerificationFailed, account_id)
                    .with_metadata(json!({ "method": method.as_str() })),
            )
            .await?;
        tracing::debug!(
            target: "mfa.verify.rejected",
            account_id = %account_id,
            method = method.as_str(),
            "verification rejected"
        );
        Ok(())
    }

    /// Decrypt the stored seed, failing closed on a bad envelope: the error
    /// surfaces for manual recovery, never as "treat as no MFA".
    async fn open_secret(&self, record: &MfaSettings, stage: &str) -> Result<Vec<u8>> {
        match self.cryptobox.open(&record.encrypted_secret) {
            Ok(seed) => Ok(seed),
            Err(MfaError::Decrypt) => {
                Err(self.fail_closed_decrypt(&record.account_id, stage).await)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_closed_decrypt(&self, account_id: &str, stage: &str) -> MfaError {
        tracing::error!(
            target: "mfa.decrypt_failure",
            account_id = %account_id,
            stage = stage,
            "stored MFA envelope could not be opened; manual recovery required"
        );
        // Audit failure must not mask the decrypt error itself.
        let _ = self
            .audit
            .emit(
                AuditEvent::new(AuditKind::VerificationFailed, account_id)
                    .with_metadata(json!({ "reason": "decrypt_error", "stage": stage })),
            )
            .await;
        MfaError::Decrypt
    }

    fn seal_codes(&self, codes: &[String]) -> Result<Vec<BackupCodeEntry>> {
        codes
            .iter()
            .map(|code| self.cryptobox.seal(code.as_bytes()).map(BackupCodeEntry::new))
            .collect()
    }

    fn classify(&self, submitted: &str) -> SubmittedCode {
        let compact = submitted.replace([' ', '-'], "");
        if compact.len() == self.totp.config().digits && compact.bytes().all(|b| b.is_ascii_digit())
        {
            return SubmittedCode::Totp(compact);
        }
        let normalized = backup::normalize(submitted);
        if self.backup_codes.matches_format(&normalized) {
            return SubmittedCode::BackupCode(normalized);
        }
        SubmittedCode::Invalid
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

fn validate_account_id(account_id: &str) -> Result<&str> {
    let trimmed = account_id.trim();
    if trimmed.is_empty() {
        return Err(MfaError::InvalidInput("account id is required".to_string()));
    }
    Ok(trimmed)
}
