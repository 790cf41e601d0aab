//! Audit event sink.
//!
//! Every setup, verification, and lockout outcome produces exactly one event
//! stream entry. Metadata never carries secrets or raw code values; it may
//! carry the method attempted, remaining-code counts, and a caller-supplied
//! source IP for correlation.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// The fixed set of audit event types this core emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditKind {
    SetupInitiated,
    SetupCompleted,
    VerificationSuccess,
    VerificationFailed,
    BackupCodeUsed,
    BackupCodesRegenerated,
    RateLimited,
    Disabled,
}

impl AuditKind {
    /// Stable event name for downstream consumers.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AuditKind::SetupInitiated => "mfa_setup_initiated",
            AuditKind::SetupCompleted => "mfa_setup_completed",
            AuditKind::VerificationSuccess => "mfa_verification_success",
            AuditKind::VerificationFailed => "mfa_verification_failed",
            AuditKind::BackupCodeUsed => "mfa_backup_code_used",
            AuditKind::BackupCodesRegenerated => "mfa_backup_codes_regenerated",
            AuditKind::RateLimited => "mfa_rate_limited",
            AuditKind::Disabled => "mfa_disabled",
        }
    }
}

/// One audit entry.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub account_id: String,
    pub metadata: Value,
}

impl AuditEvent {
    /// Create an event with no metadata.
    #[must_use]
    pub fn new(kind: AuditKind, account_id: impl Into<String>) -> Self {
        Self {
            kind,
            account_id: account_id.into(),
            metadata: Value::Null,
        }
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Trait for the external audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Emit one event. Implementations should be fast; this sits on the
    /// verification path.
    async fn emit(&self, event: AuditEvent) -> Result<()>;
}

/// Sink that writes events to the `tracing` stream and keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<()> {
        tracing::info!(
            target: "mfa.audit",
            event = event.kind.name(),
            account_id = %event.account_id,
            metadata = %event.metadata,
            "audit event"
        );
        Ok(())
    }
}
