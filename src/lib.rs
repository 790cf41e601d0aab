//! Keystep - a multi-factor authentication core
//!
//! Keystep covers the security-sensitive slice of an authentication flow:
//! TOTP secret issuance, time-window-tolerant code verification, encryption
//! of secrets and recovery codes at rest, single-use backup codes, and
//! failure-based rate limiting with temporary lockout.
//!
//! Everything around it stays external: persistence, audit delivery, and
//! configuration are traits and structs the caller supplies. The crate
//! produces raw data (seed, provisioning URI, backup codes) and never
//! renders QR images, sends email, or speaks HTTP. Session issuance,
//! password hashing, and role evaluation are out of scope; the service
//! assumes a password-verified caller.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use keystep::{MasterKey, MfaConfig, MfaService, TracingAuditSink};
//!
//! keystep::init_tracing();
//!
//! let service = MfaService::new(
//!     MasterKey::from_base64(&std::env::var("MFA_MASTER_KEY")?)?,
//!     MfaConfig::new("MyApp"),
//!     my_settings_store,   // impl keystep::SettingsStore
//!     my_failure_ledger,   // impl keystep::FailureLedger
//!     TracingAuditSink,
//! );
//!
//! let setup = service.setup("user-123").await?;
//! service.enable("user-123", &code).await?;
//! let outcome = service.verify("user-123", &submitted, Some(client_ip)).await?;
//! ```

pub mod audit;
pub mod backup;
mod config;
pub mod crypto;
mod error;
pub mod ratelimit;
pub mod service;
pub mod storage;
pub mod testing;
pub mod totp;

// Re-exports for public API
pub use audit::{AuditEvent, AuditKind, AuditSink, TracingAuditSink};
pub use backup::{BackupCodeEntry, BackupCodeGenerator, ConsumeResult};
pub use config::MfaConfig;
pub use crypto::{CryptoBox, Envelope, MasterKey};
pub use error::{MfaError, Result};
pub use ratelimit::{
    FailureKind, FailureLedger, FailureRecord, RateLimitDecision, RateLimitPolicy, RateLimiter,
};
pub use service::{MfaService, MfaSetup, MfaState, MfaStatus, Verification, VerifyMethod};
pub use storage::{MfaSettings, SettingsStore};
pub use totp::{TotpConfig, TotpEngine};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call early in your application, before constructing the service.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "keystep=debug")
/// - `KEYSTEP_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("KEYSTEP_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
