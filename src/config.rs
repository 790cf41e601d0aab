use crate::backup::BackupCodeGenerator;
use crate::ratelimit::RateLimitPolicy;
use crate::totp::TotpConfig;

/// Top-level configuration for [`MfaService`](crate::MfaService).
///
/// Passed explicitly at construction; business logic never reads the process
/// environment. The master encryption key is supplied separately as a
/// [`MasterKey`](crate::MasterKey).
#[derive(Clone, Debug, Default)]
pub struct MfaConfig {
    pub totp: TotpConfig,
    pub backup_codes: BackupCodeGenerator,
    pub rate_limit: RateLimitPolicy,
}

impl MfaConfig {
    /// Create a config with the given issuer name and defaults elsewhere.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            totp: TotpConfig::new(issuer),
            ..Default::default()
        }
    }

    /// Replace the TOTP settings.
    #[must_use]
    pub fn totp(mut self, totp: TotpConfig) -> Self {
        self.totp = totp;
        self
    }

    /// Replace the backup-code settings.
    #[must_use]
    pub fn backup_codes(mut self, backup_codes: BackupCodeGenerator) -> Self {
        self.backup_codes = backup_codes;
        self
    }

    /// Replace the rate-limit policy.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}
